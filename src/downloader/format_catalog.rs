// FormatCatalog - turns raw resolver metadata into an ordered list of formats
//
// Video: muxed mp4 entries (neither codec reported as "none"), best resolution first.
// Audio: audio-only entries (vcodec reported as "none"), best bitrate first.
// Entries missing a sort key stay in the list and sort last.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use super::models::{RawFormat, RawMetadata, StreamFormat, StreamKind};

/// Ordered view of the current fetch result for one kind
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FormatCatalog {
    kind: StreamKind,
    formats: Vec<StreamFormat>,
}

impl FormatCatalog {
    /// Derive the catalog for `kind`. Pure: same input, same output.
    pub fn derive(metadata: &RawMetadata, kind: StreamKind) -> Self {
        let mut formats: Vec<StreamFormat> = metadata
            .formats
            .iter()
            .filter(|f| Self::matches(f, kind))
            .map(|f| Self::to_stream_format(f, kind))
            .collect();

        // Stable sort keeps resolver order for full ties
        formats.sort_by(|a, b| match kind {
            StreamKind::Video => Self::compare_video(a, b),
            StreamKind::Audio => Self::compare_audio(a, b),
        });

        // Uniqueness by id within one result; first occurrence wins
        let mut seen = std::collections::HashSet::new();
        formats.retain(|f| seen.insert(f.id.clone()));

        Self { kind, formats }
    }

    pub fn empty(kind: StreamKind) -> Self {
        Self {
            kind,
            formats: Vec::new(),
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn formats(&self) -> &[StreamFormat] {
        &self.formats
    }

    pub fn len(&self) -> usize {
        self.formats.len()
    }

    /// True when the fetch succeeded but nothing matched the kind filter
    pub fn is_empty(&self) -> bool {
        self.formats.is_empty()
    }

    pub fn get(&self, format_id: &str) -> Option<&StreamFormat> {
        self.formats.iter().find(|f| f.id == format_id)
    }

    pub fn contains(&self, format_id: &str) -> bool {
        self.get(format_id).is_some()
    }

    fn matches(format: &RawFormat, kind: StreamKind) -> bool {
        match kind {
            StreamKind::Video => {
                format.has_video() && format.has_audio() && format.ext.eq_ignore_ascii_case("mp4")
            }
            StreamKind::Audio => format.is_audio_only(),
        }
    }

    fn to_stream_format(format: &RawFormat, kind: StreamKind) -> StreamFormat {
        StreamFormat {
            id: format.format_id.clone(),
            kind,
            container: format.ext.clone(),
            height: format.height,
            frame_rate: format.fps.filter(|f| f.is_finite()),
            average_bitrate_kbps: format.abr.filter(|b| b.is_finite()),
            size: format.size(),
        }
    }

    /// Descending by height, then frame rate, then size
    fn compare_video(a: &StreamFormat, b: &StreamFormat) -> Ordering {
        b.height
            .cmp(&a.height)
            .then_with(|| desc_f64(a.frame_rate, b.frame_rate))
            .then_with(|| size_desc(a, b))
    }

    /// Descending by average bitrate, then size
    fn compare_audio(a: &StreamFormat, b: &StreamFormat) -> Ordering {
        desc_f64(a.average_bitrate_kbps, b.average_bitrate_kbps).then_with(|| size_desc(a, b))
    }
}

// None compares below every Some for Option<T>, so reversing puts it last
fn desc_f64(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => y.total_cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn size_desc(a: &StreamFormat, b: &StreamFormat) -> Ordering {
    b.size.map(|s| s.bytes()).cmp(&a.size.map(|s| s.bytes()))
}
