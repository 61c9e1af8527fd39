// ProgressTracker - turns noisy resolver callbacks into a clean event stream
//
// One tracker per task. Guarantees:
// - fraction_complete never decreases
// - Finished/Failed is emitted exactly once and is the last event
// - bursts of insignificant Downloading updates are coalesced; the latest
//   suppressed one is kept and released by `flush_at` once the window closes

use std::time::{Duration, Instant};

use super::config::TrackerConfig;
use super::models::{ProgressEvent, ProgressPhase, RawPhase, RawProgress};

#[derive(Debug)]
pub struct ProgressTracker {
    config: TrackerConfig,
    /// Highest fraction ever emitted; the clamp floor
    high_water: Option<f64>,
    last_phase: Option<ProgressPhase>,
    /// Fraction carried by the last emitted Downloading event
    last_fraction: Option<f64>,
    last_emit: Option<Instant>,
    /// Latest Downloading update swallowed by coalescing
    pending: Option<ProgressEvent>,
    terminal: bool,
}

impl ProgressTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            high_water: None,
            last_phase: None,
            last_fraction: None,
            last_emit: None,
            pending: None,
            terminal: false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    pub fn coalesce_window(&self) -> Duration {
        self.config.coalesce_window()
    }

    /// Started event, emitted once before any resolver callback
    pub fn start(&mut self) -> Option<ProgressEvent> {
        if self.terminal || self.last_phase.is_some() {
            return None;
        }
        self.last_phase = Some(ProgressPhase::Started);
        self.last_emit = Some(Instant::now());
        Some(ProgressEvent {
            fraction_complete: Some(0.0),
            ..ProgressEvent::new(ProgressPhase::Started)
        })
    }

    pub fn consume(&mut self, raw: RawProgress) -> Option<ProgressEvent> {
        self.consume_at(raw, Instant::now())
    }

    /// Same as [`consume`](Self::consume) with an explicit clock
    pub fn consume_at(&mut self, raw: RawProgress, now: Instant) -> Option<ProgressEvent> {
        if self.terminal {
            return None;
        }

        match raw.phase {
            RawPhase::Finished => {
                self.terminal = true;
                self.pending = None;
                self.high_water = Some(1.0);
                Some(ProgressEvent {
                    fraction_complete: Some(1.0),
                    transfer_rate_bytes_per_sec: finite(raw.rate),
                    ..ProgressEvent::new(ProgressPhase::Finished)
                })
            }
            RawPhase::Error(message) => {
                self.terminal = true;
                self.pending = None;
                Some(ProgressEvent {
                    fraction_complete: self.high_water,
                    message: Some(message),
                    ..ProgressEvent::new(ProgressPhase::Failed)
                })
            }
            RawPhase::Transcoding => {
                if self.last_phase == Some(ProgressPhase::Transcoding) {
                    return None;
                }
                Some(self.emit(ProgressEvent::new(ProgressPhase::Transcoding), now))
            }
            RawPhase::Downloading => self.downloading(raw, now),
        }
    }

    pub fn flush(&mut self) -> Option<ProgressEvent> {
        self.flush_at(Instant::now())
    }

    /// Release the update held back by coalescing once the window has
    /// closed, so a stalled transfer still shows where it stopped.
    pub fn flush_at(&mut self, now: Instant) -> Option<ProgressEvent> {
        if self.terminal || !self.window_elapsed(now) {
            return None;
        }
        let event = self.pending.take()?;
        if let Some(f) = event.fraction_complete {
            self.high_water = Some(f);
        }
        self.last_fraction = event.fraction_complete;
        Some(self.emit(event, now))
    }

    fn window_elapsed(&self, now: Instant) -> bool {
        self.last_emit
            .map_or(true, |at| now.saturating_duration_since(at) >= self.config.coalesce_window())
    }

    fn downloading(&mut self, raw: RawProgress, now: Instant) -> Option<ProgressEvent> {
        let fraction = raw
            .total
            .filter(|t| t.is_finite() && *t > 0.0)
            .map(|total| (raw.downloaded as f64 / total).clamp(0.0, 1.0))
            .map(|f| f.max(self.high_water.unwrap_or(0.0)));

        let window_elapsed = self.window_elapsed(now);

        let emit = if self.last_phase != Some(ProgressPhase::Downloading) {
            true
        } else {
            match (fraction, self.last_fraction) {
                (Some(current), Some(previous)) => {
                    current - previous >= self.config.min_fraction_delta || window_elapsed
                }
                // Determinate/indeterminate switch is always worth reporting
                (Some(_), None) | (None, Some(_)) => true,
                (None, None) => window_elapsed,
            }
        };

        let event = ProgressEvent {
            fraction_complete: fraction,
            transfer_rate_bytes_per_sec: finite(raw.rate),
            ..ProgressEvent::new(ProgressPhase::Downloading)
        };

        if !emit {
            self.pending = Some(event);
            return None;
        }

        if let Some(f) = fraction {
            self.high_water = Some(f);
        }
        self.last_fraction = fraction;

        Some(self.emit(event, now))
    }

    fn emit(&mut self, event: ProgressEvent, now: Instant) -> ProgressEvent {
        self.last_phase = Some(event.phase);
        self.last_emit = Some(now);
        self.pending = None;
        event
    }
}

fn finite(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite() && *v >= 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> ProgressTracker {
        ProgressTracker::new(TrackerConfig::default())
    }

    fn fractions(events: &[ProgressEvent]) -> Vec<Option<f64>> {
        events.iter().map(|e| e.fraction_complete).collect()
    }

    #[test]
    fn test_regressive_callback_is_not_forwarded_as_decrease() {
        let mut t = tracker();
        let now = Instant::now();
        let raws = vec![
            RawProgress::downloading(10, Some(100.0), None),
            RawProgress::downloading(5, Some(100.0), None),
            RawProgress::downloading(50, Some(100.0), None),
            RawProgress::finished(),
        ];

        let events: Vec<ProgressEvent> = raws
            .into_iter()
            .filter_map(|r| t.consume_at(r, now))
            .collect();

        assert_eq!(fractions(&events), vec![Some(0.10), Some(0.50), Some(1.0)]);
        assert_eq!(events.last().unwrap().phase, ProgressPhase::Finished);
    }

    #[test]
    fn test_regression_after_window_is_clamped() {
        let mut t = tracker();
        let start = Instant::now();
        t.consume_at(RawProgress::downloading(40, Some(100.0), None), start);
        let event = t
            .consume_at(
                RawProgress::downloading(20, Some(100.0), Some(1000.0)),
                start + Duration::from_secs(1),
            )
            .unwrap();
        assert_eq!(event.fraction_complete, Some(0.40));
        assert_eq!(event.transfer_rate_bytes_per_sec, Some(1000.0));
    }

    #[test]
    fn test_bursts_are_coalesced() {
        let mut t = tracker();
        let start = Instant::now();
        let total = Some(1_000_000.0);

        assert!(t.consume_at(RawProgress::downloading(100_000, total, None), start).is_some());
        // +0.01% inside the window
        assert!(t
            .consume_at(RawProgress::downloading(100_100, total, None), start + Duration::from_millis(10))
            .is_none());
        // Meaningful change passes immediately
        assert!(t
            .consume_at(RawProgress::downloading(200_000, total, None), start + Duration::from_millis(20))
            .is_some());
        // Insignificant change after the window passes as a refresh
        assert!(t
            .consume_at(RawProgress::downloading(200_050, total, None), start + Duration::from_secs(1))
            .is_some());
    }

    #[test]
    fn test_missing_or_non_finite_total_is_indeterminate() {
        let now = Instant::now();
        for total in [None, Some(f64::NAN), Some(f64::INFINITY), Some(0.0)] {
            let mut t = tracker();
            let event = t.consume_at(RawProgress::downloading(500, total, None), now).unwrap();
            assert_eq!(event.phase, ProgressPhase::Downloading);
            assert_eq!(event.fraction_complete, None);
        }
    }

    #[test]
    fn test_finished_without_prior_downloading() {
        let mut t = tracker();
        let event = t.consume(RawProgress::finished()).unwrap();
        assert_eq!(event.phase, ProgressPhase::Finished);
        assert_eq!(event.fraction_complete, Some(1.0));
        assert!(t.is_terminal());
    }

    #[test]
    fn test_error_is_terminal() {
        let mut t = tracker();
        t.consume(RawProgress::downloading(30, Some(100.0), None));
        let failed = t.consume(RawProgress::error("HTTP Error 403")).unwrap();
        assert_eq!(failed.phase, ProgressPhase::Failed);
        assert_eq!(failed.message.as_deref(), Some("HTTP Error 403"));
        assert_eq!(failed.fraction_complete, Some(0.30));

        assert!(t.consume(RawProgress::downloading(90, Some(100.0), None)).is_none());
        assert!(t.consume(RawProgress::finished()).is_none());
    }

    #[test]
    fn test_transcoding_reported_once() {
        let mut t = tracker();
        t.consume(RawProgress::downloading(100, Some(100.0), None));
        assert_eq!(
            t.consume(RawProgress::transcoding()).map(|e| e.phase),
            Some(ProgressPhase::Transcoding)
        );
        assert!(t.consume(RawProgress::transcoding()).is_none());
        assert_eq!(
            t.consume(RawProgress::finished()).map(|e| e.phase),
            Some(ProgressPhase::Finished)
        );
    }

    #[test]
    fn test_fractions_non_decreasing_over_noisy_sequence() {
        let mut t = tracker();
        let start = Instant::now();
        let downloaded = [5u64, 3, 9, 9, 2, 40, 38, 41, 100, 70];
        let mut last = 0.0;

        for (i, d) in downloaded.iter().enumerate() {
            let at = start + Duration::from_millis(i as u64 * 300);
            if let Some(f) = t
                .consume_at(RawProgress::downloading(*d, Some(100.0), None), at)
                .and_then(|e| e.fraction_complete)
            {
                assert!(f >= last, "{} dropped below {}", f, last);
                last = f;
            }
        }
    }

    #[test]
    fn test_suppressed_update_is_flushed_after_window() {
        let mut t = tracker();
        let start = Instant::now();
        let total = Some(1_000_000.0);

        t.consume_at(RawProgress::downloading(100_000, total, None), start);
        assert!(t
            .consume_at(RawProgress::downloading(100_500, total, Some(2048.0)), start + Duration::from_millis(10))
            .is_none());

        // Window still open
        assert!(t.flush_at(start + Duration::from_millis(100)).is_none());

        let flushed = t.flush_at(start + Duration::from_secs(1)).unwrap();
        assert_eq!(flushed.phase, ProgressPhase::Downloading);
        assert_eq!(flushed.fraction_complete, Some(0.1005));
        assert_eq!(flushed.transfer_rate_bytes_per_sec, Some(2048.0));

        // Nothing left to release
        assert!(t.flush_at(start + Duration::from_secs(5)).is_none());
    }

    #[test]
    fn test_flush_after_terminal_is_empty() {
        let mut t = tracker();
        let start = Instant::now();
        let total = Some(1_000_000.0);

        t.consume_at(RawProgress::downloading(100_000, total, None), start);
        t.consume_at(RawProgress::downloading(100_500, total, None), start + Duration::from_millis(10));
        t.consume_at(RawProgress::finished(), start + Duration::from_millis(20));

        assert!(t.flush_at(start + Duration::from_secs(1)).is_none());
    }

    #[test]
    fn test_started_emitted_once() {
        let mut t = tracker();
        assert_eq!(t.start().map(|e| e.phase), Some(ProgressPhase::Started));
        assert!(t.start().is_none());
    }
}
