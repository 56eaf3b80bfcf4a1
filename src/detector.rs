//! Readiness detection state machine.
//!
//! Combines literal marker matching with silence detection to decide when
//! the supervised runtime has finished its first-time setup.
//!
//! ## State machine
//!
//! ```text
//! WAITING     → marker line seen              → DETECTED
//! DETECTED    → next tick                     → STABILIZING
//! STABILIZING → N consecutive quiet ticks     → CONFIRMED
//! CONFIRMED   → artifact missing (reset)      → WAITING
//! ```
//!
//! Any output line restarts the quiet window. A tick that is not quiet
//! clears the consecutive-observation count but never moves the state back.

use std::time::{Duration, Instant};

use crate::output::OutputLine;

/// Literal substring matcher over output lines.
#[derive(Debug, Clone)]
pub struct ReadinessDetector {
    markers: Vec<String>,
}

impl ReadinessDetector {
    /// Empty markers are dropped; they would match every line.
    pub fn new<I, S>(markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            markers: markers
                .into_iter()
                .map(Into::into)
                .filter(|m: &String| !m.is_empty())
                .collect(),
        }
    }

    pub fn markers(&self) -> &[String] {
        &self.markers
    }

    /// The first configured marker contained in `line`, if any.
    pub fn find(&self, line: &str) -> Option<&str> {
        self.markers
            .iter()
            .find(|m| line.contains(m.as_str()))
            .map(String::as_str)
    }

    pub fn scan(&self, line: &str) -> bool {
        self.find(line).is_some()
    }
}

/// Tracks time since the last output line.
#[derive(Debug, Clone)]
pub struct QuiescenceTimer {
    last_output_time: Instant,
}

impl QuiescenceTimer {
    pub fn new(start: Instant) -> Self {
        Self {
            last_output_time: start,
        }
    }

    pub fn observe(&mut self, at: Instant) {
        if at > self.last_output_time {
            self.last_output_time = at;
        }
    }

    pub fn last_output_time(&self) -> Instant {
        self.last_output_time
    }

    pub fn quiet_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_output_time)
    }

    pub fn is_stable(&self, now: Instant, quiet: Duration) -> bool {
        self.quiet_for(now) >= quiet
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessState {
    /// No marker seen yet (or reset after a failed verification).
    Waiting,
    /// A marker was seen; stability not yet evaluated.
    Detected,
    /// Counting consecutive quiet observations.
    Stabilizing { observations: u32 },
    /// Quiet long enough; awaiting artifact verification.
    Confirmed,
}

/// What a single input did to the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessEvent {
    MarkerDetected { marker: String },
    Confirmed { quiet_for: Duration },
}

/// Pure readiness tracker: no I/O, time is always passed in.
#[derive(Debug, Clone)]
pub struct ReadinessTracker {
    state: ReadinessState,
    detector: ReadinessDetector,
    timer: QuiescenceTimer,
    quiet_period: Duration,
    required_observations: u32,
}

impl ReadinessTracker {
    pub fn new(
        detector: ReadinessDetector,
        quiet_period: Duration,
        required_observations: u32,
        start: Instant,
    ) -> Self {
        Self {
            state: ReadinessState::Waiting,
            detector,
            timer: QuiescenceTimer::new(start),
            quiet_period,
            required_observations: required_observations.max(1),
        }
    }

    pub fn state(&self) -> ReadinessState {
        self.state
    }

    pub fn timer(&self) -> &QuiescenceTimer {
        &self.timer
    }

    /// Feed one output line, in emission order.
    pub fn on_line(&mut self, line: &OutputLine) -> Option<ReadinessEvent> {
        self.timer.observe(line.at);

        match self.state {
            ReadinessState::Waiting => {
                let marker = self.detector.find(&line.text)?.to_string();
                self.state = ReadinessState::Detected;
                Some(ReadinessEvent::MarkerDetected { marker })
            }
            ReadinessState::Stabilizing { .. } => {
                self.state = ReadinessState::Stabilizing { observations: 0 };
                None
            }
            ReadinessState::Detected | ReadinessState::Confirmed => None,
        }
    }

    /// Periodic observation of the quiet window.
    pub fn tick(&mut self, now: Instant) -> Option<ReadinessEvent> {
        let observations = match self.state {
            ReadinessState::Waiting | ReadinessState::Confirmed => return None,
            ReadinessState::Detected => 0,
            ReadinessState::Stabilizing { observations } => observations,
        };

        if !self.timer.is_stable(now, self.quiet_period) {
            self.state = ReadinessState::Stabilizing { observations: 0 };
            return None;
        }

        let observations = observations + 1;
        if observations >= self.required_observations {
            self.state = ReadinessState::Confirmed;
            Some(ReadinessEvent::Confirmed {
                quiet_for: self.timer.quiet_for(now),
            })
        } else {
            self.state = ReadinessState::Stabilizing { observations };
            None
        }
    }

    /// Drop back to `Waiting` after verification found no artifact.
    pub fn reset(&mut self) {
        self.state = ReadinessState::Waiting;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::Stream;
    use proptest::prelude::*;

    fn line(text: &str, at: Instant) -> OutputLine {
        OutputLine {
            text: text.to_string(),
            stream: Stream::Stdout,
            at,
        }
    }

    fn default_detector() -> ReadinessDetector {
        ReadinessDetector::new(["To see the GUI go to:", "http://127.0.0.1:8188"])
    }

    fn tracker(quiet_secs: u64, required: u32, start: Instant) -> ReadinessTracker {
        ReadinessTracker::new(
            default_detector(),
            Duration::from_secs(quiet_secs),
            required,
            start,
        )
    }

    #[test]
    fn scan_matches_exact_substring() {
        let d = default_detector();
        assert!(d.scan("To see the GUI go to: http://127.0.0.1:8188"));
        assert!(d.scan("Starting server at http://127.0.0.1:8188/"));
        assert!(!d.scan("to see the gui go to:"));
        assert!(!d.scan("http://127.0.0.1:8189"));
    }

    #[test]
    fn find_returns_first_configured_hit() {
        let d = default_detector();
        assert_eq!(
            d.find("To see the GUI go to: http://127.0.0.1:8188"),
            Some("To see the GUI go to:")
        );
    }

    #[test]
    fn empty_markers_are_ignored() {
        let d = ReadinessDetector::new(["", "ready"]);
        assert_eq!(d.markers(), &["ready".to_string()]);
        assert!(!d.scan("anything at all"));
    }

    #[test]
    fn starts_waiting_and_ignores_plain_output() {
        let t0 = Instant::now();
        let mut t = tracker(5, 1, t0);
        assert_eq!(t.state(), ReadinessState::Waiting);
        assert!(t.on_line(&line("Loading model...", t0)).is_none());
        assert_eq!(t.tick(t0 + Duration::from_secs(60)), None);
        assert_eq!(t.state(), ReadinessState::Waiting);
    }

    #[test]
    fn marker_moves_to_detected() {
        let t0 = Instant::now();
        let mut t = tracker(5, 1, t0);
        let event = t.on_line(&line("To see the GUI go to: http://127.0.0.1:8188", t0));
        assert_eq!(
            event,
            Some(ReadinessEvent::MarkerDetected {
                marker: "To see the GUI go to:".to_string()
            })
        );
        assert_eq!(t.state(), ReadinessState::Detected);
    }

    #[test]
    fn repeated_markers_are_no_ops() {
        let t0 = Instant::now();
        let mut t = tracker(5, 1, t0);
        t.on_line(&line("http://127.0.0.1:8188", t0));
        assert!(t.on_line(&line("http://127.0.0.1:8188", t0)).is_none());
        assert_eq!(t.state(), ReadinessState::Detected);
    }

    #[test]
    fn confirms_after_quiet_period() {
        let t0 = Instant::now();
        let mut t = tracker(5, 1, t0);
        t.on_line(&line("http://127.0.0.1:8188", t0));

        assert!(t.tick(t0 + Duration::from_secs(4)).is_none());
        assert_eq!(t.state(), ReadinessState::Stabilizing { observations: 0 });

        let event = t.tick(t0 + Duration::from_secs(5));
        assert!(matches!(event, Some(ReadinessEvent::Confirmed { .. })));
        assert_eq!(t.state(), ReadinessState::Confirmed);
    }

    #[test]
    fn later_output_delays_stability() {
        let t0 = Instant::now();
        let mut t = tracker(5, 1, t0);
        t.on_line(&line("http://127.0.0.1:8188", t0));
        t.on_line(&line("Prompt executed", t0 + Duration::from_secs(4)));

        assert!(t.tick(t0 + Duration::from_secs(5)).is_none());
        assert!(t.tick(t0 + Duration::from_millis(8900)).is_none());
        assert!(t.tick(t0 + Duration::from_secs(9)).is_some());
    }

    #[test]
    fn requires_consecutive_observations() {
        let t0 = Instant::now();
        let mut t = tracker(1, 3, t0);
        t.on_line(&line("http://127.0.0.1:8188", t0));

        assert!(t.tick(t0 + Duration::from_secs(1)).is_none());
        assert!(t.tick(t0 + Duration::from_secs(2)).is_none());
        assert_eq!(t.state(), ReadinessState::Stabilizing { observations: 2 });

        // A new line breaks the streak.
        t.on_line(&line("late output", t0 + Duration::from_secs(2)));
        assert_eq!(t.state(), ReadinessState::Stabilizing { observations: 0 });

        assert!(t.tick(t0 + Duration::from_secs(3)).is_none());
        assert!(t.tick(t0 + Duration::from_secs(4)).is_none());
        assert!(t.tick(t0 + Duration::from_secs(5)).is_some());
    }

    #[test]
    fn reset_returns_to_waiting() {
        let t0 = Instant::now();
        let mut t = tracker(0, 1, t0);
        t.on_line(&line("http://127.0.0.1:8188", t0));
        t.tick(t0);
        assert_eq!(t.state(), ReadinessState::Confirmed);

        t.reset();
        assert_eq!(t.state(), ReadinessState::Waiting);
        assert!(t.tick(t0 + Duration::from_secs(10)).is_none());
    }

    #[test]
    fn zero_required_observations_behaves_like_one() {
        let t0 = Instant::now();
        let mut t = tracker(1, 0, t0);
        t.on_line(&line("http://127.0.0.1:8188", t0));
        assert!(t.tick(t0 + Duration::from_secs(1)).is_some());
    }

    #[test]
    fn timer_ignores_out_of_order_timestamps() {
        let t0 = Instant::now();
        let mut timer = QuiescenceTimer::new(t0);
        timer.observe(t0 + Duration::from_secs(3));
        timer.observe(t0 + Duration::from_secs(1));
        assert_eq!(timer.last_output_time(), t0 + Duration::from_secs(3));
        assert!(timer.is_stable(t0 + Duration::from_secs(8), Duration::from_secs(5)));
        assert!(!timer.is_stable(t0 + Duration::from_secs(7), Duration::from_secs(5)));
    }

    proptest! {
        // A line at `gap` seconds after the marker pushes confirmation to
        // exactly `gap + quiet`.
        #[test]
        fn stability_needs_contiguous_silence(gap in 0u64..20, quiet in 1u64..10) {
            let t0 = Instant::now();
            let mut t = tracker(quiet, 1, t0);
            t.on_line(&line("http://127.0.0.1:8188", t0));
            t.on_line(&line("more output", t0 + Duration::from_secs(gap)));

            let just_before = t0 + Duration::from_secs(gap + quiet) - Duration::from_millis(1);
            prop_assert!(t.tick(just_before).is_none());
            prop_assert!(t.tick(t0 + Duration::from_secs(gap + quiet)).is_some());
        }
    }
}
