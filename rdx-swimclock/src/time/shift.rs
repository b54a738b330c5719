/// A per-invocation offset added to the clock time.
///
/// Each iteration of a runner gets its own `TimeShift`, so "sleeping" inside a
/// function body only moves that body's notion of now.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TimeShift {
    seconds: f64,
}

impl TimeShift {
    pub const ZERO: TimeShift = TimeShift { seconds: 0.0 };

    pub fn new(seconds: f64) -> Self {
        Self { seconds }
    }

    pub fn seconds(&self) -> f64 {
        self.seconds
    }

    pub fn add_seconds(&mut self, seconds: f64) {
        self.seconds += seconds;
    }

    pub fn add_beats(&mut self, beats: f64, beat_duration: f64) {
        self.seconds += beats * beat_duration;
    }

    pub fn reset(&mut self) {
        self.seconds = 0.0;
    }

    /// Shifts a clock time.
    pub fn apply(&self, time: f64) -> f64 {
        time + self.seconds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shift_accumulates_and_resets() {
        let mut shift = TimeShift::default();
        shift.add_beats(2.0, 0.5);
        shift.add_seconds(0.25);
        assert_eq!(shift.apply(10.0), 11.25);
        shift.reset();
        assert_eq!(shift, TimeShift::ZERO);
    }
}
