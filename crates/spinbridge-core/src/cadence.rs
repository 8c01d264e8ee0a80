//! Crank cadence from successive CSC samples.

use spinbridge_types::CrankSample;

/// Event time units per second in the CSC profile.
const TICKS_PER_SECOND: f64 = 1024.0;

/// Rollover-aware cadence calculator for one device connection.
///
/// Both CSC crank counters are 16-bit registers, so deltas are taken with
/// wrapping subtraction. Every sample becomes the new baseline, whether or
/// not it produced a cadence value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CadenceTracker {
    last: Option<CrankSample>,
}

impl CadenceTracker {
    /// A tracker with no baseline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a crank sample, returning cadence in rpm when a delta is available.
    ///
    /// Returns `None` for the first sample after a reset and for samples
    /// whose event time did not advance.
    pub fn update(&mut self, sample: CrankSample) -> Option<u16> {
        let previous = self.last.replace(sample)?;

        let rev_delta = sample.revolutions.wrapping_sub(previous.revolutions);
        let time_delta = sample.event_time.wrapping_sub(previous.event_time);
        if time_delta == 0 {
            return None;
        }

        let rpm = f64::from(rev_delta) / f64::from(time_delta) * TICKS_PER_SECOND * 60.0;
        Some(rpm.round().min(f64::from(u16::MAX)) as u16)
    }

    /// Forget the baseline. Called on every disconnect.
    pub fn reset(&mut self) {
        self.last = None;
    }

    /// Whether a baseline sample is stored.
    pub fn has_baseline(&self) -> bool {
        self.last.is_some()
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Deltas are always taken modulo 2^16.
        #[test]
        fn cadence_matches_wrapped_deltas(
            prev_revs in any::<u16>(),
            prev_time in any::<u16>(),
            revs_step in 0u16..8,
            time_step in 1u16..=4096,
        ) {
            let mut tracker = CadenceTracker::new();
            tracker.update(CrankSample { revolutions: prev_revs, event_time: prev_time });
            let rpm = tracker.update(CrankSample {
                revolutions: prev_revs.wrapping_add(revs_step),
                event_time: prev_time.wrapping_add(time_step),
            });
            let expected = (f64::from(revs_step) / f64::from(time_step) * 1024.0 * 60.0).round();
            prop_assert_eq!(rpm, Some(expected.min(f64::from(u16::MAX)) as u16));
        }
    }
}
