// weatherlink_bridge - WeatherLink v2 API to time-series archive bridge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

use std::collections::HashMap;

/// Daily counters turned into per-poll deltas. The rain-only station shares
/// the primary rain counter with the primary transmitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    RainPrimary,
    RainSecondary,
    EtPrimary,
    EtSecondary,
}

#[derive(Debug, Default)]
struct AccumulatorState {
    previous: f64,
    initialized: bool,
}

/// Per-session delta state for the "since local midnight" API counters.
///
/// Counters reset at the station's local midnight, which this process cannot
/// observe directly; a drop in the raw value is interpreted as either a
/// midnight reset (the new daily total is the delta) or noise (delta 0).
#[derive(Debug, Default)]
pub struct DeltaTrackers {
    states: HashMap<Counter, AccumulatorState>,
}

impl DeltaTrackers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delta for a rain counter. The first observed value initializes the
    /// tracker and emits 0.
    pub fn rain_delta(&mut self, counter: Counter, value: f64) -> f64 {
        let state = self.states.entry(counter).or_default();
        if !state.initialized {
            state.previous = value;
            state.initialized = true;
            return 0.0;
        }

        let raw = value - state.previous;
        let delta = if raw >= 0.0 {
            raw
        } else if (raw - value) < 0.0 && raw.abs() > value {
            // Counter went down by more than the new total: a midnight
            // reset, so everything accumulated since is the new total.
            value
        } else {
            0.0
        };

        if delta > 0.0 {
            tracing::debug!(
                message = "rain counter delta",
                counter = ?counter,
                previous = state.previous,
                value,
                delta,
            );
        }

        state.previous = value;
        delta
    }

    /// Delta for an evapotranspiration counter. Negative deltas clamp to 0;
    /// the first observed value initializes the tracker and emits 0.
    pub fn et_delta(&mut self, counter: Counter, value: f64) -> f64 {
        let state = self.states.entry(counter).or_default();
        if !state.initialized {
            state.previous = value;
            state.initialized = true;
            return 0.0;
        }

        let raw = value - state.previous;
        state.previous = value;
        raw.max(0.0)
    }
}

/// Celsius heating degree-days from the API's Fahrenheit daily value,
/// using the station firmware's own conversion.
pub fn heating_degree_c(degree_day_f: f64) -> f64 {
    if degree_day_f > 0.0 {
        18.0 - ((65.0 - degree_day_f - 32.0) * 5.0 / 9.0)
    } else {
        0.0
    }
}

/// Celsius cooling degree-days, same scheme as [`heating_degree_c`].
pub fn cooling_degree_c(degree_day_f: f64) -> f64 {
    if degree_day_f > 0.0 {
        18.0 + ((65.0 + degree_day_f - 32.0) * 5.0 / 9.0)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPSILON: f64 = 1e-9;

    #[test]
    fn rain_first_value_initializes_and_emits_zero() {
        let mut trackers = DeltaTrackers::new();
        assert_eq!(0.0, trackers.rain_delta(Counter::RainPrimary, 0.12));
    }

    #[test]
    fn rain_increase_emits_difference() {
        let mut trackers = DeltaTrackers::new();
        trackers.rain_delta(Counter::RainPrimary, 9.5);

        let delta = trackers.rain_delta(Counter::RainPrimary, 9.6);
        assert!((delta - 0.1).abs() < EPSILON);
    }

    #[test]
    fn rain_midnight_reset_emits_new_total() {
        // 9.5 -> 0.2 looks like a reset: the counter dropped by far more
        // than the new daily total, so 0.2 fell since midnight.
        let mut trackers = DeltaTrackers::new();
        trackers.rain_delta(Counter::RainPrimary, 9.5);

        let delta = trackers.rain_delta(Counter::RainPrimary, 0.2);
        assert!((delta - 0.2).abs() < EPSILON);
    }

    #[test]
    fn rain_small_backwards_step_emits_zero() {
        // 9.5 -> 9.4 is a glitch, not a reset.
        let mut trackers = DeltaTrackers::new();
        trackers.rain_delta(Counter::RainPrimary, 9.5);
        assert_eq!(0.0, trackers.rain_delta(Counter::RainPrimary, 9.4));
    }

    #[test]
    fn rain_counters_are_independent() {
        let mut trackers = DeltaTrackers::new();
        trackers.rain_delta(Counter::RainPrimary, 1.0);
        trackers.rain_delta(Counter::RainSecondary, 5.0);

        let primary = trackers.rain_delta(Counter::RainPrimary, 1.5);
        let secondary = trackers.rain_delta(Counter::RainSecondary, 5.0);
        assert!((primary - 0.5).abs() < EPSILON);
        assert_eq!(0.0, secondary);
    }

    #[test]
    fn et_negative_delta_clamps_to_zero() {
        let mut trackers = DeltaTrackers::new();
        trackers.et_delta(Counter::EtPrimary, 0.08);
        assert_eq!(0.0, trackers.et_delta(Counter::EtPrimary, 0.05));

        // Previous value still advanced to the clamped observation.
        let next = trackers.et_delta(Counter::EtPrimary, 0.07);
        assert!((next - 0.02).abs() < EPSILON);
    }

    #[test]
    fn heating_degree_conversion() {
        assert_eq!(0.0, heating_degree_c(0.0));
        assert_eq!(0.0, heating_degree_c(-1.0));

        // 18 - ((65 - 2 - 32) * 5/9)
        let converted = heating_degree_c(2.0);
        assert!((converted - (18.0 - 31.0 * 5.0 / 9.0)).abs() < EPSILON);
    }

    #[test]
    fn cooling_degree_conversion() {
        assert_eq!(0.0, cooling_degree_c(0.0));

        // 18 + ((65 + 2 - 32) * 5/9)
        let converted = cooling_degree_c(2.0);
        assert!((converted - (18.0 + 35.0 * 5.0 / 9.0)).abs() < EPSILON);
    }
}
