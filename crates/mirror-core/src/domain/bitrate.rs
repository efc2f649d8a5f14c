//! Bit-rate hysteresis per device.
//!
//! Encoders on flaky devices sometimes lower their bit rate mid-stream.  One
//! blip should not change anything, but a device that keeps struggling
//! should start future sessions at a lower bit rate instead of rediscovering
//! the problem every time.
//!
//! Each device identity gets a [`BitRateState`]:
//!
//! - Every reduction report at or below the current cap counts as one unit of
//!   evidence.  After [`REDUCTIONS_TO_LOWER_CAP`] units the cap drops to the
//!   reported rate and the counters reset.
//! - Every [`STABLE_OBSERVATIONS_PER_REDUCTION`] stable reports at or above
//!   the cap cancel one unit of reduction evidence.  Stability can build up
//!   credit; once the credit reaches [`REDUCTIONS_TO_LOWER_CAP`] units, an
//!   existing cap is lifted entirely.
//!
//! The two constants are empirical and part of the observable behaviour, so
//! they must not be tuned casually.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::info;

/// Reduction reports needed before the cap is lowered.
pub const REDUCTIONS_TO_LOWER_CAP: i32 = 3;

/// Stable reports that cancel one reduction report.
pub const STABLE_OBSERVATIONS_PER_REDUCTION: u32 = 21;

/// Hysteresis state for one device identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BitRateState {
    /// Recommended maximum bit rate; 0 means no override.
    #[serde(default)]
    pub current_cap: u32,
    /// Net reduction evidence.  Negative values are credit built up by
    /// stable reports.
    #[serde(default)]
    pub reduction_count: i32,
    /// Stable reports not yet exchanged for a reduction unit.
    #[serde(default)]
    pub stability_count: u32,
}

impl BitRateState {
    /// Records that the encoder reduced its bit rate to `rate`.
    ///
    /// Returns `true` if the cap changed.
    pub fn bit_rate_reduced(&mut self, rate: u32) -> bool {
        if self.current_cap != 0 && rate > self.current_cap {
            return false;
        }
        self.reduction_count += 1;
        if self.reduction_count >= REDUCTIONS_TO_LOWER_CAP {
            self.current_cap = rate;
            self.reset_counters();
            return true;
        }
        false
    }

    /// Records that the encoder held `rate` without reducing it.
    ///
    /// Returns `true` if the cap changed.
    pub fn bit_rate_stable(&mut self, rate: u32) -> bool {
        if rate < self.current_cap {
            return false;
        }
        self.stability_count += 1;
        if self.stability_count < STABLE_OBSERVATIONS_PER_REDUCTION {
            return false;
        }
        self.stability_count = 0;
        self.reduction_count -= 1;
        if self.reduction_count <= -REDUCTIONS_TO_LOWER_CAP {
            let had_cap = self.current_cap != 0;
            self.current_cap = 0;
            self.reset_counters();
            return had_cap;
        }
        false
    }

    fn reset_counters(&mut self) {
        self.reduction_count = 0;
        self.stability_count = 0;
    }
}

/// Thread-safe store of [`BitRateState`] keyed by device identity.
///
/// One instance is shared by every connection of a process.  It holds no
/// I/O; persistence goes through [`snapshot`](Self::snapshot) and
/// [`from_states`](Self::from_states).
#[derive(Debug, Default)]
pub struct BitRateManager {
    states: Mutex<HashMap<String, BitRateState>>,
}

impl BitRateManager {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-populated with previously saved states.
    pub fn from_states(states: impl IntoIterator<Item = (String, BitRateState)>) -> Self {
        Self {
            states: Mutex::new(states.into_iter().collect()),
        }
    }

    /// Records a bit-rate reduction reported for `device`.
    pub fn bit_rate_reduced(&self, rate: u32, device: &str) {
        let mut states = self.lock();
        let state = states.entry(device.to_string()).or_default();
        if state.bit_rate_reduced(rate) {
            info!(device, cap = rate, "bit rate cap lowered");
        }
    }

    /// Records a stable bit rate reported for `device`.
    ///
    /// Devices that never reported a reduction have nothing to offset and are
    /// not tracked.
    pub fn bit_rate_stable(&self, rate: u32, device: &str) {
        let mut states = self.lock();
        if let Some(state) = states.get_mut(device) {
            if state.bit_rate_stable(rate) {
                info!(device, "bit rate cap lifted");
            }
        }
    }

    /// Returns the recommended cap for `device`, or 0 for no override.
    pub fn get_bit_rate(&self, device: &str) -> u32 {
        self.lock().get(device).map_or(0, |s| s.current_cap)
    }

    /// Returns the full state for `device`, if any.
    pub fn state(&self, device: &str) -> Option<BitRateState> {
        self.lock().get(device).copied()
    }

    /// Returns a sorted copy of every tracked state, for persistence.
    pub fn snapshot(&self) -> BTreeMap<String, BitRateState> {
        self.lock()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, BitRateState>> {
        // The map holds plain counters; a panic mid-update cannot leave it
        // structurally broken, so a poisoned lock is still usable.
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
