// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Advertise target bookkeeping for one-way Angle-of-Arrival (OwR-AoA)
//! flows (§4.3): per-advertiser recent-measurement history and the
//! "is this device the pointed target" decision.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::address::UwbAddress;

/// One OwR-AoA measurement sample for an advertiser's address.
#[derive(Debug, Clone, Copy)]
pub struct OwrMeasurement {
    pub azimuth_deg: f32,
    pub observed_at: Instant,
}

/// Threshold on AoA spread and dwell duration that decides whether an
/// advertiser is being pointed at (§4.3: "the product-configured aiming
/// criterion").
#[derive(Debug, Clone, Copy)]
pub struct AimingCriterion {
    /// Maximum azimuth deviation, in degrees, from the most recent
    /// sample that every sample in the dwell window may have.
    pub azimuth_threshold_deg: f32,
    /// Minimum span of time the azimuth must have stayed within
    /// threshold before the advertiser counts as pointed.
    pub min_dwell: Duration,
}

impl Default for AimingCriterion {
    fn default() -> Self {
        Self { azimuth_threshold_deg: 10.0, min_dwell: Duration::from_millis(500) }
    }
}

/// Bounded recent-sample history for one advertiser.
#[derive(Debug, Clone, Default)]
struct AdvertiseTarget {
    samples: Vec<OwrMeasurement>,
}

const MAX_SAMPLES_PER_TARGET: usize = 32;

impl AdvertiseTarget {
    fn push(&mut self, sample: OwrMeasurement) {
        self.samples.push(sample);
        if self.samples.len() > MAX_SAMPLES_PER_TARGET {
            self.samples.remove(0);
        }
    }

    fn is_pointed(&self, criterion: &AimingCriterion) -> bool {
        let Some(latest) = self.samples.last() else {
            return false;
        };

        let in_window: Vec<&OwrMeasurement> = self
            .samples
            .iter()
            .rev()
            .take_while(|s| (s.azimuth_deg - latest.azimuth_deg).abs() <= criterion.azimuth_threshold_deg)
            .collect();

        match in_window.last() {
            Some(earliest) => latest.observed_at.duration_since(earliest.observed_at) >= criterion.min_dwell,
            None => false,
        }
    }
}

/// Tracks, per advertiser address, the recent OwR-AoA measurement
/// history used to decide pointing and to gate buffered data delivery.
#[derive(Debug, Clone, Default)]
pub struct AdvertiseTargetStore {
    targets: HashMap<UwbAddress, AdvertiseTarget>,
}

impl AdvertiseTargetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the most recent AoA sample for `addr` (§4.3).
    pub fn update(&mut self, addr: UwbAddress, measurement: OwrMeasurement) {
        self.targets.entry(addr).or_default().push(measurement);
    }

    /// Apply `criterion` to decide whether `addr` is currently being
    /// pointed at (§4.3). An address with no recorded samples is never
    /// pointed.
    pub fn is_pointed(&self, addr: UwbAddress, criterion: &AimingCriterion) -> bool {
        self.targets.get(&addr).is_some_and(|t| t.is_pointed(criterion))
    }

    /// Drop all history for `addr`, e.g. once buffered data has drained
    /// or the owning session has torn down (§4.3, §4.4.1).
    pub fn remove(&mut self, addr: UwbAddress) {
        self.targets.remove(&addr);
    }

    pub fn contains(&self, addr: UwbAddress) -> bool {
        self.targets.contains_key(&addr)
    }
}

#[cfg(test)]
#[path = "advertise_tests.rs"]
mod tests;
