// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session manager configuration: per-protocol admission limits, buffer
//! capacities, and timer durations. The embedding application constructs
//! this directly — the core has no CLI surface (out of scope per
//! spec.md §1).

use std::collections::HashMap;
use std::time::Duration;

use crate::params::Protocol;

/// A chip identifier (multiple UWBS chips may be present on one device).
pub type ChipId = String;

/// Stack priority band (§3). Values are fixed by the specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct StackPriority(pub u8);

impl StackPriority {
    pub const BG: Self = Self(40);
    pub const FG: Self = Self(60);
    pub const SYSTEM: Self = Self(70);
    pub const CCC: Self = Self(80);
    pub const ALIRO: Self = Self(80);

    pub fn value(self) -> u8 {
        self.0
    }
}

/// Per-protocol session count ceilings for one chip (§4.5, `M[P,C]`).
#[derive(Debug, Clone, Copy)]
pub struct PerProtocolLimits {
    pub fira: usize,
    pub ccc: usize,
    pub aliro: usize,
}

impl PerProtocolLimits {
    pub fn limit_for(&self, protocol: Protocol) -> usize {
        match protocol {
            Protocol::Fira => self.fira,
            Protocol::Ccc => self.ccc,
            Protocol::Aliro => self.aliro,
        }
    }
}

impl Default for PerProtocolLimits {
    fn default() -> Self {
        Self { fira: 5, ccc: 1, aliro: 1 }
    }
}

/// Top-level configuration for a [`crate::SessionRegistry`].
#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
    /// Default per-protocol limits, used for any chip not present in
    /// `per_chip_limits`.
    pub default_limits: PerProtocolLimits,
    /// Per-chip overrides of `default_limits`.
    pub per_chip_limits: HashMap<ChipId, PerProtocolLimits>,
    /// `N_rx`: max buffered received packets per remote address (§3).
    pub max_received_packets: usize,
    /// Size of the registry's recently-closed debugging LRU (§4.5, `N ≈ 5`).
    pub recently_closed_capacity: usize,
    /// Non-privileged background timeout (§4.7, 120s).
    pub bg_app_timeout: Duration,
    /// Per-step UCI command/notification correlation timeout (§4.4.1, §4.6).
    pub command_timeout: Duration,
    /// Whether background ranging is permitted by policy (§4.4).
    pub background_ranging_allowed: bool,
    /// Error-streak timer duration (§3, §4.7): armed on the first error
    /// measurement for a session or controlee and fires unless a success
    /// notification cancels it first.
    pub error_streak_timeout_ms: u64,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            default_limits: PerProtocolLimits::default(),
            per_chip_limits: HashMap::new(),
            max_received_packets: 32,
            recently_closed_capacity: 5,
            bg_app_timeout: Duration::from_secs(120),
            command_timeout: Duration::from_secs(2),
            background_ranging_allowed: false,
            error_streak_timeout_ms: 3_000,
        }
    }
}

impl SessionManagerConfig {
    pub fn limits_for_chip(&self, chip_id: &str) -> PerProtocolLimits {
        self.per_chip_limits.get(chip_id).copied().unwrap_or(self.default_limits)
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
