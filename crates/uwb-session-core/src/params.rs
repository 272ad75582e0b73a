// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Protocol parameter bundles (§3, §4.1): a tagged sum over the three
//! ranging protocol families. Each variant carries an opaque bag of
//! typed fields and is immutable once committed to a [`crate::Session`];
//! "mutation" is always a builder-derived replacement value.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which ranging protocol family a session's [`Params`] belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Fira,
    Ccc,
    Aliro,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fira => "fira",
            Self::Ccc => "ccc",
            Self::Aliro => "aliro",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A protocol-tagged bag of typed configuration fields.
///
/// The field bag is intentionally opaque here — the wire-level meaning of
/// each key belongs to the UCI codec, which is out of scope for this
/// crate (§1). Callers read/write well-known keys via the typed
/// convenience accessors below; unrecognized keys round-trip unchanged
/// through [`Params::to_key_value_bag`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Params {
    pub protocol: Protocol,
    fields: BTreeMap<String, Value>,
}

/// Well-known field keys shared across protocols, documented here so
/// accessor methods and reconfigure handlers agree on spelling.
pub mod keys {
    pub const RANGING_INTERVAL_MS: &str = "ranging_interval_ms";
    pub const BLOCK_STRIDE_LENGTH: &str = "block_stride_length";
    pub const DEVICE_ROLE: &str = "device_role";
    pub const DEVICE_TYPE: &str = "device_type";
    pub const SCHEDULED_MODE: &str = "scheduled_mode";
    pub const RANGING_ROUND_USAGE: &str = "ranging_round_usage";
    pub const RANGE_DATA_NTF_CONFIG: &str = "range_data_ntf_config";
    pub const RANGE_DATA_NTF_PROXIMITY_NEAR_CM: &str = "range_data_ntf_proximity_near_cm";
    pub const RANGE_DATA_NTF_PROXIMITY_FAR_CM: &str = "range_data_ntf_proximity_far_cm";
    pub const RANGE_DATA_NTF_AOA_AZIMUTH_LOWER: &str = "range_data_ntf_aoa_azimuth_lower";
    pub const RANGE_DATA_NTF_AOA_AZIMUTH_UPPER: &str = "range_data_ntf_aoa_azimuth_upper";
    pub const STS_CONFIG: &str = "sts_config";
    pub const SESSION_PRIORITY: &str = "session_priority";
    pub const DATA_REPETITION_COUNT: &str = "data_repetition_count";
    pub const HUS_CONTROLLER_SESSION_TOKEN: &str = "hus_controller_session_token";
    pub const HUS_CONTROLEE_SESSION_TOKENS: &str = "hus_controlee_session_tokens";
    pub const INITIATION_TIME_RELATIVE_MS: &str = "initiation_time_relative_ms";
    pub const INITIATION_TIME_ABSOLUTE_US: &str = "initiation_time_absolute_us";
    pub const SESSION_KEY: &str = "session_key";
    pub const SUB_SESSION_KEY_LIST: &str = "sub_session_key_list";
    pub const DEVICE_TYPE_CONTROLLER: &str = "controller";
    pub const DEVICE_TYPE_CONTROLLEE: &str = "controlee";
    pub const RANGING_ERROR_STREAK_TIMER_ENABLED: &str = "ranging_error_streak_timer_enabled";
    pub const RANGING_ROUND_USAGE_OWR_AOA: &str = "owr_aoa";
}

impl Params {
    pub fn new(protocol: Protocol) -> Self {
        Self { protocol, fields: BTreeMap::new() }
    }

    pub fn from_fields(protocol: Protocol, fields: BTreeMap<String, Value>) -> Self {
        Self { protocol, fields }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn get_u32(&self, key: &str) -> Option<u32> {
        self.fields.get(key).and_then(Value::as_u64).map(|v| v as u32)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.fields.get(key).and_then(Value::as_bool)
    }

    pub fn get_str<'a>(&'a self, key: &str) -> Option<&'a str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    /// Build a derived copy with `key` set to `value`, leaving all other
    /// fields untouched. This is the only mutation primitive Params
    /// supports (§4.1): the source field bag is never mutated in place.
    pub fn with_field(&self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut fields = self.fields.clone();
        fields.insert(key.into(), value.into());
        Self { protocol: self.protocol, fields }
    }

    /// Build a derived copy with `key` removed, if present.
    pub fn without_field(&self, key: &str) -> Self {
        let mut fields = self.fields.clone();
        fields.remove(key);
        Self { protocol: self.protocol, fields }
    }

    /// Build a derived copy with every `(key, value)` pair applied, in
    /// order. Equivalent to repeated [`Params::with_field`] calls, but
    /// clones the field bag once.
    pub fn with_fields(&self, updates: impl IntoIterator<Item = (String, Value)>) -> Self {
        let mut fields = self.fields.clone();
        for (k, v) in updates {
            fields.insert(k, v);
        }
        Self { protocol: self.protocol, fields }
    }

    /// Convert to the opaque key-value bag handed to the native layer
    /// (§4.1(ii)).
    pub fn to_key_value_bag(&self) -> BTreeMap<String, Value> {
        self.fields.clone()
    }

    pub fn device_role_is_controller(&self) -> bool {
        self.get_str(keys::DEVICE_TYPE) == Some(keys::DEVICE_TYPE_CONTROLLER)
    }

    pub fn session_priority(&self) -> Option<u8> {
        self.get_u32(keys::SESSION_PRIORITY).map(|v| v as u8)
    }

    pub fn data_repetition_count(&self) -> u32 {
        self.get_u32(keys::DATA_REPETITION_COUNT).unwrap_or(0)
    }

    /// True when both a session key and sub-session key list are present,
    /// or both are absent (the precondition §4.6 requires for provisioned
    /// 16/32-byte STS add).
    pub fn session_and_sub_session_keys_paired(&self) -> bool {
        self.get(keys::SESSION_KEY).is_some() == self.get(keys::SUB_SESSION_KEY_LIST).is_some()
    }

    pub fn relative_initiation_time_ms(&self) -> Option<u32> {
        self.get_u32(keys::INITIATION_TIME_RELATIVE_MS)
    }

    pub fn absolute_initiation_time_us(&self) -> Option<u64> {
        self.fields.get(keys::INITIATION_TIME_ABSOLUTE_US).and_then(Value::as_u64)
    }

    /// Whether the error-streak liveness timers (§4.7) are enabled for
    /// this session. Absent means enabled.
    pub fn error_streak_timer_enabled(&self) -> bool {
        self.get_bool(keys::RANGING_ERROR_STREAK_TIMER_ENABLED).unwrap_or(true)
    }
}

#[cfg(test)]
#[path = "params_tests.rs"]
mod tests;
