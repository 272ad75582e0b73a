// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session-mutating events posted to an [`crate::serializer::EventSerializer`]
//! (§4.6). Every client- or timer-triggered operation on a session is
//! represented here instead of calling into [`crate::session::Session`]
//! directly, so a single cooperative loop serializes all mutation.

use crate::address::UwbAddress;
use crate::data::{MulticastAction, SendInfo};
use crate::error::SessionErrorKind;
use crate::params::Params;

/// A controlee-membership change carried by a [`ReconfigureRequest`]
/// (§4.6 step 2-4).
#[derive(Debug, Clone)]
pub struct MembershipChange {
    pub action: MulticastAction,
    pub addrs: Vec<UwbAddress>,
    pub sub_session_ids: Vec<u32>,
    /// Per-address STS keys, required only for provisioned 16/32-byte
    /// STS adds.
    pub keys: Option<Vec<Vec<u8>>>,
}

/// A reconfigure request (§4.6): either a controlee-membership change,
/// a plain write-through of gating/stride/AoA-gate fields, or both.
#[derive(Debug, Clone)]
pub struct ReconfigureRequest {
    pub params: Params,
    pub membership: Option<MembershipChange>,
    /// Set when the reconfigure is itself driven by a foreground/
    /// background transition — the terminal `ranging_reconfigured`
    /// callback is suppressed in that case (§4.6 step 6).
    pub suppress_terminal_callback: bool,
    /// Set when the reconfigure carries a suspend (`true`) or resume
    /// (`false`) flag, pairing with `ranging_paused`/`ranging_resumed`.
    pub suspend_resume: Option<bool>,
}

/// A hybrid-session (HUS) controller-role configuration request (§4.6, §6).
#[derive(Debug, Clone)]
pub struct HusControllerConfig {
    pub message_control: u8,
    pub n_phases: u8,
    pub update_time: u64,
    pub phase_list_bytes: Vec<u8>,
}

/// A hybrid-session (HUS) controlee-role configuration request (§4.6, §6).
#[derive(Debug, Clone)]
pub struct HusControleeConfig {
    pub n_phases: u8,
    pub phase_list_bytes: Vec<u8>,
}

/// A data-transfer phase configuration request (§4.6, §6).
#[derive(Debug, Clone)]
pub struct DataTransferPhaseConfig {
    pub repetition: u8,
    pub control: u8,
    pub list_size: u8,
    pub mac_addrs: Vec<UwbAddress>,
    pub slot_bitmap: Vec<u8>,
}

/// Every session-mutating operation the Serializer can be asked to run
/// (§4.6). Events for one session are processed strictly FIFO (§5).
#[derive(Debug, Clone)]
pub enum SessionEvent {
    OpenRanging,
    StartRanging,
    StopRanging { reason: SessionErrorKind },
    Reconfigure(ReconfigureRequest),
    Deinit { reason: SessionErrorKind },
    /// A DEINIT notification arrived from the UWBS without a matching
    /// client-issued Deinit event (§4.2): the Router posts this so the
    /// close path still runs through the Serializer.
    OnDeinit,
    SendData(SendInfo),
    UpdateDtTagRounds { n: u8, indices: Vec<u8> },
    SetHusControllerConfig(HusControllerConfig),
    SetHusControleeConfig(HusControleeConfig),
    DataTransferPhaseConfig(DataTransferPhaseConfig),
}
