// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! External collaborators (§6): the command surface this crate issues
//! against the native UWBS driver, plus the alarm, process-importance,
//! metrics, and client-callback sinks. Everything in this module is an
//! abstract interface — the UCI wire codec, the native driver, the OS
//! alarm/importance services, and metrics storage are all out of scope
//! (§1) and are supplied by the embedding application.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::address::UwbAddress;
pub use crate::data::{DataTransferPhaseStatus, DtTagUpdateStatus};
use crate::data::{MulticastAction, MulticastUpdateStatus};
use crate::params::Params;
use crate::session::{SessionId, SessionToken};

/// The command surface the core issues against the native UWBS driver.
///
/// Every method mirrors one native call in §6 exactly; the native status
/// byte is returned verbatim (0 conventionally means OK — callers
/// compare against the codes the embedding platform defines).
#[async_trait]
pub trait NativeUwbs: Send + Sync {
    async fn init_session(&self, session_id: SessionId, session_type: u8, chip_id: &str) -> u8;
    async fn deinit_session(&self, session_id: SessionId, chip_id: &str) -> u8;
    async fn start_ranging(&self, session_id: SessionId, chip_id: &str) -> u8;
    async fn stop_ranging(&self, session_id: SessionId, chip_id: &str) -> u8;
    async fn set_app_configurations(
        &self,
        session_id: SessionId,
        params: &Params,
        chip_id: &str,
    ) -> u8;
    async fn get_app_configurations(
        &self,
        session_id: SessionId,
        protocol: crate::params::Protocol,
        key_bytes: &[u8],
        chip_id: &str,
        protocol_version: u16,
    ) -> (u8, BTreeMap<String, serde_json::Value>);
    async fn send_data(
        &self,
        session_id: SessionId,
        ext_addr: u64,
        host_endpoint: u8,
        seq: u16,
        payload: Bytes,
        chip_id: &str,
    ) -> u8;
    async fn query_max_data_size_bytes(&self, session_id: SessionId, chip_id: &str) -> u32;
    async fn query_uwbs_timestamp_us(&self) -> u64;
    async fn controller_multicast_list_update(
        &self,
        session_id: SessionId,
        action: MulticastAction,
        sub_ids: &[u32],
        addrs: &[UwbAddress],
        keys: Option<&[Vec<u8>]>,
        chip_id: &str,
    ) -> MulticastUpdateStatus;
    async fn session_update_dt_tag_ranging_rounds(
        &self,
        session_id: SessionId,
        n: u8,
        indices: &[u8],
        chip_id: &str,
    ) -> DtTagUpdateStatus;
    async fn set_hybrid_session_controller_configuration(
        &self,
        session_id: SessionId,
        message_control: u8,
        n_phases: u8,
        update_time: u64,
        phase_list_bytes: &[u8],
        chip_id: &str,
    ) -> u8;
    async fn set_hybrid_session_controllee_configuration(
        &self,
        session_id: SessionId,
        n_phases: u8,
        phase_list_bytes: &[u8],
        chip_id: &str,
    ) -> u8;
    async fn set_data_transfer_phase_config(
        &self,
        session_id: SessionId,
        repetition: u8,
        control: u8,
        list_size: u8,
        mac_addrs: &[UwbAddress],
        slot_bitmap: &[u8],
        chip_id: &str,
    ) -> DataTransferPhaseStatus;
}

/// A handle to a scheduled alarm, cancellable via [`AlarmService::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AlarmHandle(pub u64);

/// Fires `callback` once, no earlier than `when_ms` elapsed wall-clock
/// milliseconds from now. Used for the bg-app and error-streak timers
/// (§4.7) and for reconfiguration suspend/resume follow-ups.
#[async_trait]
pub trait AlarmService: Send + Sync {
    async fn set_exact_elapsed_wakeup(
        &self,
        when_ms: u64,
        tag: &str,
        callback: Arc<dyn Fn() + Send + Sync>,
    ) -> AlarmHandle;
    async fn cancel(&self, handle: AlarmHandle);
}

/// Listener for foreground/background transitions of a watched UID (§4.7).
pub trait ProcessImportanceListener: Send + Sync {
    fn on_importance_changed(&self, uid: u32, is_foreground: bool);
}

/// Subscription point for the platform's process-importance service.
pub trait ProcessImportanceService: Send + Sync {
    fn subscribe(&self, listener: Arc<dyn ProcessImportanceListener>);
}

/// Fire-and-forget counters (§6). No return value; failures to emit a
/// metric must never affect session behavior.
pub trait MetricsSink: Send + Sync {
    fn count(&self, name: &str, session_id: Option<SessionId>);
}

/// A metrics sink that discards everything, for embeddings/tests that
/// don't care about telemetry.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn count(&self, _name: &str, _session_id: Option<SessionId>) {}
}

/// Per-session sink for client-visible lifecycle, data, and reconfigure
/// callbacks (§6). One instance is supplied per session at open time.
pub trait ClientCallbacks: Send + Sync {
    fn opened(&self, params: &Params);
    fn opened_failed(&self, reason: crate::error::SessionErrorKind, params: &Params);
    fn started(&self, params: &Params);
    fn start_failed(&self, status: u8);
    fn stopped(&self, reason: crate::error::SessionErrorKind);
    fn stopped_with_reason(&self, reason_code: u8);
    fn closed(&self, reason: crate::error::SessionErrorKind);
    fn ranging_result(&self, range_data: &crate::router::RangeData);
    fn data_received(&self, addr: UwbAddress, session_token: SessionToken, payload: Bytes);
    fn data_sent(&self, addr: UwbAddress, session_token: SessionToken);
    fn data_send_failed(&self, addr: UwbAddress, status: u8, session_token: SessionToken);
    fn controlee_added(&self, addr: UwbAddress);
    fn controlee_removed(&self, addr: UwbAddress, reason: crate::error::SessionErrorKind);
    fn controlee_add_failed(&self, addr: UwbAddress, status: u8);
    fn controlee_remove_failed(
        &self,
        addr: UwbAddress,
        status: u8,
        reason: crate::error::SessionErrorKind,
    );
    fn ranging_reconfigured(&self);
    fn ranging_reconfigure_failed(&self, status: u8);
    fn ranging_paused(&self);
    fn ranging_resumed(&self);
    fn ranging_rounds_update_status(&self, status: DtTagUpdateStatus);
    fn hybrid_session_controller_configured(&self);
    fn hybrid_session_controller_failed(&self, status: u8);
    fn hybrid_session_controlee_configured(&self);
    fn hybrid_session_controlee_failed(&self, status: u8);
    fn data_transfer_phase_configured(&self);
    fn data_transfer_phase_failed(&self, status: DataTransferPhaseStatus);
}

/// A non-privileged client process's liveness hook (§3). Fires on client
/// termination; the registered closure must schedule a synchronous
/// DEINIT through the Serializer.
pub trait ClientLivenessHook: Send + Sync {
    fn on_client_died(&self, session_id: SessionId);
}

#[cfg(test)]
#[path = "external_tests.rs"]
mod tests;
