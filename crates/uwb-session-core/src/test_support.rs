// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared test doubles. Not part of the public API; `#[path]`-included
//! test modules across the crate reach for these instead of redefining
//! their own every time.

use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::address::UwbAddress;
use crate::error::SessionErrorKind;
use crate::external::{AlarmHandle, AlarmService, DataTransferPhaseStatus, DtTagUpdateStatus};
use crate::params::Params;
use crate::router::RangeData;
use crate::session::{SessionId, SessionToken};

/// A [`crate::external::ClientCallbacks`] double that records every call's
/// name in order, for assertions like "opened then closed, nothing else".
#[derive(Default)]
pub struct RecordingCallbacks {
    events: Mutex<Vec<String>>,
}

impl RecordingCallbacks {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn record(&self, event: impl Into<String>) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).push(event.into());
    }
}

impl crate::external::ClientCallbacks for RecordingCallbacks {
    fn opened(&self, _params: &Params) {
        self.record("opened");
    }
    fn opened_failed(&self, _reason: SessionErrorKind, _params: &Params) {
        self.record("opened_failed");
    }
    fn started(&self, _params: &Params) {
        self.record("started");
    }
    fn start_failed(&self, _status: u8) {
        self.record("start_failed");
    }
    fn stopped(&self, _reason: SessionErrorKind) {
        self.record("stopped");
    }
    fn stopped_with_reason(&self, _reason_code: u8) {
        self.record("stopped_with_reason");
    }
    fn closed(&self, _reason: SessionErrorKind) {
        self.record("closed");
    }
    fn ranging_result(&self, _range_data: &RangeData) {
        self.record("ranging_result");
    }
    fn data_received(&self, _addr: UwbAddress, _session_token: SessionToken, _payload: Bytes) {
        self.record("data_received");
    }
    fn data_sent(&self, _addr: UwbAddress, _session_token: SessionToken) {
        self.record("data_sent");
    }
    fn data_send_failed(&self, _addr: UwbAddress, _status: u8, _session_token: SessionToken) {
        self.record("data_send_failed");
    }
    fn controlee_added(&self, _addr: UwbAddress) {
        self.record("controlee_added");
    }
    fn controlee_removed(&self, _addr: UwbAddress, _reason: SessionErrorKind) {
        self.record("controlee_removed");
    }
    fn controlee_add_failed(&self, _addr: UwbAddress, _status: u8) {
        self.record("controlee_add_failed");
    }
    fn controlee_remove_failed(&self, _addr: UwbAddress, _status: u8, _reason: SessionErrorKind) {
        self.record("controlee_remove_failed");
    }
    fn ranging_reconfigured(&self) {
        self.record("ranging_reconfigured");
    }
    fn ranging_reconfigure_failed(&self, _status: u8) {
        self.record("ranging_reconfigure_failed");
    }
    fn ranging_paused(&self) {
        self.record("ranging_paused");
    }
    fn ranging_resumed(&self) {
        self.record("ranging_resumed");
    }
    fn ranging_rounds_update_status(&self, _status: DtTagUpdateStatus) {
        self.record("ranging_rounds_update_status");
    }
    fn hybrid_session_controller_configured(&self) {
        self.record("hybrid_session_controller_configured");
    }
    fn hybrid_session_controller_failed(&self, _status: u8) {
        self.record("hybrid_session_controller_failed");
    }
    fn hybrid_session_controlee_configured(&self) {
        self.record("hybrid_session_controlee_configured");
    }
    fn hybrid_session_controlee_failed(&self, _status: u8) {
        self.record("hybrid_session_controlee_failed");
    }
    fn data_transfer_phase_configured(&self) {
        self.record("data_transfer_phase_configured");
    }
    fn data_transfer_phase_failed(&self, _status: DataTransferPhaseStatus) {
        self.record("data_transfer_phase_failed");
    }
}

pub fn recording_callbacks() -> Arc<RecordingCallbacks> {
    Arc::new(RecordingCallbacks::default())
}

/// An [`AlarmService`] double that mints sequential handles and never
/// actually fires its callback; tests that need to observe a fire call
/// the stored closure directly.
#[derive(Default)]
pub struct NoopAlarms {
    next: std::sync::atomic::AtomicU64,
}

#[async_trait::async_trait]
impl AlarmService for NoopAlarms {
    async fn set_exact_elapsed_wakeup(
        &self,
        _when_ms: u64,
        _tag: &str,
        _callback: Arc<dyn Fn() + Send + Sync>,
    ) -> AlarmHandle {
        AlarmHandle(self.next.fetch_add(1, std::sync::atomic::Ordering::Relaxed))
    }

    async fn cancel(&self, _handle: AlarmHandle) {}
}
