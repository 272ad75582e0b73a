// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Mutex as StdMutex;
use std::time::Duration;

use bytes::Bytes;

use super::*;
use crate::data::{AddressStatus, MulticastAction, MulticastUpdateStatus};
use crate::external::{AlarmService, DataTransferPhaseStatus, DtTagUpdateStatus};
use crate::params::Protocol;

#[derive(Default)]
struct RecordingCallbacks {
    events: StdMutex<Vec<String>>,
}

impl RecordingCallbacks {
    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn record(&self, event: impl Into<String>) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).push(event.into());
    }
}

impl ClientCallbacks for RecordingCallbacks {
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
    fn ranging_result(&self, _range_data: &crate::router::RangeData) {
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

#[derive(Default)]
struct NoopAlarms;

#[async_trait::async_trait]
impl AlarmService for NoopAlarms {
    async fn set_exact_elapsed_wakeup(
        &self,
        _when_ms: u64,
        _tag: &str,
        _callback: std::sync::Arc<dyn Fn() + Send + Sync>,
    ) -> AlarmHandle {
        AlarmHandle(0)
    }

    async fn cancel(&self, _handle: AlarmHandle) {}
}

fn make_session() -> Session {
    Session::new(
        SessionHandle(1),
        SessionId(7),
        0,
        "chip0",
        Params::new(Protocol::Fira),
        StackPriority::FG,
        4,
        Arc::new(RecordingCallbacks::default()),
    )
}

#[tokio::test]
async fn new_session_starts_in_init() {
    let session = make_session();
    assert_eq!(session.state().await, SessionState::Init);
}

#[tokio::test]
async fn set_state_wakes_a_waiter() {
    let session = Arc::new(make_session());
    let waiter = {
        let session = session.clone();
        tokio::spawn(async move {
            session.wait_for_state(|s| s == SessionState::Active, Duration::from_secs(1)).await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    session.set_state(SessionState::Active).await;
    let result = waiter.await.expect("task panicked");
    assert_eq!(result, Ok(SessionState::Active));
}

#[tokio::test]
async fn wait_for_state_times_out_without_a_matching_transition() {
    let session = make_session();
    let result = session.wait_for_state(|s| s == SessionState::Active, Duration::from_millis(20)).await;
    assert!(matches!(result, Err(e) if e.kind == SessionErrorKind::Timeout));
}

#[tokio::test]
async fn add_controlee_is_idempotent_and_reports_failure_on_duplicate() {
    let session = make_session();
    let addr = UwbAddress::Short(0x10);
    assert!(session.add_controlee(addr).await);
    assert!(!session.add_controlee(addr).await);
    assert_eq!(session.controlee_count().await, 1);
}

#[tokio::test]
async fn remove_controlee_is_idempotent_and_reports_failure_when_missing() {
    let session = make_session();
    let addr = UwbAddress::Short(0x20);
    assert!(session.remove_controlee(addr).await.is_none());
    session.add_controlee(addr).await;
    assert!(session.remove_controlee(addr).await.is_some());
    assert!(session.remove_controlee(addr).await.is_none());
}

#[tokio::test]
async fn tx_sequence_numbers_increment_per_session() {
    let session = make_session();
    assert_eq!(session.get_and_increment_data_tx_seq().await, 0);
    assert_eq!(session.get_and_increment_data_tx_seq().await, 1);
}

#[tokio::test]
async fn received_data_drains_in_ascending_order_per_address() {
    let session = make_session();
    let addr = UwbAddress::Short(0x30);
    session.add_received(addr, 3, Bytes::from_static(b"c")).await;
    session.add_received(addr, 1, Bytes::from_static(b"a")).await;
    session.add_received(addr, 2, Bytes::from_static(b"b")).await;
    let drained = session.drain_received(addr).await;
    let seqs: Vec<u16> = drained.into_iter().map(|(seq, _)| seq).collect();
    assert_eq!(seqs, vec![1, 2, 3]);
    assert!(session.remote_addrs_seen().await.contains(&addr));
}

#[tokio::test]
async fn on_fg_bg_change_raises_priority_to_fg_and_clears_bg_timer() {
    let session = make_session();
    let outcome = session.on_fg_bg_change(true, false).await;
    assert!(outcome.gating_enabled);
    assert!(outcome.stop_bg_timer);
    assert!(!outcome.start_bg_timer);
    assert_eq!(session.stack_priority().await, StackPriority::FG);
}

#[tokio::test]
async fn on_fg_bg_change_to_background_starts_timer_unless_allowed() {
    let session = make_session();
    let outcome = session.on_fg_bg_change(false, false).await;
    assert!(outcome.start_bg_timer);
    assert_eq!(session.stack_priority().await, StackPriority::BG);

    let session = make_session();
    let outcome = session.on_fg_bg_change(false, true).await;
    assert!(!outcome.start_bg_timer);
}

#[tokio::test]
async fn priority_override_freezes_stack_priority_across_fg_bg_changes() {
    let session = make_session();
    session.set_priority_override(true).await;
    session.on_fg_bg_change(false, false).await;
    assert_eq!(session.stack_priority().await, StackPriority::FG);
}

#[tokio::test]
async fn mcast_update_status_is_observed_by_a_waiter() {
    let session = Arc::new(make_session());
    let addr = UwbAddress::Short(0x40);
    let waiter = {
        let session = session.clone();
        tokio::spawn(async move { session.wait_for_mcast_update_status(Duration::from_secs(1)).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    session
        .set_mcast_update_status(MulticastUpdateStatus {
            action: MulticastAction::Add,
            per_address: vec![AddressStatus { addr, status: 0 }],
        })
        .await;
    let status = waiter.await.expect("task panicked").expect("no status observed");
    assert!(status.all_ok());
}

#[tokio::test]
async fn cancel_all_timers_clears_session_controlee_and_bg_handles() {
    let session = make_session();
    let addr = UwbAddress::Short(0x50);
    session.add_controlee(addr).await;
    session.set_error_streak_timer(Some(AlarmHandle(1))).await;
    session.set_bg_app_timer(Some(AlarmHandle(2))).await;
    session.with_controlee_mut(addr, |c| c.error_streak_timer = Some(AlarmHandle(3))).await;

    session.cancel_all_timers(&NoopAlarms).await;

    assert!(session.error_streak_timer().await.is_none());
    assert!(session.bg_app_timer().await.is_none());
    let still_armed = session.with_controlee_mut(addr, |c| c.error_streak_timer).await;
    assert_eq!(still_armed, Some(None));
}
