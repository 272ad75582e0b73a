// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Mutex;

use super::*;
use crate::config::{PerProtocolLimits, SessionManagerConfig, StackPriority};
use crate::data::{AddressStatus, MulticastAction};
use crate::params::{Params, Protocol};
use crate::registry::AdmissionRequest;
use crate::session::{SessionHandle, SessionId};
use crate::test_support::{recording_callbacks, NoopAlarms};
use crate::timers::StandardErrorStreakPolicy;

fn registry() -> Arc<SessionRegistry> {
    let mut config = SessionManagerConfig::default();
    config.default_limits = PerProtocolLimits { fira: 5, ccc: 5, aliro: 5 };
    Arc::new(SessionRegistry::new(config))
}

fn owr_aoa_params() -> Params {
    Params::new(Protocol::Fira)
        .with_field(crate::params::keys::RANGING_ROUND_USAGE, crate::params::keys::RANGING_ROUND_USAGE_OWR_AOA)
}

async fn router_under_test(registry: Arc<SessionRegistry>) -> NotificationRouter {
    let advertise = Arc::new(Mutex::new(AdvertiseTargetStore::new()));
    let alarms = Arc::new(NoopAlarms::default());
    let policy = Arc::new(StandardErrorStreakPolicy::new(alarms, 5_000));
    NotificationRouter::new(registry, advertise, Arc::new(crate::external::NoopMetricsSink), policy, ByteOrder::Little)
}

#[tokio::test]
async fn on_session_status_updates_state_and_posts_ondeinit_on_deinit_notification() {
    let registry = registry();
    let admitted = registry
        .admit(AdmissionRequest {
            handle: SessionHandle(1),
            session_id: SessionId(1),
            session_type: 0,
            chip_id: "chip0".to_string(),
            params: Params::new(Protocol::Fira),
            stack_priority: StackPriority::FG,
            uid: None,
            callbacks: recording_callbacks(),
        })
        .await
        .unwrap();
    let mut event_rx = admitted.event_rx;
    let router = router_under_test(registry).await;

    router.on_session_status(SessionId(1), SessionToken(9), SessionState::Deinit, 0);
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(admitted.entry.session.state().await, SessionState::Deinit);
    let event = event_rx.try_recv().expect("expected OnDeinit event");
    assert!(matches!(event, SessionEvent::OnDeinit));
}

#[tokio::test]
async fn on_session_status_emits_stopped_with_reason_for_uwbs_initiated_idle_transition() {
    let registry = registry();
    let admitted = registry
        .admit(AdmissionRequest {
            handle: SessionHandle(1),
            session_id: SessionId(1),
            session_type: 0,
            chip_id: "chip0".to_string(),
            params: Params::new(Protocol::Fira),
            stack_priority: StackPriority::FG,
            uid: None,
            callbacks: recording_callbacks(),
        })
        .await
        .unwrap();
    admitted.entry.session.set_state(SessionState::Active).await;
    let router = router_under_test(registry).await;

    router.on_session_status(SessionId(1), SessionToken(1), SessionState::Idle, 5);
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(admitted.entry.session.state().await, SessionState::Idle);
}

#[tokio::test]
async fn on_data_received_rejects_short_addresses() {
    let registry = registry();
    let admitted = registry
        .admit(AdmissionRequest {
            handle: SessionHandle(1),
            session_id: SessionId(1),
            session_type: 0,
            chip_id: "chip0".to_string(),
            params: Params::new(Protocol::Fira),
            stack_priority: StackPriority::FG,
            uid: None,
            callbacks: recording_callbacks(),
        })
        .await
        .unwrap();
    let router = router_under_test(registry).await;

    router.on_data_received(SessionId(1), 0, 0, Bytes::from_static(&[1, 2]), Bytes::from_static(b"x"));
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(admitted.entry.session.drain_received(UwbAddress::Extended(0)).await.is_empty());
}

#[tokio::test]
async fn on_data_received_forwards_extended_address_packets_for_non_owr_aoa_sessions() {
    let registry = registry();
    let admitted = registry
        .admit(AdmissionRequest {
            handle: SessionHandle(1),
            session_id: SessionId(1),
            session_type: 0,
            chip_id: "chip0".to_string(),
            params: Params::new(Protocol::Fira),
            stack_priority: StackPriority::FG,
            uid: None,
            callbacks: recording_callbacks(),
        })
        .await
        .unwrap();
    let router = router_under_test(registry).await;
    let addr_bytes = Bytes::copy_from_slice(&1u64.to_le_bytes());

    router.on_data_received(SessionId(1), 0, 0, addr_bytes, Bytes::from_static(b"hello"));
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(admitted.entry.session.drain_received(UwbAddress::Extended(1)).await.is_empty());
}

#[tokio::test]
async fn on_data_received_buffers_for_owr_aoa_sessions_until_pointed() {
    let registry = registry();
    let admitted = registry
        .admit(AdmissionRequest {
            handle: SessionHandle(1),
            session_id: SessionId(1),
            session_type: 0,
            chip_id: "chip0".to_string(),
            params: owr_aoa_params(),
            stack_priority: StackPriority::FG,
            uid: None,
            callbacks: recording_callbacks(),
        })
        .await
        .unwrap();
    let router = router_under_test(registry).await;
    let addr_bytes = Bytes::copy_from_slice(&1u64.to_le_bytes());

    router.on_data_received(SessionId(1), 0, 0, addr_bytes, Bytes::from_static(b"hello"));
    tokio::time::sleep(Duration::from_millis(20)).await;

    let drained = admitted.entry.session.drain_received(UwbAddress::Extended(1)).await;
    assert_eq!(drained.len(), 1);
}

#[tokio::test]
async fn on_data_send_status_removes_entry_only_after_required_tx_count_on_ok() {
    let registry = registry();
    let callbacks = recording_callbacks();
    let admitted = registry
        .admit(AdmissionRequest {
            handle: SessionHandle(1),
            session_id: SessionId(1),
            session_type: 0,
            chip_id: "chip0".to_string(),
            params: Params::new(Protocol::Fira).with_field(crate::params::keys::DATA_REPETITION_COUNT, 1),
            stack_priority: StackPriority::FG,
            uid: None,
            callbacks: callbacks.clone(),
        })
        .await
        .unwrap();
    let addr = UwbAddress::Extended(0xAB);
    admitted
        .entry
        .session
        .add_send_info(
            0,
            crate::data::SendInfo::new(addr, Params::new(Protocol::Fira).with_field(crate::params::keys::DATA_REPETITION_COUNT, 1), Bytes::from_static(b"x")),
        )
        .await;
    let router = router_under_test(registry).await;

    router.on_data_send_status(SessionId(1), 1, 0, 1); // REPETITION_OK, tx_count=1 < required(2)
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(admitted.entry.session.get_send_info(0).await.is_some());

    router.on_data_send_status(SessionId(1), 0, 0, 2); // OK, tx_count=2 >= required(2)
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(admitted.entry.session.get_send_info(0).await.is_none());

    let sent_count = callbacks.events().iter().filter(|e| *e == "data_sent").count();
    assert_eq!(sent_count, 1, "data_sent must fire once across the repetition-ok and ok notifications");
}

#[tokio::test]
async fn on_data_send_status_removes_entry_immediately_on_failure() {
    let registry = registry();
    let admitted = registry
        .admit(AdmissionRequest {
            handle: SessionHandle(1),
            session_id: SessionId(1),
            session_type: 0,
            chip_id: "chip0".to_string(),
            params: Params::new(Protocol::Fira),
            stack_priority: StackPriority::FG,
            uid: None,
            callbacks: recording_callbacks(),
        })
        .await
        .unwrap();
    let addr = UwbAddress::Extended(0xAB);
    admitted
        .entry
        .session
        .add_send_info(0, crate::data::SendInfo::new(addr, Params::new(Protocol::Fira), Bytes::from_static(b"x")))
        .await;
    let router = router_under_test(registry).await;

    router.on_data_send_status(SessionId(1), 0x42, 0, 0);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(admitted.entry.session.get_send_info(0).await.is_none());
}

#[tokio::test]
async fn on_range_data_owr_aoa_drains_buffered_packets_once_pointed() {
    let registry = registry();
    let admitted = registry
        .admit(AdmissionRequest {
            handle: SessionHandle(1),
            session_id: SessionId(1),
            session_type: 0,
            chip_id: "chip0".to_string(),
            params: owr_aoa_params(),
            stack_priority: StackPriority::FG,
            uid: None,
            callbacks: recording_callbacks(),
        })
        .await
        .unwrap();
    let addr = UwbAddress::Extended(7);
    admitted.entry.session.add_received(addr, 0, Bytes::from_static(b"a")).await;
    admitted.entry.session.add_received(addr, 2, Bytes::from_static(b"c")).await;
    admitted.entry.session.add_received(addr, 1, Bytes::from_static(b"b")).await;

    let router = router_under_test(registry).await;
    // A long dwell: send two samples with a real sleep in between so the
    // default AimingCriterion's min_dwell is satisfied.
    router.on_range_data(RangeData {
        session_id: SessionId(1),
        session_token: SessionToken(1),
        measurement_type: MeasurementType::OwrAoa,
        measurements: vec![Measurement { addr, status: MeasurementStatus::Ok, aoa_azimuth_deg: Some(0.0) }],
    });
    tokio::time::sleep(Duration::from_millis(600)).await;
    router.on_range_data(RangeData {
        session_id: SessionId(1),
        session_token: SessionToken(1),
        measurement_type: MeasurementType::OwrAoa,
        measurements: vec![Measurement { addr, status: MeasurementStatus::Ok, aoa_azimuth_deg: Some(1.0) }],
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(admitted.entry.session.drain_received(addr).await.is_empty());
}

#[tokio::test]
async fn on_multicast_list_update_wakes_a_waiting_reconfigure_step() {
    let registry = registry();
    let admitted = registry
        .admit(AdmissionRequest {
            handle: SessionHandle(1),
            session_id: SessionId(1),
            session_type: 0,
            chip_id: "chip0".to_string(),
            params: Params::new(Protocol::Fira),
            stack_priority: StackPriority::FG,
            uid: None,
            callbacks: recording_callbacks(),
        })
        .await
        .unwrap();
    let router = router_under_test(registry).await;
    let addr = UwbAddress::Extended(1);

    let session = admitted.entry.session.clone();
    let waiter = tokio::spawn(async move {
        session.wait_for_mcast_update_status(Duration::from_millis(200)).await
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    router.on_multicast_list_update(
        SessionId(1),
        MulticastUpdateStatus {
            action: MulticastAction::Add,
            per_address: vec![AddressStatus { addr, status: 0 }],
        },
    );

    let status = waiter.await.unwrap().expect("expected a status before the timeout");
    assert!(status.all_ok());
}
