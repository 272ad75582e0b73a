// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use super::*;
use crate::address::ByteOrder;
use crate::config::PerProtocolLimits;
use crate::data::{DataTransferPhaseStatus, DtTagUpdateStatus, MulticastAction, MulticastUpdateStatus, SendInfo};
use crate::error::SessionErrorKind;
use crate::external::{AlarmHandle, AlarmService};
use crate::params::Protocol;
use crate::session::SessionState;
use crate::test_support::recording_callbacks;

/// A [`NativeUwbs`] double that acknowledges every command with success
/// and drives the session's state forward the way a real UWBS would,
/// via the registry's notification path.
struct AllOkNative {
    registry: Arc<SessionRegistry>,
}

#[async_trait]
impl NativeUwbs for AllOkNative {
    async fn init_session(&self, session_id: SessionId, _session_type: u8, _chip_id: &str) -> u8 {
        // Simplified single-hop simulation: a real UWBS reports INIT_NTF
        // first and only reaches Idle after `set_app_configurations`, but
        // the session already starts in `Init` (§3), so the open step's
        // first wait (for any state other than `Init`) needs a real move;
        // collapse both hops here since this double has no intermediate
        // state to model.
        self.advance(session_id, SessionState::Idle);
        0
    }
    async fn deinit_session(&self, session_id: SessionId, _chip_id: &str) -> u8 {
        self.advance(session_id, SessionState::Deinit);
        0
    }
    async fn start_ranging(&self, session_id: SessionId, _chip_id: &str) -> u8 {
        self.advance(session_id, SessionState::Active);
        0
    }
    async fn stop_ranging(&self, session_id: SessionId, _chip_id: &str) -> u8 {
        self.advance(session_id, SessionState::Idle);
        0
    }
    async fn set_app_configurations(&self, session_id: SessionId, _params: &Params, _chip_id: &str) -> u8 {
        self.advance(session_id, SessionState::Idle);
        0
    }
    async fn get_app_configurations(
        &self,
        _session_id: SessionId,
        _protocol: Protocol,
        _key_bytes: &[u8],
        _chip_id: &str,
        _protocol_version: u16,
    ) -> (u8, std::collections::BTreeMap<String, serde_json::Value>) {
        (0, std::collections::BTreeMap::new())
    }
    async fn send_data(
        &self,
        _session_id: SessionId,
        _ext_addr: u64,
        _host_endpoint: u8,
        _seq: u16,
        _payload: Bytes,
        _chip_id: &str,
    ) -> u8 {
        0
    }
    async fn query_max_data_size_bytes(&self, _session_id: SessionId, _chip_id: &str) -> u32 {
        1024
    }
    async fn query_uwbs_timestamp_us(&self) -> u64 {
        0
    }
    async fn controller_multicast_list_update(
        &self,
        _session_id: SessionId,
        action: MulticastAction,
        _sub_ids: &[u32],
        addrs: &[crate::address::UwbAddress],
        _keys: Option<&[Vec<u8>]>,
        _chip_id: &str,
    ) -> MulticastUpdateStatus {
        MulticastUpdateStatus {
            action,
            per_address: addrs.iter().map(|&addr| crate::data::AddressStatus { addr, status: 0 }).collect(),
        }
    }
    async fn session_update_dt_tag_ranging_rounds(
        &self,
        _session_id: SessionId,
        _n: u8,
        _indices: &[u8],
        _chip_id: &str,
    ) -> DtTagUpdateStatus {
        DtTagUpdateStatus { status: 0, accepted_indices: vec![] }
    }
    async fn set_hybrid_session_controller_configuration(
        &self,
        _session_id: SessionId,
        _message_control: u8,
        _n_phases: u8,
        _update_time: u64,
        _phase_list_bytes: &[u8],
        _chip_id: &str,
    ) -> u8 {
        0
    }
    async fn set_hybrid_session_controllee_configuration(
        &self,
        _session_id: SessionId,
        _n_phases: u8,
        _phase_list_bytes: &[u8],
        _chip_id: &str,
    ) -> u8 {
        0
    }
    async fn set_data_transfer_phase_config(
        &self,
        _session_id: SessionId,
        _repetition: u8,
        _control: u8,
        _list_size: u8,
        _mac_addrs: &[crate::address::UwbAddress],
        _slot_bitmap: &[u8],
        _chip_id: &str,
    ) -> DataTransferPhaseStatus {
        DataTransferPhaseStatus(0)
    }
}

impl AllOkNative {
    /// Set the session's state directly, as if the matching UCI
    /// notification had just arrived and the Router had applied it
    /// (§4.2). The Serializer step awaiting this transition wakes via
    /// the session's `Notify` once `set_status` returns.
    fn advance(&self, session_id: SessionId, state: SessionState) {
        let registry = self.registry.clone();
        tokio::spawn(async move {
            if let Some(entry) = registry.lookup_by_session_id(session_id).await {
                entry.session.set_status(state, 0).await;
            }
        });
    }
}

struct NeverFiresAlarms;

#[async_trait]
impl AlarmService for NeverFiresAlarms {
    async fn set_exact_elapsed_wakeup(&self, _when_ms: u64, _tag: &str, _callback: Arc<dyn Fn() + Send + Sync>) -> AlarmHandle {
        AlarmHandle(0)
    }
    async fn cancel(&self, _handle: AlarmHandle) {}
}

fn test_config() -> SessionManagerConfig {
    let mut config = SessionManagerConfig::default();
    config.default_limits = PerProtocolLimits { fira: 1, ccc: 5, aliro: 5 };
    config.command_timeout = Duration::from_millis(200);
    config
}

fn manager_with(config: SessionManagerConfig) -> Arc<SessionManager> {
    // Build the registry first so `AllOkNative` can route its simulated
    // notifications back into the exact registry the manager admits
    // sessions into.
    let registry = Arc::new(SessionRegistry::new(config));
    let native = Arc::new(AllOkNative { registry: registry.clone() });
    let deps = SessionManagerDeps::new(native, Arc::new(NeverFiresAlarms), ByteOrder::Little);
    Arc::new(SessionManager::with_registry(registry, deps))
}

#[tokio::test]
async fn open_start_stop_close_emits_full_lifecycle() {
    let manager = manager_with(test_config());
    let callbacks = recording_callbacks();

    let handle = manager
        .open_session(OpenSessionRequest {
            handle: SessionHandle(1),
            session_id: SessionId(1),
            session_type: 0,
            chip_id: "chip0".to_string(),
            params: Params::new(Protocol::Fira),
            stack_priority: StackPriority::FG,
            uid: None,
            callbacks: callbacks.clone(),
        })
        .await
        .expect("admission should succeed");

    tokio::time::sleep(Duration::from_millis(50)).await;
    manager.start_ranging(handle).await.expect("start should be accepted");
    tokio::time::sleep(Duration::from_millis(50)).await;
    manager.stop_ranging(handle, SessionErrorKind::LocalApi).await.expect("stop should be accepted");
    tokio::time::sleep(Duration::from_millis(50)).await;
    manager.close_session(handle, SessionErrorKind::LocalApi).await.expect("close should be accepted");
    tokio::time::sleep(Duration::from_millis(50)).await;

    let events = callbacks.events();
    assert_eq!(events, vec!["opened", "started", "stopped", "closed"]);
    assert!(manager.registry().recently_closed_handles().await.contains(&handle));
}

#[tokio::test]
async fn admission_evicts_lower_priority_session_on_the_same_chip() {
    let manager = manager_with(test_config());
    let bg_callbacks = recording_callbacks();
    let system_callbacks = recording_callbacks();

    let bg_handle = manager
        .open_session(OpenSessionRequest {
            handle: SessionHandle(1),
            session_id: SessionId(1),
            session_type: 0,
            chip_id: "chip0".to_string(),
            params: Params::new(Protocol::Fira),
            stack_priority: StackPriority::BG,
            uid: None,
            callbacks: bg_callbacks.clone(),
        })
        .await
        .expect("first admission should succeed");
    tokio::time::sleep(Duration::from_millis(50)).await;

    let _system_handle = manager
        .open_session(OpenSessionRequest {
            handle: SessionHandle(2),
            session_id: SessionId(2),
            session_type: 0,
            chip_id: "chip0".to_string(),
            params: Params::new(Protocol::Fira),
            stack_priority: StackPriority::SYSTEM,
            uid: None,
            callbacks: system_callbacks.clone(),
        })
        .await
        .expect("second admission should preempt the bg session");

    // `open_session` awaits the evicted session's `closed` callback before
    // returning, so it must already have fired here — before any sleep, and
    // before the new session's own `opened` has necessarily been processed.
    assert!(bg_callbacks.events().contains(&"closed".to_string()));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(system_callbacks.events().contains(&"opened".to_string()));
    assert!(manager.registry().recently_closed_handles().await.contains(&bg_handle));
}

#[tokio::test]
async fn operations_against_an_unknown_handle_are_rejected() {
    let manager = manager_with(test_config());

    let err = manager.start_ranging(SessionHandle(404)).await.expect_err("unknown handle must fail");
    assert_eq!(err.kind, SessionErrorKind::InvalidSessionState);

    let err = manager
        .send_data(SessionHandle(404), SendInfo::new(crate::address::UwbAddress::Short(1), Params::new(Protocol::Fira), Bytes::from_static(b"x")))
        .await
        .expect_err("unknown handle must fail");
    assert_eq!(err.kind, SessionErrorKind::InvalidSessionState);
}
