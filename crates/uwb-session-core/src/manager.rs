// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Top-level facade wiring the Registry (§4.5), Router (§4.2), Fg/Bg
//! Timers (§4.7), and a per-session Serializer (§4.6) into the single
//! entry point an embedding application drives. Nothing here carries
//! session-mutating logic of its own — it admits, spawns, and posts
//! events, the way `groblegark-coop`'s `MuxState` wires its shared
//! table to the upstream client tasks it owns.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::advertise::AdvertiseTargetStore;
use crate::config::{SessionManagerConfig, StackPriority};
use crate::data::SendInfo;
use crate::error::{SessionError, SessionErrorKind};
use crate::events::{DataTransferPhaseConfig, HusControleeConfig, HusControllerConfig, ReconfigureRequest, SessionEvent};
use crate::external::{AlarmService, ClientCallbacks, MetricsSink, NativeUwbs, NoopMetricsSink};
use crate::params::Params;
use crate::registry::{AdmissionError, AdmissionRequest, SessionRegistry};
use crate::router::NotificationRouter;
use crate::serializer::{EventSerializer, SerializerContext};
use crate::session::{SessionHandle, SessionId};
use crate::timers::{ErrorStreakPolicy, FgBgTimers, StandardErrorStreakPolicy};

/// Everything the embedding application supplies once at startup (§6):
/// the native UWBS driver, the alarm service, and (optionally) a metrics
/// sink. `byte_order` is the platform wrapper from §4.1.
pub struct SessionManagerDeps {
    pub native: Arc<dyn NativeUwbs>,
    pub alarms: Arc<dyn AlarmService>,
    pub metrics: Arc<dyn MetricsSink>,
    pub byte_order: crate::address::ByteOrder,
}

impl SessionManagerDeps {
    pub fn new(native: Arc<dyn NativeUwbs>, alarms: Arc<dyn AlarmService>, byte_order: crate::address::ByteOrder) -> Self {
        Self { native, alarms, metrics: Arc::new(NoopMetricsSink), byte_order }
    }
}

/// A request to open a new session (§4.4.1, `opened`/`opened_failed`).
pub struct OpenSessionRequest {
    pub handle: SessionHandle,
    pub session_id: SessionId,
    pub session_type: u8,
    pub chip_id: String,
    pub params: Params,
    pub stack_priority: StackPriority,
    pub uid: Option<u32>,
    pub callbacks: Arc<dyn ClientCallbacks>,
}

/// The wired-up Session Manager (§2): owns the Registry, the Router, the
/// Fg/Bg Timers, and the shared advertise-target store, and spawns one
/// [`EventSerializer`] per admitted session.
pub struct SessionManager {
    registry: Arc<SessionRegistry>,
    router: Arc<NotificationRouter>,
    fg_bg: Arc<FgBgTimers>,
    advertise: Arc<Mutex<AdvertiseTargetStore>>,
    native: Arc<dyn NativeUwbs>,
    alarms: Arc<dyn AlarmService>,
    config: SessionManagerConfig,
}

impl SessionManager {
    /// Construct a manager around a fresh [`SessionRegistry`] built from
    /// `config`.
    pub fn new(config: SessionManagerConfig, deps: SessionManagerDeps) -> Self {
        Self::with_registry(Arc::new(SessionRegistry::new(config)), deps)
    }

    /// Construct a manager around an existing [`SessionRegistry`] (its
    /// `config()` is reused for the Serializer/Fg-Bg-Timers wiring).
    /// Lets an embedding application — or a test double that needs to
    /// drive notifications back into the same registry the manager
    /// admits sessions into — own the registry directly.
    pub fn with_registry(registry: Arc<SessionRegistry>, deps: SessionManagerDeps) -> Self {
        let config = registry.config().clone();
        let advertise = Arc::new(Mutex::new(AdvertiseTargetStore::new()));
        let error_streak: Arc<dyn ErrorStreakPolicy> =
            Arc::new(StandardErrorStreakPolicy::new(deps.alarms.clone(), config.error_streak_timeout_ms));
        let router = Arc::new(NotificationRouter::new(
            registry.clone(),
            advertise.clone(),
            deps.metrics.clone(),
            error_streak,
            deps.byte_order,
        ));
        let fg_bg = Arc::new(FgBgTimers::new(registry.clone(), deps.alarms.clone(), config.clone()));

        Self { registry, router, fg_bg, advertise, native: deps.native, alarms: deps.alarms, config }
    }

    /// The Router sink to wire the native UWBS notification callbacks
    /// against (§4.2). The embedding application calls its methods
    /// directly from whatever notification thread the native driver
    /// delivers on.
    pub fn router(&self) -> &Arc<NotificationRouter> {
        &self.router
    }

    /// The Fg/Bg observer to register with the platform's process-
    /// importance service (§4.7).
    pub fn fg_bg_timers(&self) -> &Arc<FgBgTimers> {
        &self.fg_bg
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Admit a new session, spawn its [`EventSerializer`], and post the
    /// `OpenRanging` event (§4.4.1: `open_cmd_ack & INIT_NTF` → `Idle`
    /// → `opened`). Any session evicted to make room is closed first.
    pub async fn open_session(&self, req: OpenSessionRequest) -> Result<SessionHandle, AdmissionError> {
        let admitted = self
            .registry
            .admit(AdmissionRequest {
                handle: req.handle,
                session_id: req.session_id,
                session_type: req.session_type,
                chip_id: req.chip_id,
                params: req.params,
                stack_priority: req.stack_priority,
                uid: req.uid,
                callbacks: req.callbacks,
            })
            .await?;

        if let Some(evicted) = admitted.evicted {
            warn!(handle = evicted.session.handle.0, "evicting lower-priority session for new admission");
            let _ = evicted.events.send(SessionEvent::Deinit { reason: SessionErrorKind::MaxSessionsReached });
            // Block the new session's `opened` until the evicted one's
            // `closed` has actually fired, so callbacks observe eviction
            // before admission (§8 Scenario 2).
            evicted.session.wait_until_closed(self.config.command_timeout).await;
        }

        let ctx = SerializerContext {
            native: self.native.clone(),
            alarms: self.alarms.clone(),
            registry: self.registry.clone(),
            advertise: self.advertise.clone(),
            config: self.config.clone(),
        };
        let serializer = EventSerializer::new(admitted.entry.clone(), admitted.event_rx, ctx, CancellationToken::new());
        serializer.spawn();

        let handle = admitted.entry.session.handle;
        let _ = admitted.entry.events.send(SessionEvent::OpenRanging);
        Ok(handle)
    }

    pub async fn start_ranging(&self, handle: SessionHandle) -> Result<(), SessionError> {
        self.lookup_then_post(handle, SessionEvent::StartRanging).await
    }

    pub async fn stop_ranging(&self, handle: SessionHandle, reason: SessionErrorKind) -> Result<(), SessionError> {
        self.lookup_then_post(handle, SessionEvent::StopRanging { reason }).await
    }

    pub async fn close_session(&self, handle: SessionHandle, reason: SessionErrorKind) -> Result<(), SessionError> {
        self.lookup_then_post(handle, SessionEvent::Deinit { reason }).await
    }

    pub async fn send_data(&self, handle: SessionHandle, info: SendInfo) -> Result<(), SessionError> {
        self.lookup_then_post(handle, SessionEvent::SendData(info)).await
    }

    pub async fn reconfigure(&self, handle: SessionHandle, req: ReconfigureRequest) -> Result<(), SessionError> {
        self.lookup_then_post(handle, SessionEvent::Reconfigure(req)).await
    }

    pub async fn update_dt_tag_rounds(&self, handle: SessionHandle, n: u8, indices: Vec<u8>) -> Result<(), SessionError> {
        self.lookup_then_post(handle, SessionEvent::UpdateDtTagRounds { n, indices }).await
    }

    pub async fn set_hus_controller_config(&self, handle: SessionHandle, cfg: HusControllerConfig) -> Result<(), SessionError> {
        self.lookup_then_post(handle, SessionEvent::SetHusControllerConfig(cfg)).await
    }

    pub async fn set_hus_controlee_config(&self, handle: SessionHandle, cfg: HusControleeConfig) -> Result<(), SessionError> {
        self.lookup_then_post(handle, SessionEvent::SetHusControleeConfig(cfg)).await
    }

    pub async fn data_transfer_phase_config(&self, handle: SessionHandle, cfg: DataTransferPhaseConfig) -> Result<(), SessionError> {
        self.lookup_then_post(handle, SessionEvent::DataTransferPhaseConfig(cfg)).await
    }

    /// The client-process liveness hook (§3): a client death is
    /// equivalent to a DEINIT.
    pub async fn on_client_died(&self, handle: SessionHandle) {
        let _ = self.close_session(handle, SessionErrorKind::LocalApi).await;
    }

    async fn lookup_then_post(&self, handle: SessionHandle, event: SessionEvent) -> Result<(), SessionError> {
        let Some(entry) = self.registry.lookup_by_handle(handle).await else {
            return Err(SessionError::with_detail(SessionErrorKind::InvalidSessionState, "unknown session handle"));
        };
        entry
            .events
            .send(event)
            .map_err(|_| SessionError::with_detail(SessionErrorKind::InvalidSessionState, "session already closed"))
    }
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
