// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Fg/Bg Observer & Timers (§4.7): foreground/background tracking for
//! non-privileged clients, the error-streak liveness policy, and the
//! background-app timeout. Timer fire callbacks run on the Serializer
//! by posting a [`SessionEvent`] rather than mutating [`Session`]
//! directly (§5).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};
use tracing::info;

use crate::address::UwbAddress;
use crate::config::SessionManagerConfig;
use crate::data::MulticastAction;
use crate::error::SessionErrorKind;
use crate::events::{MembershipChange, ReconfigureRequest, SessionEvent};
use crate::external::{AlarmService, ProcessImportanceListener};
use crate::registry::SessionRegistry;
use crate::router::{MeasurementStatus, MeasurementType, RangeData};
use crate::session::{Session, SessionHandle};

/// The error-streak and zero-measurement liveness policy run against
/// every `RANGE_DATA_NTF` (§4.7). Implemented as a trait so the
/// [`crate::router::NotificationRouter`] does not need a concrete
/// dependency on the timer bookkeeping below.
#[async_trait]
pub trait ErrorStreakPolicy: Send + Sync {
    async fn on_range_data(
        &self,
        session: Arc<Session>,
        events: mpsc::UnboundedSender<SessionEvent>,
        range_data: &RangeData,
    );
}

/// The standard error-streak policy (§4.7): per-controlee timers for
/// two-way controller sessions, a single session-level timer for
/// everything else.
pub struct StandardErrorStreakPolicy {
    alarms: Arc<dyn AlarmService>,
    error_streak_timeout_ms: u64,
}

impl StandardErrorStreakPolicy {
    pub fn new(alarms: Arc<dyn AlarmService>, error_streak_timeout_ms: u64) -> Self {
        Self { alarms, error_streak_timeout_ms }
    }

    async fn arm_session_timer_if_needed(
        &self,
        session: &Arc<Session>,
        events: &mpsc::UnboundedSender<SessionEvent>,
    ) {
        if session.error_streak_timer().await.is_some() {
            return;
        }
        let session_for_cb = session.clone();
        let events_for_cb = events.clone();
        let handle = self
            .alarms
            .set_exact_elapsed_wakeup(
                self.error_streak_timeout_ms,
                "error-streak-session",
                Arc::new(move || {
                    let session = session_for_cb.clone();
                    let events = events_for_cb.clone();
                    tokio::spawn(async move {
                        fire_session_timer(session, events).await;
                    });
                }),
            )
            .await;
        session.set_error_streak_timer(Some(handle)).await;
    }

    async fn cancel_session_timer(&self, session: &Arc<Session>) {
        if let Some(handle) = session.error_streak_timer().await {
            self.alarms.cancel(handle).await;
            session.set_error_streak_timer(None).await;
        }
    }

    async fn arm_controlee_timer_if_needed(
        &self,
        session: &Arc<Session>,
        events: &mpsc::UnboundedSender<SessionEvent>,
        addr: UwbAddress,
    ) {
        // Armed unconditionally on the first error for this address (§3,
        // §4.7: "start A's timer if not set") — there is no error-count gate.
        let should_arm = session.with_controlee_mut(addr, |c| c.error_streak_timer.is_none()).await.unwrap_or(false);
        if !should_arm {
            return;
        }

        let session_for_cb = session.clone();
        let events_for_cb = events.clone();
        let handle = self
            .alarms
            .set_exact_elapsed_wakeup(
                self.error_streak_timeout_ms,
                "error-streak-controlee",
                Arc::new(move || {
                    let session = session_for_cb.clone();
                    let events = events_for_cb.clone();
                    tokio::spawn(async move {
                        fire_controlee_timer(session, events, addr).await;
                    });
                }),
            )
            .await;
        session.with_controlee_mut(addr, |c| c.error_streak_timer = Some(handle)).await;
    }

    async fn cancel_controlee_timer(&self, session: &Arc<Session>, addr: UwbAddress) {
        let existing = session.with_controlee_mut(addr, |c| c.error_streak_timer.take()).await.flatten();
        if let Some(handle) = existing {
            self.alarms.cancel(handle).await;
        }
    }
}

/// Re-check-before-act: only stop the session if its error-streak timer
/// still holds this exact handle (it may have been cancelled by a
/// success notification that raced the fire) (§7).
async fn fire_session_timer(session: Arc<Session>, events: mpsc::UnboundedSender<SessionEvent>) {
    if session.is_closed().await || session.error_streak_timer().await.is_none() {
        return;
    }
    session.set_error_streak_timer(None).await;
    let _ = events.send(SessionEvent::StopRanging { reason: SessionErrorKind::SystemPolicy });
}

async fn fire_controlee_timer(session: Arc<Session>, events: mpsc::UnboundedSender<SessionEvent>, addr: UwbAddress) {
    if session.is_closed().await {
        return;
    }
    let still_armed = session.with_controlee_mut(addr, |c| c.error_streak_timer.take()).await;
    let Some(Some(_handle)) = still_armed else {
        return;
    };

    if session.controlee_count().await == 1 {
        let _ = events.send(SessionEvent::StopRanging { reason: SessionErrorKind::LostConnection });
    } else {
        let _ = events.send(SessionEvent::Reconfigure(ReconfigureRequest {
            params: session.params().await,
            membership: Some(MembershipChange {
                action: MulticastAction::Delete,
                addrs: vec![addr],
                sub_session_ids: Vec::new(),
                keys: None,
            }),
            suppress_terminal_callback: true,
            suspend_resume: None,
        }));
    }
}

#[async_trait]
impl ErrorStreakPolicy for StandardErrorStreakPolicy {
    async fn on_range_data(
        &self,
        session: Arc<Session>,
        events: mpsc::UnboundedSender<SessionEvent>,
        range_data: &RangeData,
    ) {
        let params = session.params().await;
        if !params.error_streak_timer_enabled() {
            return;
        }

        if range_data.measurements.is_empty() {
            // Workaround for a known UWBS edge case (§4.7).
            self.arm_session_timer_if_needed(&session, &events).await;
            return;
        }

        let is_two_way_controller = params.device_role_is_controller() && range_data.measurement_type == MeasurementType::TwoWay;

        if is_two_way_controller {
            for m in &range_data.measurements {
                match m.status {
                    MeasurementStatus::Ok => {
                        self.cancel_controlee_timer(&session, m.addr).await;
                        self.cancel_session_timer(&session).await;
                    }
                    MeasurementStatus::Error(_) => {
                        self.arm_controlee_timer_if_needed(&session, &events, m.addr).await;
                    }
                }
            }
        } else {
            let all_error = range_data.measurements.iter().all(|m| !m.status.is_ok());
            if all_error {
                self.arm_session_timer_if_needed(&session, &events).await;
            } else {
                self.cancel_session_timer(&session).await;
            }
        }
    }
}

/// Tracks the last-known foreground/background state per session and
/// drives the bg-app timer (§4.7).
pub struct FgBgTimers {
    registry: Arc<SessionRegistry>,
    alarms: Arc<dyn AlarmService>,
    config: SessionManagerConfig,
    recorded_fg: RwLock<HashMap<SessionHandle, bool>>,
}

impl FgBgTimers {
    pub fn new(registry: Arc<SessionRegistry>, alarms: Arc<dyn AlarmService>, config: SessionManagerConfig) -> Self {
        Self { registry, alarms, config, recorded_fg: RwLock::new(HashMap::new()) }
    }

    async fn handle_importance_change(&self, uid: u32, is_fg: bool) {
        let entries = self.registry.sessions_for_uid(uid).await;
        for entry in entries {
            let handle = entry.session.handle;
            let unchanged = self.recorded_fg.read().await.get(&handle).copied() == Some(is_fg);
            if unchanged {
                continue;
            }
            self.recorded_fg.write().await.insert(handle, is_fg);

            let outcome = entry.session.on_fg_bg_change(is_fg, self.config.background_ranging_allowed).await;

            if outcome.reconfigure_gating {
                let params = entry
                    .session
                    .params()
                    .await
                    .with_field(crate::params::keys::RANGE_DATA_NTF_CONFIG, outcome.gating_enabled);
                let _ = entry.events.send(SessionEvent::Reconfigure(ReconfigureRequest {
                    params,
                    membership: None,
                    suppress_terminal_callback: true,
                    suspend_resume: None,
                }));
            }

            if outcome.stop_bg_timer {
                if let Some(bg_handle) = entry.session.bg_app_timer().await {
                    self.alarms.cancel(bg_handle).await;
                    entry.session.set_bg_app_timer(None).await;
                }
            } else if outcome.start_bg_timer && entry.session.bg_app_timer().await.is_none() {
                self.start_bg_timer(&entry.session, &entry.events).await;
            }
        }
    }

    async fn start_bg_timer(&self, session: &Arc<Session>, events: &mpsc::UnboundedSender<SessionEvent>) {
        let session_for_cb = session.clone();
        let events_for_cb = events.clone();
        let when_ms = self.config.bg_app_timeout.as_millis() as u64;
        let handle = self
            .alarms
            .set_exact_elapsed_wakeup(
                when_ms,
                "bg-app-timeout",
                Arc::new(move || {
                    let session = session_for_cb.clone();
                    let events = events_for_cb.clone();
                    tokio::spawn(async move {
                        fire_bg_timer(session, events).await;
                    });
                }),
            )
            .await;
        session.set_bg_app_timer(Some(handle)).await;
    }
}

async fn fire_bg_timer(session: Arc<Session>, events: mpsc::UnboundedSender<SessionEvent>) {
    if session.is_closed().await || session.bg_app_timer().await.is_none() {
        return;
    }
    session.set_bg_app_timer(None).await;
    let _ = events.send(SessionEvent::StopRanging { reason: SessionErrorKind::SystemPolicy });
}

impl ProcessImportanceListener for FgBgTimers {
    fn on_importance_changed(&self, uid: u32, is_foreground: bool) {
        info!(uid, is_foreground, "process importance changed");
    }
}

/// Separate entry point for use from an async context: the trait method
/// above is synchronous per its external-interface contract (§6), so it
/// just spawns this.
impl FgBgTimers {
    pub fn dispatch_importance_change(self: &Arc<Self>, uid: u32, is_foreground: bool) {
        let this = self.clone();
        tokio::spawn(async move {
            this.handle_importance_change(uid, is_foreground).await;
        });
    }
}

#[cfg(test)]
#[path = "timers_tests.rs"]
mod tests;
