// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Event Serializer (§4.6): a single-threaded cooperative event loop, one
//! per session, that is the only component allowed to mutate a
//! [`Session`] (aside from the Router's atomic `state`/`last_status_reason`
//! update, §5). Every session-mutating operation is posted as a
//! [`SessionEvent`] and processed strictly FIFO; steps that send a
//! command cooperatively await the matching notification with a timeout.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::advertise::AdvertiseTargetStore;
use crate::config::SessionManagerConfig;
use crate::data::{MulticastAction, SendInfo};
use crate::error::{SessionError, SessionErrorKind};
use crate::events::{MembershipChange, ReconfigureRequest, SessionEvent};
use crate::external::{AlarmService, ClientCallbacks, NativeUwbs};
use crate::params::{self, Params};
use crate::registry::{SessionEntry, SessionRegistry};
use crate::session::{Session, SessionState, SessionToken};

/// Everything an [`EventSerializer`] needs that is not carried by the
/// [`SessionEntry`] itself.
pub struct SerializerContext {
    pub native: Arc<dyn NativeUwbs>,
    pub alarms: Arc<dyn AlarmService>,
    pub registry: Arc<SessionRegistry>,
    pub advertise: Arc<Mutex<AdvertiseTargetStore>>,
    pub config: SessionManagerConfig,
}

/// Drives one session's event loop. Spawned once per admitted session;
/// exits once the channel closes (the registry removed the entry) or a
/// `Deinit`/`OnDeinit` event completes.
pub struct EventSerializer {
    entry: SessionEntry,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    ctx: SerializerContext,
    shutdown: CancellationToken,
}

impl EventSerializer {
    pub fn new(
        entry: SessionEntry,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        ctx: SerializerContext,
        shutdown: CancellationToken,
    ) -> Self {
        Self { entry, events, ctx, shutdown }
    }

    /// Spawn the loop as a background task, returning its handle.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run until the event channel closes or a close event finishes.
    pub async fn run(mut self) {
        let handle = self.entry.session.handle;
        loop {
            tokio::select! {
                event = self.events.recv() => {
                    let Some(event) = event else {
                        debug!(handle = handle.0, "serializer: event channel closed");
                        break;
                    };
                    let is_terminal = matches!(event, SessionEvent::Deinit { .. } | SessionEvent::OnDeinit);
                    self.handle_event(event).await;
                    if is_terminal {
                        break;
                    }
                }
                _ = self.shutdown.cancelled() => {
                    debug!(handle = handle.0, "serializer: shutdown requested, closing session");
                    self.handle_event(SessionEvent::Deinit { reason: SessionErrorKind::LocalApi }).await;
                    break;
                }
            }
        }
    }

    async fn handle_event(&mut self, event: SessionEvent) {
        let session = self.entry.session.clone();
        let result = match event {
            SessionEvent::OpenRanging => self.open_ranging(&session).await,
            SessionEvent::StartRanging => self.start_ranging(&session).await,
            SessionEvent::StopRanging { reason } => self.stop_ranging(&session, reason).await,
            SessionEvent::Reconfigure(req) => self.reconfigure(&session, req).await,
            SessionEvent::Deinit { reason } => self.deinit(&session, reason).await,
            SessionEvent::OnDeinit => self.on_deinit(&session).await,
            SessionEvent::SendData(info) => self.send_data(&session, info).await,
            SessionEvent::UpdateDtTagRounds { n, indices } => self.update_dt_tag_rounds(&session, n, &indices).await,
            SessionEvent::SetHusControllerConfig(cfg) => self.set_hus_controller_config(&session, cfg).await,
            SessionEvent::SetHusControleeConfig(cfg) => self.set_hus_controlee_config(&session, cfg).await,
            SessionEvent::DataTransferPhaseConfig(cfg) => self.data_transfer_phase_config(&session, cfg).await,
        };
        if let Err(err) = result {
            debug!(handle = session.handle.0, %err, "serializer: step failed");
        }
    }

    // -- OpenRanging ------------------------------------------------------

    async fn open_ranging(&self, session: &Arc<Session>) -> Result<(), SessionError> {
        let timeout = self.ctx.config.command_timeout;
        let status = self.ctx.native.init_session(session.session_id, session.session_type, &session.chip_id).await;
        if status != 0 {
            session.callbacks.opened_failed(SessionErrorKind::NativeFailure(status), &session.params().await);
            return Err(SessionError::native_failure(status));
        }

        if let Err(err) = session.wait_for_state(|s| s != SessionState::Init, timeout).await {
            session.callbacks.opened_failed(err.kind, &session.params().await);
            return Err(err);
        }

        session.commit_priority_to_uwbs().await;
        let params = self.resolve_absolute_initiation_time(session).await;

        let status = self.ctx.native.set_app_configurations(session.session_id, &params, &session.chip_id).await;
        session.set_pending_relative_initiation_ms(None).await;
        if status != 0 {
            session.callbacks.opened_failed(SessionErrorKind::NativeFailure(status), &params);
            return Err(SessionError::native_failure(status));
        }

        match session.wait_for_state(|s| s == SessionState::Idle, timeout).await {
            Ok(_) => {
                session.set_params(params.clone()).await;
                session.callbacks.opened(&params);
                info!(session_id = session.session_id.0, "session opened");
                Ok(())
            }
            Err(err) => {
                session.callbacks.opened_failed(err.kind, &params);
                Err(err)
            }
        }
    }

    /// For FiRa ≥ 2.0, if only a relative initiation time is set, query the
    /// UWBS clock and compute the absolute value; reset afterward so a
    /// later start re-queries (§4.6).
    async fn resolve_absolute_initiation_time(&self, session: &Arc<Session>) -> Params {
        let params = session.params().await;
        if params.protocol != params::Protocol::Fira {
            return params;
        }
        if params.absolute_initiation_time_us().is_some() {
            return params;
        }
        let Some(relative_ms) = params.relative_initiation_time_ms() else {
            return params;
        };

        session.set_pending_relative_initiation_ms(Some(relative_ms)).await;
        let now_us = self.ctx.native.query_uwbs_timestamp_us().await;
        let absolute = now_us + (relative_ms as u64) * 1000;
        params.with_field(crate::params::keys::INITIATION_TIME_ABSOLUTE_US, absolute)
    }

    // -- StartRanging -------------------------------------------------------

    async fn start_ranging(&self, session: &Arc<Session>) -> Result<(), SessionError> {
        let timeout = self.ctx.config.command_timeout;
        let status = self.ctx.native.start_ranging(session.session_id, &session.chip_id).await;
        if status != 0 {
            session.callbacks.start_failed(status);
            return Err(SessionError::native_failure(status));
        }

        match session.wait_for_state(|s| s == SessionState::Active, timeout).await {
            Ok(_) => {
                session.commit_priority_to_uwbs().await;
                let params = session.params().await;
                session.callbacks.started(&params);
                info!(session_id = session.session_id.0, "session started");
                Ok(())
            }
            Err(err) => {
                session.callbacks.start_failed(0xFF);
                Err(err)
            }
        }
    }

    // -- StopRanging ----------------------------------------------------

    async fn stop_ranging(&self, session: &Arc<Session>, reason: SessionErrorKind) -> Result<(), SessionError> {
        let timeout = self.ctx.config.command_timeout;
        let status = self.ctx.native.stop_ranging(session.session_id, &session.chip_id).await;
        if status != 0 {
            return Err(SessionError::native_failure(status));
        }

        let result = session.wait_for_state(|s| s == SessionState::Idle, timeout).await;

        session.cancel_all_timers(self.ctx.alarms.as_ref()).await;
        for addr in session.remote_addrs_seen().await {
            self.ctx.advertise.lock().await.remove(addr);
        }

        result?;
        session.callbacks.stopped(reason);
        info!(session_id = session.session_id.0, %reason, "session stopped");
        Ok(())
    }

    // -- Deinit / OnDeinit ------------------------------------------------

    async fn deinit(&self, session: &Arc<Session>, reason: SessionErrorKind) -> Result<(), SessionError> {
        let timeout = self.ctx.config.command_timeout;
        let status = self.ctx.native.deinit_session(session.session_id, &session.chip_id).await;
        if status != 0 {
            warn!(session_id = session.session_id.0, status, "deinit command failed, closing locally anyway");
        } else if let Err(err) = session.wait_for_state(|s| s == SessionState::Deinit, timeout).await {
            warn!(session_id = session.session_id.0, %err, "deinit notification never arrived, closing locally anyway");
        }
        self.finish_close(session, reason).await;
        Ok(())
    }

    /// A DEINIT notification arrived from the UWBS without a matching
    /// client-issued close (§4.2); run the same teardown.
    async fn on_deinit(&self, session: &Arc<Session>) -> Result<(), SessionError> {
        self.finish_close(session, SessionErrorKind::SystemPolicy).await;
        Ok(())
    }

    async fn finish_close(&self, session: &Arc<Session>, reason: SessionErrorKind) {
        session.cancel_all_timers(self.ctx.alarms.as_ref()).await;
        for addr in session.remote_addrs_seen().await {
            self.ctx.advertise.lock().await.remove(addr);
        }
        if session.is_closed().await {
            return;
        }
        self.ctx.registry.remove(session.handle).await;
        session.callbacks.closed(reason);
        session.mark_closed().await;
        session.notify_closed();
        info!(session_id = session.session_id.0, %reason, "session closed");
    }

    // -- Reconfigure --------------------------------------------------------

    async fn reconfigure(&self, session: &Arc<Session>, req: ReconfigureRequest) -> Result<(), SessionError> {
        let timeout = self.ctx.config.command_timeout;

        if let Some(membership) = &req.membership {
            self.apply_membership_change(session, membership, timeout).await?;
        }

        // Membership-only reconfigures have already taken effect via
        // controller_multicast_list_update; only a plain parameter change
        // needs a write-through app-config command (§4.6 step 5).
        if req.membership.is_none() {
            let status = self.ctx.native.set_app_configurations(session.session_id, &req.params, &session.chip_id).await;
            if status != 0 {
                session.callbacks.ranging_reconfigure_failed(status);
                return Err(SessionError::native_failure(status));
            }
        }
        session.set_params(req.params).await;

        if let Some(suspend) = req.suspend_resume {
            if suspend {
                session.callbacks.ranging_paused();
            } else {
                session.callbacks.ranging_resumed();
            }
        }

        if !req.suppress_terminal_callback {
            session.callbacks.ranging_reconfigured();
        }
        Ok(())
    }

    async fn apply_membership_change(
        &self,
        session: &Arc<Session>,
        membership: &MembershipChange,
        timeout: Duration,
    ) -> Result<(), SessionError> {
        let params = session.params().await;
        if !params.device_role_is_controller() {
            return Err(SessionError::new(SessionErrorKind::BadParameters));
        }
        let state = session.state().await;
        let deleting_while_idle = membership.action == MulticastAction::Delete && state == SessionState::Idle;
        if !matches!(state, SessionState::Active) && !deleting_while_idle {
            return Err(SessionError::new(SessionErrorKind::InvalidSessionState));
        }
        if !params.session_and_sub_session_keys_paired() {
            return Err(SessionError::new(SessionErrorKind::BadParameters));
        }

        let status = self
            .ctx
            .native
            .controller_multicast_list_update(
                session.session_id,
                membership.action,
                &membership.sub_session_ids,
                &membership.addrs,
                membership.keys.as_deref(),
                &session.chip_id,
            )
            .await;

        // A delete while Active reports its per-address outcome only on the
        // follow-up notification (§9 resolution), so the synchronous ack's
        // failures are not meaningful for that case and must not short-circuit
        // the wait below.
        let synchronous_delete_while_active = membership.action == MulticastAction::Delete && state == SessionState::Active;
        if !status.all_ok() && !synchronous_delete_while_active {
            for failure in status.failures() {
                match membership.action {
                    MulticastAction::Add => session.callbacks.controlee_add_failed(failure.addr, failure.status),
                    MulticastAction::Delete => {
                        session.callbacks.controlee_remove_failed(failure.addr, failure.status, SessionErrorKind::Rejected)
                    }
                }
            }
            return Ok(());
        }

        match membership.action {
            MulticastAction::Add => {
                for addr in &membership.addrs {
                    if session.add_controlee(*addr).await {
                        session.callbacks.controlee_added(*addr);
                    }
                }
            }
            MulticastAction::Delete if state == SessionState::Active => {
                let confirmed = session.wait_for_mcast_update_status(timeout).await?;
                for result in confirmed.per_address {
                    if result.status == 0 {
                        if session.remove_controlee(result.addr).await.is_some() {
                            session.callbacks.controlee_removed(result.addr, SessionErrorKind::LocalApi);
                        }
                    } else {
                        session.callbacks.controlee_remove_failed(result.addr, result.status, SessionErrorKind::Rejected);
                    }
                }
            }
            MulticastAction::Delete => {
                for addr in &membership.addrs {
                    if session.remove_controlee(*addr).await.is_some() {
                        session.callbacks.controlee_removed(*addr, SessionErrorKind::LocalApi);
                    }
                }
            }
        }
        Ok(())
    }

    // -- Data TX --------------------------------------------------------

    async fn send_data(&self, session: &Arc<Session>, mut info: SendInfo) -> Result<(), SessionError> {
        let seq = session.get_and_increment_data_tx_seq().await;
        session.add_send_info(seq, info.clone()).await;
        let payload = std::mem::take(&mut info.payload);
        let status = self
            .ctx
            .native
            .send_data(session.session_id, info.addr.to_extended(), 0, seq, payload, &session.chip_id)
            .await;
        if status != 0 {
            session.callbacks.data_send_failed(info.addr, status, session.token().await.unwrap_or(SessionToken(0)));
            session.remove_send_info(seq).await;
            return Err(SessionError::native_failure(status));
        }
        Ok(())
    }

    // -- DT-Tag / Hybrid session / data-transfer phase ---------------------

    async fn update_dt_tag_rounds(&self, session: &Arc<Session>, n: u8, indices: &[u8]) -> Result<(), SessionError> {
        let status = self.ctx.native.session_update_dt_tag_ranging_rounds(session.session_id, n, indices, &session.chip_id).await;
        session.callbacks.ranging_rounds_update_status(status);
        Ok(())
    }

    async fn set_hus_controller_config(
        &self,
        session: &Arc<Session>,
        cfg: crate::events::HusControllerConfig,
    ) -> Result<(), SessionError> {
        if !session.params().await.device_role_is_controller() {
            session.callbacks.hybrid_session_controller_failed(0xFF);
            return Err(SessionError::new(SessionErrorKind::BadParameters));
        }
        let status = self
            .ctx
            .native
            .set_hybrid_session_controller_configuration(
                session.session_id,
                cfg.message_control,
                cfg.n_phases,
                cfg.update_time,
                &cfg.phase_list_bytes,
                &session.chip_id,
            )
            .await;
        if status == 0 {
            session.callbacks.hybrid_session_controller_configured();
        } else {
            session.callbacks.hybrid_session_controller_failed(status);
        }
        Ok(())
    }

    async fn set_hus_controlee_config(
        &self,
        session: &Arc<Session>,
        cfg: crate::events::HusControleeConfig,
    ) -> Result<(), SessionError> {
        if session.params().await.device_role_is_controller() {
            session.callbacks.hybrid_session_controlee_failed(0xFF);
            return Err(SessionError::new(SessionErrorKind::BadParameters));
        }
        let status = self
            .ctx
            .native
            .set_hybrid_session_controllee_configuration(session.session_id, cfg.n_phases, &cfg.phase_list_bytes, &session.chip_id)
            .await;
        if status == 0 {
            session.callbacks.hybrid_session_controlee_configured();
        } else {
            session.callbacks.hybrid_session_controlee_failed(status);
        }
        Ok(())
    }

    async fn data_transfer_phase_config(
        &self,
        session: &Arc<Session>,
        cfg: crate::events::DataTransferPhaseConfig,
    ) -> Result<(), SessionError> {
        let status = self
            .ctx
            .native
            .set_data_transfer_phase_config(
                session.session_id,
                cfg.repetition,
                cfg.control,
                cfg.list_size,
                &cfg.mac_addrs,
                &cfg.slot_bitmap,
                &session.chip_id,
            )
            .await;
        if status.is_ok() {
            session.callbacks.data_transfer_phase_configured();
        } else {
            session.callbacks.data_transfer_phase_failed(status);
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "serializer_tests.rs"]
mod tests;
