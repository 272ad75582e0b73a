// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-session state (§3, §4.4): parameters, state-machine state, the
//! controlee set, buffered received packets, pending sends, timer
//! handles, priority, and the client callback sink.
//!
//! A [`Session`] is exclusively owned by the [`crate::SessionRegistry`]
//! while registered. Only the [`crate::serializer::EventSerializer`]
//! mutates session state; the [`crate::router::NotificationRouter`]
//! updates `state` and `last_status_reason` atomically under the
//! session's own monitor and wakes any waiter (§5, §9).

pub mod controlee;
pub mod state;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{Mutex, Notify};

use crate::address::UwbAddress;
use crate::config::StackPriority;
use crate::data::{ReceivedBuffer, SendInfo, TxSequenceAllocator};
use crate::error::{SessionError, SessionErrorKind};
use crate::external::{AlarmHandle, ClientCallbacks};
use crate::params::{Params, Protocol};

pub use controlee::ControleeRecord;
pub use state::SessionState;

/// Opaque identifier minted by the client stack (§3). Equality is used to
/// locate the session; the core never interprets its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(pub u64);

/// The client-supplied, app-visible session number (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u32);

/// Returned by the UWBS after INIT; used for cross-session references
/// such as hybrid-session time bases (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionToken(pub u32);

/// What a foreground/background transition asks the caller to do next
/// (§4.4's `on_fg_bg_change`). Session itself never touches the alarm
/// service or posts Serializer events — it only computes the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FgBgOutcome {
    /// Range-data notification gating should be reconfigured: enabled
    /// using the session's own gating fields when now foreground,
    /// unconditionally disabled when now background.
    pub reconfigure_gating: bool,
    pub gating_enabled: bool,
    /// True if background ranging is not permitted by policy and the
    /// bg-app timer must be (re)started.
    pub start_bg_timer: bool,
    /// True if returning to foreground should cancel a running bg-app
    /// timer.
    pub stop_bg_timer: bool,
}

/// Mutable fields guarded by the session's monitor (§9): a mutex paired
/// with a condition variable ([`Notify`]), so the Serializer can await a
/// state transition the Router will eventually publish.
struct Inner {
    token: Option<SessionToken>,
    params: Params,
    state: SessionState,
    last_status_reason: u8,
    stack_priority: StackPriority,
    priority_override: bool,
    priority_given_to_uwbs: Option<StackPriority>,
    needs_app_config_update: bool,
    needs_uwbs_timestamp_query: bool,
    pending_relative_initiation_ms: Option<u32>,
    controlees: HashMap<UwbAddress, ControleeRecord>,
    received_data: HashMap<UwbAddress, ReceivedBuffer>,
    send_data_pending: BTreeMap<u16, SendInfo>,
    tx_seq: TxSequenceAllocator,
    mcast_update_status: Option<crate::data::MulticastUpdateStatus>,
    error_streak_timer: Option<AlarmHandle>,
    bg_app_timer: Option<AlarmHandle>,
    remote_addrs_seen: HashSet<UwbAddress>,
    closed: bool,
}

/// The central per-session entity (§3, §4.4).
pub struct Session {
    pub handle: SessionHandle,
    pub session_id: SessionId,
    pub session_type: u8,
    pub protocol: Protocol,
    pub chip_id: String,
    pub max_received_packets: usize,
    inner: Mutex<Inner>,
    notify: Notify,
    pub callbacks: Arc<dyn ClientCallbacks>,
}

impl Session {
    pub fn new(
        handle: SessionHandle,
        session_id: SessionId,
        session_type: u8,
        chip_id: impl Into<String>,
        params: Params,
        stack_priority: StackPriority,
        max_received_packets: usize,
        callbacks: Arc<dyn ClientCallbacks>,
    ) -> Self {
        let protocol = params.protocol;
        Self {
            handle,
            session_id,
            session_type,
            protocol,
            chip_id: chip_id.into(),
            max_received_packets,
            inner: Mutex::new(Inner {
                token: None,
                params,
                state: SessionState::Init,
                last_status_reason: 0,
                stack_priority,
                priority_override: false,
                priority_given_to_uwbs: None,
                needs_app_config_update: false,
                needs_uwbs_timestamp_query: false,
                pending_relative_initiation_ms: None,
                controlees: HashMap::new(),
                received_data: HashMap::new(),
                send_data_pending: BTreeMap::new(),
                tx_seq: TxSequenceAllocator::default(),
                mcast_update_status: None,
                error_streak_timer: None,
                bg_app_timer: None,
                remote_addrs_seen: HashSet::new(),
                closed: false,
            }),
            notify: Notify::new(),
            callbacks,
        }
    }

    // -- state & params -------------------------------------------------

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    /// Set the session's state and wake any Serializer step awaiting a
    /// transition. Called by the [`crate::router::NotificationRouter`]
    /// under the session monitor (§5).
    pub async fn set_state(&self, new: SessionState) {
        self.inner.lock().await.state = new;
        self.notify.notify_waiters();
    }

    pub async fn last_status_reason(&self) -> u8 {
        self.inner.lock().await.last_status_reason
    }

    pub async fn set_status(&self, new_state: SessionState, reason: u8) {
        let mut inner = self.inner.lock().await;
        inner.state = new_state;
        inner.last_status_reason = reason;
        drop(inner);
        self.notify.notify_waiters();
    }

    pub async fn token(&self) -> Option<SessionToken> {
        self.inner.lock().await.token
    }

    pub async fn set_token(&self, token: SessionToken) {
        self.inner.lock().await.token = Some(token);
    }

    pub async fn params(&self) -> Params {
        self.inner.lock().await.params.clone()
    }

    pub async fn set_params(&self, new: Params) {
        self.inner.lock().await.params = new;
    }

    /// Await until `predicate(state)` holds, or until `timeout` elapses.
    /// This is the predicate-on-monitor-fields correlation §9 describes:
    /// the command/matching-notification pair is observed atomically by
    /// whichever Serializer step is awaiting here.
    pub async fn wait_for_state<F>(&self, predicate: F, timeout: Duration) -> Result<SessionState, SessionError>
    where
        F: Fn(SessionState) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let current = self.state().await;
            if predicate(current) {
                return Ok(current);
            }
            let notified = self.notify.notified();
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(SessionError::timeout());
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return Err(SessionError::timeout());
            }
        }
    }

    // -- priority ---------------------------------------------------------

    pub async fn stack_priority(&self) -> StackPriority {
        self.inner.lock().await.stack_priority
    }

    pub async fn priority_given_to_uwbs(&self) -> Option<StackPriority> {
        self.inner.lock().await.priority_given_to_uwbs
    }

    /// Snapshot the current `stack_priority` as `priority_given_to_uwbs`.
    /// Called only on OPEN or START (§3, invariant 6).
    pub async fn commit_priority_to_uwbs(&self) {
        let mut inner = self.inner.lock().await;
        inner.priority_given_to_uwbs = Some(inner.stack_priority);
    }

    pub async fn set_priority_override(&self, value: bool) {
        self.inner.lock().await.priority_override = value;
    }

    /// Recompute `stack_priority` for a foreground/background
    /// transition and decide what the caller should do about gating and
    /// the bg-app timer (§4.4's `on_fg_bg_change`).
    pub async fn on_fg_bg_change(
        &self,
        is_fg: bool,
        background_ranging_allowed: bool,
    ) -> FgBgOutcome {
        let mut inner = self.inner.lock().await;
        if !inner.priority_override {
            inner.stack_priority =
                if is_fg { StackPriority::FG } else { StackPriority::BG };
        }

        FgBgOutcome {
            reconfigure_gating: true,
            gating_enabled: is_fg,
            start_bg_timer: !is_fg && !background_ranging_allowed,
            stop_bg_timer: is_fg,
        }
    }

    // -- controlees ---------------------------------------------------------

    /// Idempotent add: a duplicate target emits `controlee_add_failed`
    /// and returns `false` (§4.4).
    pub async fn add_controlee(&self, addr: UwbAddress) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.controlees.contains_key(&addr) {
            drop(inner);
            self.callbacks.controlee_add_failed(addr, 0xFF);
            return false;
        }
        inner.controlees.insert(addr, ControleeRecord::default());
        true
    }

    /// Idempotent remove: a missing target emits `controlee_remove_failed`
    /// and returns `None` (§4.4).
    pub async fn remove_controlee(&self, addr: UwbAddress) -> Option<ControleeRecord> {
        let mut inner = self.inner.lock().await;
        match inner.controlees.remove(&addr) {
            Some(record) => Some(record),
            None => {
                drop(inner);
                self.callbacks.controlee_remove_failed(addr, 0xFF, SessionErrorKind::Rejected);
                None
            }
        }
    }

    pub async fn controlee_count(&self) -> usize {
        self.inner.lock().await.controlees.len()
    }

    pub async fn controlee_addrs(&self) -> Vec<UwbAddress> {
        self.inner.lock().await.controlees.keys().copied().collect()
    }

    pub async fn has_controlee(&self, addr: UwbAddress) -> bool {
        self.inner.lock().await.controlees.contains_key(&addr)
    }

    pub async fn with_controlee_mut<F, T>(&self, addr: UwbAddress, f: F) -> Option<T>
    where
        F: FnOnce(&mut ControleeRecord) -> T,
    {
        let mut inner = self.inner.lock().await;
        inner.controlees.get_mut(&addr).map(f)
    }

    // -- data TX/RX ---------------------------------------------------------

    pub async fn get_and_increment_data_tx_seq(&self) -> u16 {
        self.inner.lock().await.tx_seq.next()
    }

    pub async fn add_send_info(&self, seq: u16, info: SendInfo) {
        self.inner.lock().await.send_data_pending.insert(seq, info);
    }

    pub async fn remove_send_info(&self, seq: u16) -> Option<SendInfo> {
        self.inner.lock().await.send_data_pending.remove(&seq)
    }

    pub async fn get_send_info(&self, seq: u16) -> Option<SendInfo> {
        self.inner.lock().await.send_data_pending.get(&seq).cloned()
    }

    pub async fn update_send_info<F>(&self, seq: u16, f: F)
    where
        F: FnOnce(&mut SendInfo),
    {
        if let Some(info) = self.inner.lock().await.send_data_pending.get_mut(&seq) {
            f(info);
        }
    }

    pub async fn pending_send_count(&self) -> usize {
        self.inner.lock().await.send_data_pending.len()
    }

    pub async fn add_received(&self, addr: UwbAddress, seq: u16, payload: Bytes) {
        let mut inner = self.inner.lock().await;
        let cap = self.max_received_packets;
        inner.received_data.entry(addr).or_insert_with(|| ReceivedBuffer::new(cap)).insert(seq, payload);
        inner.remote_addrs_seen.insert(addr);
    }

    pub async fn drain_received(&self, addr: UwbAddress) -> Vec<(u16, Bytes)> {
        let mut inner = self.inner.lock().await;
        match inner.received_data.get_mut(&addr) {
            Some(buf) => buf.drain_ordered(),
            None => Vec::new(),
        }
    }

    pub async fn remote_addrs_seen(&self) -> Vec<UwbAddress> {
        self.inner.lock().await.remote_addrs_seen.iter().copied().collect()
    }

    // -- multicast-list update status -------------------------------------

    pub async fn set_mcast_update_status(&self, status: crate::data::MulticastUpdateStatus) {
        self.inner.lock().await.mcast_update_status = Some(status);
        self.notify.notify_waiters();
    }

    pub async fn take_mcast_update_status(&self) -> Option<crate::data::MulticastUpdateStatus> {
        self.inner.lock().await.mcast_update_status.take()
    }

    pub async fn wait_for_mcast_update_status(
        &self,
        timeout: Duration,
    ) -> Result<crate::data::MulticastUpdateStatus, SessionError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(status) = self.take_mcast_update_status().await {
                return Ok(status);
            }
            let notified = self.notify.notified();
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(SessionError::timeout());
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return Err(SessionError::timeout());
            }
        }
    }

    // -- timer handles ------------------------------------------------------

    pub async fn error_streak_timer(&self) -> Option<AlarmHandle> {
        self.inner.lock().await.error_streak_timer
    }

    pub async fn set_error_streak_timer(&self, handle: Option<AlarmHandle>) {
        self.inner.lock().await.error_streak_timer = handle;
    }

    pub async fn bg_app_timer(&self) -> Option<AlarmHandle> {
        self.inner.lock().await.bg_app_timer
    }

    pub async fn set_bg_app_timer(&self, handle: Option<AlarmHandle>) {
        self.inner.lock().await.bg_app_timer = handle;
    }

    /// Cancel every timer this session owns: the session-level error
    /// streak timer, every per-controlee error-streak timer, and the
    /// bg-app timer (§3: "Timer handles held by a Session are cancelled
    /// on any exit from Active back to Idle or on teardown.").
    pub async fn cancel_all_timers(&self, alarms: &dyn crate::external::AlarmService) {
        let (session_timer, bg_timer, controlee_timers) = {
            let mut inner = self.inner.lock().await;
            let session_timer = inner.error_streak_timer.take();
            let bg_timer = inner.bg_app_timer.take();
            let controlee_timers: Vec<AlarmHandle> = inner
                .controlees
                .values_mut()
                .filter_map(|c| c.error_streak_timer.take())
                .collect();
            (session_timer, bg_timer, controlee_timers)
        };
        if let Some(h) = session_timer {
            alarms.cancel(h).await;
        }
        if let Some(h) = bg_timer {
            alarms.cancel(h).await;
        }
        for h in controlee_timers {
            alarms.cancel(h).await;
        }
    }

    // -- app-config / timestamp query flags --------------------------------

    pub async fn needs_app_config_update(&self) -> bool {
        self.inner.lock().await.needs_app_config_update
    }

    pub async fn set_needs_app_config_update(&self, value: bool) {
        self.inner.lock().await.needs_app_config_update = value;
    }

    pub async fn needs_uwbs_timestamp_query(&self) -> bool {
        self.inner.lock().await.needs_uwbs_timestamp_query
    }

    pub async fn set_needs_uwbs_timestamp_query(&self, value: bool) {
        self.inner.lock().await.needs_uwbs_timestamp_query = value;
    }

    pub async fn pending_relative_initiation_ms(&self) -> Option<u32> {
        self.inner.lock().await.pending_relative_initiation_ms
    }

    pub async fn set_pending_relative_initiation_ms(&self, value: Option<u32>) {
        self.inner.lock().await.pending_relative_initiation_ms = value;
    }

    // -- lifecycle guard ------------------------------------------------

    /// True once `closed` has been emitted; callers must not emit any
    /// further callback for this session afterward (§8).
    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.closed
    }

    pub async fn mark_closed(&self) {
        self.inner.lock().await.closed = true;
    }

    /// Wake any [`Session::wait_until_closed`] waiter. Called once the
    /// `closed` callback has actually been delivered, not merely queued
    /// (§8: eviction ordering relies on this happening after the callback).
    pub fn notify_closed(&self) {
        self.notify.notify_waiters();
    }

    /// Await until the `closed` callback has fired for this session (via
    /// [`Session::notify_closed`]), or until `timeout` elapses. Used to
    /// order an eviction's `closed` callback ahead of the newly admitted
    /// session's `opened` (§8).
    pub async fn wait_until_closed(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.is_closed().await {
                return true;
            }
            let notified = self.notify.notified();
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return false;
            }
        }
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
