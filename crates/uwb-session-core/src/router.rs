// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Notification Router (§4.2): fan-in of asynchronous UWBS notifications
//! to the owning session. Every entry point here is non-blocking — work
//! that can block (timer arming, draining buffered packets) is spawned
//! rather than awaited inline, since the Router runs on the UWBS
//! notification thread(s) (§5).

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::address::{ByteOrder, UwbAddress};
use crate::advertise::{AdvertiseTargetStore, OwrMeasurement};
use crate::data::{DataSendStatus, MulticastUpdateStatus};
use crate::error::SessionErrorKind;
use crate::events::SessionEvent;
use crate::external::MetricsSink;
use crate::registry::SessionRegistry;
use crate::session::{SessionId, SessionState, SessionToken};
use crate::timers::ErrorStreakPolicy;

/// UCI reason code meaning the state change was driven by an explicit
/// session-management command rather than a UWBS-initiated transition
/// (§4.4.1).
pub const REASON_STATE_CHANGE_WITH_SESSION_MANAGEMENT_COMMANDS: u8 = 0;

/// The kind of ranging measurement a [`RangeData`] notification carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasurementType {
    TwoWay,
    OwrAoa,
    DlTdoa,
    Other(u8),
}

/// Per-address status of one ranging measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasurementStatus {
    Ok,
    Error(u8),
}

impl MeasurementStatus {
    pub fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// One address's ranging result within a [`RangeData`] notification.
#[derive(Debug, Clone, Copy)]
pub struct Measurement {
    pub addr: UwbAddress,
    pub status: MeasurementStatus,
    /// Present only for OwR-AoA measurements.
    pub aoa_azimuth_deg: Option<f32>,
}

/// A `RANGE_DATA_NTF` notification (§4.2, §4.3).
#[derive(Debug, Clone)]
pub struct RangeData {
    pub session_id: SessionId,
    pub session_token: SessionToken,
    pub measurement_type: MeasurementType,
    pub measurements: Vec<Measurement>,
}

/// Fan-in point for every asynchronous UWBS notification (§4.2).
pub struct NotificationRouter {
    registry: Arc<SessionRegistry>,
    advertise: Arc<Mutex<AdvertiseTargetStore>>,
    metrics: Arc<dyn MetricsSink>,
    error_streak: Arc<dyn ErrorStreakPolicy>,
    byte_order: ByteOrder,
}

impl NotificationRouter {
    pub fn new(
        registry: Arc<SessionRegistry>,
        advertise: Arc<Mutex<AdvertiseTargetStore>>,
        metrics: Arc<dyn MetricsSink>,
        error_streak: Arc<dyn ErrorStreakPolicy>,
        byte_order: ByteOrder,
    ) -> Self {
        Self { registry, advertise, metrics, error_streak, byte_order }
    }

    /// `on_session_status` (§4.2): update the session's state and reason
    /// atomically, wake any Serializer step waiting on a transition, and
    /// apply the UWBS-initiated side effects from §4.4.1.
    pub fn on_session_status(&self, session_id: SessionId, _token: SessionToken, state: SessionState, reason: u8) {
        let registry = self.registry.clone();
        tokio::spawn(async move {
            let Some(entry) = registry.lookup_by_session_id(session_id).await else {
                debug!(?session_id, "on_session_status: unknown session");
                return;
            };
            if entry.session.is_closed().await {
                return;
            }

            let prior = entry.session.state().await;
            entry.session.set_status(state, reason).await;

            if prior == SessionState::Active
                && state == SessionState::Idle
                && reason != REASON_STATE_CHANGE_WITH_SESSION_MANAGEMENT_COMMANDS
            {
                entry.session.callbacks.stopped_with_reason(reason);
            }

            if state == SessionState::Deinit {
                let _ = entry.events.send(SessionEvent::OnDeinit);
            }
        });
    }

    /// `on_range_data` (§4.2): forward to the client, then run the
    /// error-streak policy (§4.7) and, for OwR-AoA, the advertise-target
    /// post-processing (§4.3).
    pub fn on_range_data(&self, range_data: RangeData) {
        let registry = self.registry.clone();
        let advertise = self.advertise.clone();
        let error_streak = self.error_streak.clone();
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            let Some(entry) = registry.lookup_by_session_id(range_data.session_id).await else {
                debug!(session_id = ?range_data.session_id, "on_range_data: unknown session");
                return;
            };
            if entry.session.is_closed().await {
                return;
            }

            metrics.count("range_data", Some(range_data.session_id));
            entry.session.callbacks.ranging_result(&range_data);

            error_streak
                .on_range_data(entry.session.clone(), entry.events.clone(), &range_data)
                .await;

            if range_data.measurement_type == MeasurementType::OwrAoa {
                let mut store = advertise.lock().await;
                for m in &range_data.measurements {
                    if !m.status.is_ok() {
                        continue;
                    }
                    let Some(azimuth_deg) = m.aoa_azimuth_deg else { continue };
                    store.update(m.addr, OwrMeasurement { azimuth_deg, observed_at: std::time::Instant::now() });
                    if store.is_pointed(m.addr, &Default::default()) {
                        let drained = entry.session.drain_received(m.addr).await;
                        for (_, payload) in drained {
                            entry.session.callbacks.data_received(
                                m.addr,
                                entry.session.token().await.unwrap_or(SessionToken(0)),
                                payload,
                            );
                        }
                        store.remove(m.addr);
                    }
                }
            }
        });
    }

    /// `on_data_received` (§4.2): UCI requires extended-form (8-byte)
    /// addressing on this path; any other length is rejected.
    pub fn on_data_received(&self, session_id: SessionId, _status: u8, seq: u16, addr_bytes: Bytes, payload: Bytes) {
        let registry = self.registry.clone();
        let metrics = self.metrics.clone();
        let byte_order = self.byte_order;
        tokio::spawn(async move {
            let Some(addr) = UwbAddress::from_bytes(&addr_bytes, byte_order) else {
                warn!(session_id = ?session_id, len = addr_bytes.len(), "on_data_received: malformed address");
                return;
            };
            if addr.is_short() {
                warn!(session_id = ?session_id, %addr, "on_data_received: rejecting non-extended address");
                return;
            }

            let Some(entry) = registry.lookup_by_session_id(session_id).await else {
                debug!(?session_id, "on_data_received: unknown session");
                return;
            };
            if entry.session.is_closed().await {
                return;
            }

            metrics.count("data_received", Some(session_id));
            entry.session.add_received(addr, seq, payload.clone()).await;

            // Non-OwR-AoA sessions forward on receipt (§4.3); OwR-AoA
            // sessions buffer until `is_pointed` is confirmed.
            let is_owr_aoa_buffering = entry.session.params().await.get_str(crate::params::keys::RANGING_ROUND_USAGE)
                == Some(crate::params::keys::RANGING_ROUND_USAGE_OWR_AOA);
            if !is_owr_aoa_buffering {
                let drained = entry.session.drain_received(addr).await;
                let token = entry.session.token().await.unwrap_or(SessionToken(0));
                for (_, p) in drained {
                    entry.session.callbacks.data_received(addr, token, p);
                }
            }
        });
    }

    /// `on_data_send_status` (§4.2): success codes notify `data_sent` and
    /// remove the pending entry once `tx_count >= data_repetition_count +
    /// 1` *and* status is `DATA_TRANSFER_OK`; any other status notifies
    /// `data_send_failed` and removes the entry immediately.
    pub fn on_data_send_status(&self, session_id: SessionId, status: u8, seq: u16, tx_count: u32) {
        let registry = self.registry.clone();
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            let Some(entry) = registry.lookup_by_session_id(session_id).await else {
                debug!(?session_id, "on_data_send_status: unknown session");
                return;
            };
            if entry.session.is_closed().await {
                return;
            }

            let Some(info) = entry.session.get_send_info(seq).await else {
                debug!(?session_id, seq, "on_data_send_status: no pending send for seq");
                return;
            };

            let token = entry.session.token().await.unwrap_or(SessionToken(0));
            let send_status = DataSendStatus::from_native(status);
            metrics.count("data_send_status", Some(session_id));

            if send_status.is_success() {
                entry
                    .session
                    .update_send_info(seq, |i| {
                        i.tx_count = tx_count;
                        i.notified = true;
                    })
                    .await;
                if !info.notified {
                    entry.session.callbacks.data_sent(info.addr, token);
                }
                let required = info.params.data_repetition_count() + 1;
                if matches!(send_status, DataSendStatus::Ok) && tx_count >= required {
                    entry.session.remove_send_info(seq).await;
                }
            } else {
                entry.session.callbacks.data_send_failed(info.addr, status, token);
                entry.session.remove_send_info(seq).await;
            }
        });
    }

    /// `on_multicast_list_update` (§4.2): store the result and wake the
    /// Serializer step driving the reconfigure.
    pub fn on_multicast_list_update(&self, session_id: SessionId, status: MulticastUpdateStatus) {
        let registry = self.registry.clone();
        tokio::spawn(async move {
            let Some(entry) = registry.lookup_by_session_id(session_id).await else {
                debug!(?session_id, "on_multicast_list_update: unknown session");
                return;
            };
            entry.session.set_mcast_update_status(status).await;
        });
    }
}

#[cfg(test)]
#[path = "router_tests.rs"]
mod tests;
