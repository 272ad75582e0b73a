// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session Registry & Admission (§4.5): maps SessionHandle/SessionId to
//! live sessions, enforces the per-protocol/per-chip capacity ceiling,
//! and preempts a lower-priority FiRa session when the new one
//! outranks it. Reads and writes go through a single coarse lock, the
//! "monitor" the spec assigns this component (§5).

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use tokio::sync::{mpsc, RwLock};
use tracing::info;

use crate::config::{SessionManagerConfig, StackPriority};
use crate::events::SessionEvent;
use crate::external::ClientCallbacks;
use crate::params::{Params, Protocol};
use crate::session::{Session, SessionHandle, SessionId};

/// A live session plus the channel its [`crate::serializer::EventSerializer`]
/// reads from. Cloning is cheap: both fields are reference-counted.
#[derive(Clone)]
pub struct SessionEntry {
    pub session: Arc<Session>,
    pub events: mpsc::UnboundedSender<SessionEvent>,
}

/// Everything needed to admit a new session (§4.5).
pub struct AdmissionRequest {
    pub handle: SessionHandle,
    pub session_id: SessionId,
    pub session_type: u8,
    pub chip_id: String,
    pub params: Params,
    pub stack_priority: StackPriority,
    /// Non-privileged client uid, if any; used by the Fg/Bg observer's
    /// secondary index (§4.5).
    pub uid: Option<u32>,
    pub callbacks: Arc<dyn ClientCallbacks>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionError {
    /// A live session already holds this handle or this session id (§3
    /// invariant 1).
    Duplicate,
    MaxSessionsReached,
}

/// The result of a successful admission: the new entry and the receiving
/// half of its event channel (for the caller to hand to a freshly
/// spawned [`crate::serializer::EventSerializer`]), plus the
/// lower-priority session evicted to make room for it, if any (§4.5).
pub struct Admitted {
    pub entry: SessionEntry,
    pub event_rx: mpsc::UnboundedReceiver<SessionEvent>,
    pub evicted: Option<SessionEntry>,
}

impl std::fmt::Debug for Admitted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Admitted").finish_non_exhaustive()
    }
}

struct Live {
    by_handle: HashMap<SessionHandle, SessionEntry>,
    by_session_id: HashMap<SessionId, SessionHandle>,
    by_uid: HashMap<u32, Vec<SessionHandle>>,
    recently_closed: IndexMap<SessionHandle, SessionId>,
}

impl Live {
    fn new() -> Self {
        Self {
            by_handle: HashMap::new(),
            by_session_id: HashMap::new(),
            by_uid: HashMap::new(),
            recently_closed: IndexMap::new(),
        }
    }

    fn count_for(&self, protocol: Protocol, chip_id: &str) -> usize {
        self.by_handle
            .values()
            .filter(|e| e.session.protocol == protocol && e.session.chip_id == chip_id)
            .count()
    }

    /// The live FiRa session on `chip_id` with the lowest `stack_priority`,
    /// used as the eviction candidate (§4.5).
    async fn lowest_priority_fira(&self, chip_id: &str) -> Option<SessionEntry> {
        let mut candidates = Vec::new();
        for entry in self.by_handle.values() {
            if entry.session.protocol == Protocol::Fira && entry.session.chip_id == chip_id {
                candidates.push(entry.clone());
            }
        }
        let mut lowest: Option<(StackPriority, SessionEntry)> = None;
        for entry in candidates {
            let priority = entry.session.stack_priority().await;
            match &lowest {
                Some((current, _)) if *current <= priority => {}
                _ => lowest = Some((priority, entry)),
            }
        }
        lowest.map(|(_, entry)| entry)
    }
}

/// Registry for all live sessions on this Session Manager (§4.5).
pub struct SessionRegistry {
    config: SessionManagerConfig,
    live: RwLock<Live>,
}

impl SessionRegistry {
    pub fn new(config: SessionManagerConfig) -> Self {
        Self { config, live: RwLock::new(Live::new()) }
    }

    pub fn config(&self) -> &SessionManagerConfig {
        &self.config
    }

    /// Admit a new session, evicting a lower-priority FiRa session on the
    /// same chip if capacity is exhausted (§4.5).
    pub async fn admit(&self, req: AdmissionRequest) -> Result<Admitted, AdmissionError> {
        let mut live = self.live.write().await;

        if live.by_handle.contains_key(&req.handle) || live.by_session_id.contains_key(&req.session_id) {
            return Err(AdmissionError::Duplicate);
        }

        let protocol = req.params.protocol;
        let limit = self.config.limits_for_chip(&req.chip_id).limit_for(protocol);
        let live_count = live.count_for(protocol, &req.chip_id);

        let evicted = if live_count < limit {
            None
        } else if protocol == Protocol::Fira {
            let candidate = live.lowest_priority_fira(&req.chip_id).await;
            match candidate {
                Some(entry) if entry.session.stack_priority().await < req.stack_priority => Some(entry),
                _ => return Err(AdmissionError::MaxSessionsReached),
            }
        } else {
            return Err(AdmissionError::MaxSessionsReached);
        };

        if let Some(evicted) = &evicted {
            self.remove_locked(&mut live, evicted.session.handle);
        }

        let (tx, event_rx) = mpsc::unbounded_channel();
        let session = Arc::new(Session::new(
            req.handle,
            req.session_id,
            req.session_type,
            req.chip_id,
            req.params,
            req.stack_priority,
            self.config.max_received_packets,
            req.callbacks,
        ));
        let entry = SessionEntry { session, events: tx };

        live.by_handle.insert(req.handle, entry.clone());
        live.by_session_id.insert(req.session_id, req.handle);
        if let Some(uid) = req.uid {
            live.by_uid.entry(uid).or_default().push(req.handle);
        }

        info!(handle = req.handle.0, session_id = req.session_id.0, "session admitted");
        Ok(Admitted { entry, event_rx, evicted })
    }

    fn remove_locked(&self, live: &mut Live, handle: SessionHandle) -> Option<SessionEntry> {
        let entry = live.by_handle.remove(&handle)?;
        live.by_session_id.remove(&entry.session.session_id);
        for handles in live.by_uid.values_mut() {
            handles.retain(|h| *h != handle);
        }
        live.recently_closed.insert(handle, entry.session.session_id);
        while live.recently_closed.len() > self.config.recently_closed_capacity {
            live.recently_closed.shift_remove_index(0);
        }
        Some(entry)
    }

    pub async fn lookup_by_handle(&self, handle: SessionHandle) -> Option<SessionEntry> {
        self.live.read().await.by_handle.get(&handle).cloned()
    }

    pub async fn lookup_by_session_id(&self, id: SessionId) -> Option<SessionEntry> {
        let live = self.live.read().await;
        let handle = live.by_session_id.get(&id)?;
        live.by_handle.get(handle).cloned()
    }

    pub async fn sessions_for_uid(&self, uid: u32) -> Vec<SessionEntry> {
        let live = self.live.read().await;
        live.by_uid
            .get(&uid)
            .into_iter()
            .flatten()
            .filter_map(|h| live.by_handle.get(h).cloned())
            .collect()
    }

    /// Remove a session from the live indices, e.g. once its Deinit event
    /// has been fully processed. Moves it into the recently-closed LRU.
    pub async fn remove(&self, handle: SessionHandle) -> Option<SessionEntry> {
        let mut live = self.live.write().await;
        self.remove_locked(&mut live, handle)
    }

    pub async fn count(&self, protocol: Protocol, chip_id: &str) -> usize {
        self.live.read().await.count_for(protocol, chip_id)
    }

    pub async fn recently_closed_handles(&self) -> Vec<SessionHandle> {
        self.live.read().await.recently_closed.keys().copied().collect()
    }

    pub async fn live_count(&self) -> usize {
        self.live.read().await.by_handle.len()
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
