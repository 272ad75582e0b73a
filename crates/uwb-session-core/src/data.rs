// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-session application data bookkeeping (§3, §4.2): the pending-send
//! map and the per-peer received-packet buffer, plus the small status
//! enums shared with [`crate::external::NativeUwbs`].

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::address::UwbAddress;
use crate::params::Params;

/// A pending outbound application-data packet, keyed by its UCI TX
/// sequence number in [`crate::session::Session::send_data_pending`].
#[derive(Debug, Clone)]
pub struct SendInfo {
    pub addr: UwbAddress,
    pub params: Params,
    pub payload: Bytes,
    /// Number of `DATA_TRANSFER_REPETITION_OK` notifications observed so
    /// far for this entry, used to decide removal (§4.2).
    pub tx_count: u32,
    /// Set once `data_sent` has fired for this entry, so later success
    /// notifications for the same send (repetition acks) don't fire it
    /// again (§8: exactly one of `data_sent`/`data_send_failed` per call).
    pub notified: bool,
}

impl SendInfo {
    pub fn new(addr: UwbAddress, params: Params, payload: Bytes) -> Self {
        Self { addr, params, payload, tx_count: 0, notified: false }
    }
}

/// Status codes the native layer reports for a data-send attempt (§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSendStatus {
    Ok,
    RepetitionOk,
    Other(u8),
}

impl DataSendStatus {
    pub fn from_native(code: u8) -> Self {
        match code {
            0 => Self::Ok,
            1 => Self::RepetitionOk,
            other => Self::Other(other),
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, Self::Ok | Self::RepetitionOk)
    }
}

/// Bounded, ordered, de-duplicated received-packet buffer for one remote
/// address (§3, §4.2, §8).
///
/// Sequence numbers strictly increase on drain and duplicates are
/// dropped on insert. When full, inserting a new packet evicts whichever
/// sequence number — the new one or the smallest stored one — is
/// smaller.
#[derive(Debug, Clone, Default)]
pub struct ReceivedBuffer {
    packets: BTreeMap<u16, Bytes>,
    capacity: usize,
}

impl ReceivedBuffer {
    pub fn new(capacity: usize) -> Self {
        Self { packets: BTreeMap::new(), capacity: capacity.max(1) }
    }

    /// Insert a received packet, applying the capacity-and-ordering
    /// policy in §3: duplicates are ignored; past capacity, the smallest
    /// sequence number among new-plus-stored is dropped.
    pub fn insert(&mut self, seq: u16, payload: Bytes) {
        if self.packets.contains_key(&seq) {
            return;
        }

        if self.packets.len() < self.capacity {
            self.packets.insert(seq, payload);
            return;
        }

        let smallest_stored = self.packets.keys().next().copied();
        match smallest_stored {
            Some(smallest) if smallest < seq => {
                self.packets.remove(&smallest);
                self.packets.insert(seq, payload);
            }
            _ => {
                // The new sequence number is the smallest (or ties with
                // one already present, which `contains_key` already
                // ruled out) — drop it.
            }
        }
    }

    /// Drain every buffered packet in ascending sequence-number order,
    /// leaving the buffer empty.
    pub fn drain_ordered(&mut self) -> Vec<(u16, Bytes)> {
        std::mem::take(&mut self.packets).into_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }
}

/// Monotonic 16-bit TX sequence-number allocator (§3, §8: wraps at
/// 2^16).
#[derive(Debug, Clone, Copy, Default)]
pub struct TxSequenceAllocator(u16);

impl TxSequenceAllocator {
    pub fn next(&mut self) -> u16 {
        let seq = self.0;
        self.0 = self.0.wrapping_add(1);
        seq
    }
}

/// Multicast-list update action (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MulticastAction {
    Add,
    Delete,
}

/// Per-address result of a multicast-list-update command or notification
/// (§4.6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressStatus {
    pub addr: UwbAddress,
    pub status: u8,
}

/// Outcome of `controller_multicast_list_update` (§4.2, §4.6). `ok` is
/// true only when every address in the request succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MulticastUpdateStatus {
    pub action: MulticastAction,
    pub per_address: Vec<AddressStatus>,
}

impl MulticastUpdateStatus {
    pub fn all_ok(&self) -> bool {
        self.per_address.iter().all(|a| a.status == 0)
    }

    pub fn failures(&self) -> impl Iterator<Item = &AddressStatus> {
        self.per_address.iter().filter(|a| a.status != 0)
    }
}

/// Outcome of a DT-Tag ranging-rounds update (§4.6, §6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DtTagUpdateStatus {
    pub status: u8,
    pub accepted_indices: Vec<u8>,
}

/// Outcome of a data-transfer phase config command (§4.6, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataTransferPhaseStatus(pub u8);

impl DataTransferPhaseStatus {
    pub fn is_ok(self) -> bool {
        self.0 == 0
    }
}

#[cfg(test)]
#[path = "data_tests.rs"]
mod tests;
