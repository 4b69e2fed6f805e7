//! In-flight client-to-server write transfers.
//!
//! A write is a pull protocol: the server asks the client for windows of
//! data with `w` frames and applies the `d` frames that come back. Each
//! transfer holds one slot here, keyed by the transaction's reply id, until
//! the final byte lands or the idle reap gives up on it.

use crate::wire::Rid;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Fixed number of transfer slots.
pub const MAX_PENDING_WRITES: usize = 32;

/// Bytes requested per `w` window.
pub const WRITE_CHUNK: u32 = 8192;

/// Slots idle this long are reaped and the client told `EIO`.
pub const WRITE_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub struct PendingWrite {
    pub handle_id: u32,
    /// File offset the transfer started at; window positions are relative
    /// to this.
    pub start_pos: u32,
    pub current_pos: u32,
    pub end_pos: u32,
    pub rid: Rid,
    pub peer: SocketAddr,
    pub last_activity: Instant,
}

impl PendingWrite {
    /// Bytes still owed by the client.
    pub fn remaining(&self) -> u32 {
        self.end_pos.saturating_sub(self.current_pos)
    }
}

/// The fixed-capacity table of in-flight writes.
#[derive(Debug, Default)]
pub struct WriteTable {
    slots: Vec<PendingWrite>,
}

impl WriteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims a slot for a new transfer. A transfer already using the same
    /// reply id is evicted first; returns `None` when every slot is taken.
    pub fn begin(
        &mut self,
        handle_id: u32,
        start_pos: u32,
        amount: u32,
        rid: Rid,
        peer: SocketAddr,
    ) -> Option<&PendingWrite> {
        self.slots.retain(|w| w.rid != rid);
        if self.slots.len() >= MAX_PENDING_WRITES {
            return None;
        }
        self.slots.push(PendingWrite {
            handle_id,
            start_pos,
            current_pos: start_pos,
            end_pos: start_pos.saturating_add(amount),
            rid,
            peer,
            last_activity: Instant::now(),
        });
        self.slots.last()
    }

    pub fn find(&mut self, rid: Rid) -> Option<&mut PendingWrite> {
        self.slots.iter_mut().find(|w| w.rid == rid)
    }

    pub fn release(&mut self, rid: Rid) {
        self.slots.retain(|w| w.rid != rid);
    }

    /// Removes and returns every slot idle for at least
    /// [`WRITE_IDLE_TIMEOUT`], so the caller can notify the clients.
    pub fn reap_idle(&mut self, now: Instant) -> Vec<PendingWrite> {
        let (stale, live): (Vec<_>, Vec<_>) = std::mem::take(&mut self.slots)
            .into_iter()
            .partition(|w| now.saturating_duration_since(w.last_activity) >= WRITE_IDLE_TIMEOUT);
        self.slots = live;
        stale
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
