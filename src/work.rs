use std::{collections::VecDeque, net::SocketAddr};

use crate::bitfield::Bitfield;

/// One piece's worth of download work. Equality is defined by index; the
/// size is derived from the descriptor and never changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceWork {
    pub index: u32,
    pub size: u32,
}

/// Builds the work descriptor for every piece. All pieces are
/// `piece_length` long except the last, which covers the remainder.
pub fn piece_works(total_length: u64, piece_length: u32) -> Vec<PieceWork> {
    let count = total_length.div_ceil(piece_length as u64) as u32;
    (0..count)
        .map(|index| {
            let size = if index == count - 1 {
                (total_length - piece_length as u64 * (count as u64 - 1)) as u32
            } else {
                piece_length
            };
            PieceWork { index, size }
        })
        .collect()
}

/// The three scheduling collections the coordinator works with.
///
/// Every piece is either *unclaimed*, held by at least one *pending*
/// assignment, or already validated (tracked by the coordinator, not here).
/// A peer address appears in at most one place: the idle queue or a single
/// pending entry. The pending list carries a start cursor separating
/// assignments that have been issued to their session from ones that have
/// not yet been.
#[derive(Debug)]
pub struct WorkQueues {
    unclaimed: VecDeque<PieceWork>,
    pending: Vec<(SocketAddr, PieceWork)>,
    started: usize,
    idle: VecDeque<SocketAddr>,
}

impl WorkQueues {
    pub fn new(works: Vec<PieceWork>) -> Self {
        Self {
            unclaimed: works.into(),
            pending: Vec::new(),
            started: 0,
            idle: VecDeque::new(),
        }
    }

    /// Returns a piece back to the unclaimed pool. Duplicate indices are
    /// dropped; requeueing an already-queued piece is a no-op.
    pub fn push_unclaimed(&mut self, work: PieceWork) {
        if self.unclaimed.iter().any(|w| w.index == work.index) {
            return;
        }
        self.unclaimed.push_back(work);
    }

    /// Removes and returns the first unclaimed piece the given peer can
    /// serve, if any.
    pub fn claim_for(&mut self, bitfield: &Bitfield) -> Option<PieceWork> {
        let pos = self
            .unclaimed
            .iter()
            .position(|w| bitfield.get(w.index as usize))?;
        self.unclaimed.remove(pos)
    }

    /// Picks a piece for redundant assignment: the first pending entry
    /// whose piece is not yet validated and which the given peer can serve.
    pub fn duplicate_for(&self, bitfield: &Bitfield, collected: &Bitfield) -> Option<PieceWork> {
        self.pending
            .iter()
            .map(|(_, w)| *w)
            .find(|w| !collected.get(w.index as usize) && bitfield.get(w.index as usize))
    }

    pub fn push_pending(&mut self, addr: SocketAddr, work: PieceWork) {
        debug_assert!(!self.pending.iter().any(|(a, _)| *a == addr));
        self.pending.push((addr, work));
    }

    /// Removes the peer's pending entry, if it has one, and returns the
    /// piece it was working on.
    pub fn remove_pending(&mut self, addr: &SocketAddr) -> Option<PieceWork> {
        let pos = self.pending.iter().position(|(a, _)| a == addr)?;
        let (_, work) = self.pending.remove(pos);
        if pos < self.started {
            self.started -= 1;
        }
        Some(work)
    }

    /// How many pending assignments currently cover the given piece index.
    pub fn workers_on(&self, index: u32) -> usize {
        self.pending.iter().filter(|(_, w)| w.index == index).count()
    }

    /// Hands out every pending entry that has not been issued to its
    /// session yet and advances the start cursor past them.
    pub fn start_all(&mut self) -> Vec<(SocketAddr, PieceWork)> {
        let fresh = self.pending[self.started..].to_vec();
        self.started = self.pending.len();
        fresh
    }

    pub fn push_idle(&mut self, addr: SocketAddr) {
        debug_assert!(!self.idle.contains(&addr));
        self.idle.push_back(addr);
    }

    pub fn pop_idle(&mut self) -> Option<SocketAddr> {
        self.idle.pop_front()
    }

    pub fn remove_idle(&mut self, addr: &SocketAddr) {
        self.idle.retain(|a| a != addr);
    }

    pub fn unclaimed_len(&self) -> usize {
        self.unclaimed.len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn idle_len(&self) -> usize {
        self.idle.len()
    }

    pub fn has_idle(&self, addr: &SocketAddr) -> bool {
        self.idle.contains(addr)
    }

    pub fn has_pending(&self, addr: &SocketAddr) -> bool {
        self.pending.iter().any(|(a, _)| a == addr)
    }

    /// Distinct piece indices currently covered by pending entries.
    pub fn pending_indices(&self) -> Vec<u32> {
        let mut indices: Vec<u32> = self.pending.iter().map(|(_, w)| w.index).collect();
        indices.sort_unstable();
        indices.dedup();
        indices
    }
}
