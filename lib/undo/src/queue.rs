#![allow(dead_code)]

use common::{FullTransactionId, Timestamp};
use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::mem;

/// The three orderings a queued request can be drained by. The scheduler
/// rotates through them so that no single ordering can starve the others.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UndoRequestSource {
    /// Oldest transaction first, so the undo log can be truncated and xid
    /// horizons can advance.
    Fxid,
    /// Largest undo first, because it will take the longest to apply.
    Size,
    /// Soonest retry deadline first, so failed undo is neither forgotten
    /// nor allowed to monopolize the workers.
    RetryTime,
}

impl UndoRequestSource {
    pub(crate) fn next(self) -> Self {
        match self {
            UndoRequestSource::Fxid => UndoRequestSource::Size,
            UndoRequestSource::Size => UndoRequestSource::RetryTime,
            UndoRequestSource::RetryTime => UndoRequestSource::Fxid,
        }
    }
}

#[derive(Debug)]
struct IndexNode {
    slot: usize,
    next_free: Option<usize>,
}

/// Fixed pool of index nodes, sized at construction for the worst case: a
/// queued request sits either in the by-fxid and by-size queues or in the
/// by-retry-time queue, so two nodes per request slot always suffice.
/// Running dry therefore means a bookkeeping bug, not memory pressure, and
/// is treated as fatal.
#[derive(Debug)]
pub(crate) struct NodeArena {
    nodes: Vec<IndexNode>,
    first_free: Option<usize>,
    live: usize,
}

impl NodeArena {
    fn new(count: usize) -> Self {
        let nodes = (0..count)
            .map(|i| IndexNode {
                slot: usize::MAX,
                next_free: if i + 1 < count { Some(i + 1) } else { None },
            })
            .collect();
        NodeArena {
            nodes,
            first_free: if count > 0 { Some(0) } else { None },
            live: 0,
        }
    }

    fn allocate(&mut self, slot: usize) -> usize {
        let Some(node) = self.first_free else {
            panic!("no free undo index node");
        };
        self.first_free = self.nodes[node].next_free;
        self.nodes[node].next_free = None;
        self.nodes[node].slot = slot;
        self.live += 1;
        node
    }

    fn release(&mut self, node: usize) -> usize {
        let slot = self.nodes[node].slot;
        self.nodes[node].slot = usize::MAX;
        self.nodes[node].next_free = self.first_free;
        self.first_free = Some(node);
        self.live -= 1;
        slot
    }

    fn slot_of(&self, node: usize) -> usize {
        self.nodes[node].slot
    }

    pub(crate) fn live(&self) -> usize {
        self.live
    }
}

/// Footprint of one index node, for capacity planning.
pub(crate) const fn node_footprint() -> usize {
    mem::size_of::<IndexNode>()
}

/// The three priority queues over request slots.
///
/// Values are node ids drawn from the arena; keys embed the fxid so that no
/// two entries ever compare equal. An insert that lands on an existing key
/// would mean two live requests share an fxid, which the arena's contract
/// rules out, so it panics rather than merging.
#[derive(Debug)]
pub(crate) struct RequestQueues {
    by_fxid: BTreeMap<FullTransactionId, usize>,
    by_size: BTreeMap<(Reverse<u64>, FullTransactionId), usize>,
    by_retry_time: BTreeMap<(Timestamp, FullTransactionId), usize>,
    nodes: NodeArena,
}

impl RequestQueues {
    pub(crate) fn new(capacity: usize) -> Self {
        RequestQueues {
            by_fxid: BTreeMap::new(),
            by_size: BTreeMap::new(),
            by_retry_time: BTreeMap::new(),
            nodes: NodeArena::new(2 * capacity),
        }
    }

    /// Queue a never-failed request under both the fxid and size orderings.
    pub(crate) fn insert_ready(&mut self, slot: usize, fxid: FullTransactionId, size: u64) {
        let node = self.nodes.allocate(slot);
        if self.by_fxid.insert(fxid, node).is_some() {
            panic!("undo request for {fxid} is already queued");
        }
        let node = self.nodes.allocate(slot);
        if self.by_size.insert((Reverse(size), fxid), node).is_some() {
            panic!("undo request for {fxid} is already queued by size");
        }
    }

    pub(crate) fn remove_ready(&mut self, fxid: FullTransactionId, size: u64) {
        let Some(node) = self.by_fxid.remove(&fxid) else {
            panic!("undo request for {fxid} missing from the fxid queue");
        };
        self.nodes.release(node);
        let Some(node) = self.by_size.remove(&(Reverse(size), fxid)) else {
            panic!("undo request for {fxid} missing from the size queue");
        };
        self.nodes.release(node);
    }

    /// Queue a failed request under the retry-time ordering.
    pub(crate) fn insert_retry(
        &mut self,
        slot: usize,
        fxid: FullTransactionId,
        retry_time: Timestamp,
    ) {
        let node = self.nodes.allocate(slot);
        if self.by_retry_time.insert((retry_time, fxid), node).is_some() {
            panic!("undo request for {fxid} is already queued for retry");
        }
    }

    pub(crate) fn remove_retry(&mut self, fxid: FullTransactionId, retry_time: Timestamp) {
        let Some(node) = self.by_retry_time.remove(&(retry_time, fxid)) else {
            panic!("undo request for {fxid} missing from the retry queue");
        };
        self.nodes.release(node);
    }

    /// Highest-priority slot under the given ordering, if any.
    pub(crate) fn leftmost(&self, source: UndoRequestSource) -> Option<usize> {
        let node = match source {
            UndoRequestSource::Fxid => self.by_fxid.values().next(),
            UndoRequestSource::Size => self.by_size.values().next(),
            UndoRequestSource::RetryTime => self.by_retry_time.values().next(),
        };
        node.map(|&n| self.nodes.slot_of(n))
    }

    /// Walk one queue in priority order.
    pub(crate) fn iter_source(
        &self,
        source: UndoRequestSource,
    ) -> Box<dyn Iterator<Item = usize> + '_> {
        match source {
            UndoRequestSource::Fxid => {
                Box::new(self.by_fxid.values().map(|&n| self.nodes.slot_of(n)))
            }
            UndoRequestSource::Size => {
                Box::new(self.by_size.values().map(|&n| self.nodes.slot_of(n)))
            }
            UndoRequestSource::RetryTime => {
                Box::new(self.by_retry_time.values().map(|&n| self.nodes.slot_of(n)))
            }
        }
    }

    /// Look a never-failed request up by fxid. Failed and in-flight requests
    /// are invisible here, which is fine for the one caller (resurrecting
    /// prepared transactions right after a restart).
    pub(crate) fn find_by_fxid(&self, fxid: FullTransactionId) -> Option<usize> {
        self.by_fxid.get(&fxid).map(|&n| self.nodes.slot_of(n))
    }

    pub(crate) fn ready_len(&self) -> usize {
        self.by_fxid.len()
    }

    pub(crate) fn retry_len(&self) -> usize {
        self.by_retry_time.len()
    }

    pub(crate) fn live_nodes(&self) -> usize {
        self.nodes.live()
    }
}
