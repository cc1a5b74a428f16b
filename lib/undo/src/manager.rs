use crate::queue::{node_footprint, RequestQueues, UndoRequestSource};
use crate::request::{ListedIn, SlotState, UndoRequestData, UndoRequestRef, UndoRequestSlot};
use common::util::time::{Clock, SystemClock};
use common::{DatabaseId, FullTransactionId, Timestamp, UndoManagerConfig, UndoRecPtr};
use parking_lot::Mutex;
use std::mem;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// A first failed undo attempt is retried after ten seconds; every attempt
/// after that waits thirty. Anything smarter would need per-request failure
/// bookkeeping, and it is unclear what that would buy.
const FIRST_RETRY_DELAY_MS: i64 = 10 * 1000;
const LATER_RETRY_DELAY_MS: i64 = 30 * 1000;

#[derive(Debug, Error)]
pub enum RestoreError {
    #[error(
        "undo request data is corrupt: {nbytes} bytes is not a multiple of \
         the {record_len}-byte record size"
    )]
    CorruptLength { nbytes: usize, record_len: usize },

    #[error(
        "too many undo requests: {count} were saved, but there is only room \
         for {capacity}; consider raising the session limit"
    )]
    TooManyRequests { count: usize, capacity: usize },
}

/// Verdict from [`UndoRequestManager::perform_undo_in_background`].
#[derive(Debug)]
pub enum AdmissionOutcome {
    /// The request was queued for background workers (or had nothing to
    /// process); the caller is done with it.
    Background,
    /// Admission was refused. The caller must apply the undo itself and
    /// then either unregister the request (success) or reschedule it
    /// (failure).
    Foreground(UndoRequestRef),
}

impl AdmissionOutcome {
    pub fn is_background(&self) -> bool {
        matches!(self, AdmissionOutcome::Background)
    }
}

/// Tracks every transaction that may need background undo, from a fixed
/// arena of request slots.
///
/// Because the arena is fixed, a request must be registered before its
/// transaction writes any permanent or unlogged undo; that way there can
/// never be more outstanding undo work than there are slots. In the worst
/// case [`register`](Self::register) refuses a new request and the
/// transaction has to apply its own undo, but actually filling the arena
/// requires foreground undo to be interrupted by a crash, over and over.
///
/// All shared state sits behind one exclusive lock. Contention is expected
/// to be low — aborts are rare and workers drain quickly — and a single
/// lock keeps the state transitions easy to reason about.
pub struct UndoRequestManager {
    inner: Mutex<ManagerInner>,
    clock: Arc<dyn Clock>,
}

struct ManagerInner {
    capacity: usize,
    /// Number of slots not currently on the free-list.
    utilization: usize,
    soft_size_limit: usize,
    /// Which queue the scheduler consults first on the next call.
    source: UndoRequestSource,
    queues: RequestQueues,
    /// Smallest registered fxid, maintained incrementally on registration
    /// and recomputed lazily after the minimum is released.
    oldest_fxid_valid: bool,
    oldest_fxid: FullTransactionId,
    slots: Vec<UndoRequestSlot>,
    first_free: Option<usize>,
}

impl UndoRequestManager {
    pub fn new(capacity: usize, soft_size_limit: usize) -> Self {
        Self::with_clock(capacity, soft_size_limit, Arc::new(SystemClock))
    }

    /// Like [`new`](Self::new), but with an injected time source so retry
    /// windows can be tested without sleeping.
    pub fn with_clock(capacity: usize, soft_size_limit: usize, clock: Arc<dyn Clock>) -> Self {
        assert!(capacity > 0, "undo request capacity must be nonzero");

        let slots = (0..capacity)
            .map(|i| {
                UndoRequestSlot::vacant(if i + 1 < capacity { Some(i + 1) } else { None })
            })
            .collect();

        UndoRequestManager {
            inner: Mutex::new(ManagerInner {
                capacity,
                utilization: 0,
                soft_size_limit,
                source: UndoRequestSource::Fxid,
                queues: RequestQueues::new(capacity),
                oldest_fxid_valid: true,
                oldest_fxid: FullTransactionId::INVALID,
                slots,
                first_free: Some(0),
            }),
            clock,
        }
    }

    pub fn from_config(config: &UndoManagerConfig) -> Self {
        Self::new(*config.capacity(), *config.soft_size_limit())
    }

    /// Approximate memory footprint of a manager with the given capacity:
    /// the request arena plus twice as many index nodes, since a request
    /// that has never failed occupies two queues at once.
    pub fn estimate_size(capacity: usize) -> usize {
        mem::size_of::<Self>()
            + capacity * mem::size_of::<UndoRequestSlot>()
            + 2 * capacity * node_footprint()
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    pub fn utilization(&self) -> usize {
        self.inner.lock().utilization
    }

    pub fn soft_size_limit(&self) -> usize {
        self.inner.lock().soft_size_limit
    }

    pub fn is_empty(&self) -> bool {
        self.utilization() == 0
    }

    /// Allocate a request slot for a transaction, before it writes any
    /// undo. Returns `None` when the arena is full, in which case the
    /// transaction must apply its own undo if it aborts.
    ///
    /// At end of transaction the caller hands the request back through
    /// [`unregister`](Self::unregister) (commit) or finalizes it and calls
    /// [`perform_undo_in_background`](Self::perform_undo_in_background)
    /// (abort).
    pub fn register(
        &self,
        fxid: FullTransactionId,
        dbid: DatabaseId,
    ) -> Option<UndoRequestRef> {
        debug_assert!(fxid.is_valid());

        let mut inner = self.inner.lock();
        let Some(slot) = inner.first_free else {
            warn!(fxid = %fxid, "undo request arena is full; undo must run in the caller");
            return None;
        };
        inner.first_free = inner.slots[slot].next_free;
        inner.slots[slot].next_free = None;
        inner.utilization += 1;

        inner.slots[slot].data = UndoRequestData::empty(fxid, dbid);
        inner.slots[slot].retry_time = Timestamp::NEVER_BEGIN;
        inner.slots[slot].state = SlotState::Unlisted;
        inner.note_registered_fxid(fxid);

        trace!(fxid = %fxid, dbid = %dbid, "registered undo request");
        Some(UndoRequestRef { slot })
    }

    /// Record the final undo size and log locations for a request.
    ///
    /// The size is unknown at registration time; it becomes known at
    /// prepare time for a prepared transaction and at abort time otherwise.
    /// Only logged and unlogged undo that background workers will process
    /// counts toward `size`. Each end location must be valid exactly when
    /// the matching start location is, and at least one pair must be valid.
    ///
    /// The request stays owned by the caller; nothing else reads the slot
    /// while it is unlisted, so this cannot fail.
    pub fn finalize(
        &self,
        req: &UndoRequestRef,
        size: u64,
        start_location_logged: UndoRecPtr,
        start_location_unlogged: UndoRecPtr,
        end_location_logged: UndoRecPtr,
        end_location_unlogged: UndoRecPtr,
    ) {
        debug_assert_ne!(size, 0);
        debug_assert!(end_location_logged.is_valid() || end_location_unlogged.is_valid());
        debug_assert_eq!(
            end_location_logged.is_valid(),
            start_location_logged.is_valid()
        );
        debug_assert_eq!(
            end_location_unlogged.is_valid(),
            start_location_unlogged.is_valid()
        );

        let mut inner = self.inner.lock();
        let slot = &mut inner.slots[req.slot];
        debug_assert_eq!(slot.state, SlotState::Unlisted);
        slot.data.set_size(size);
        slot.data.set_start_location_logged(start_location_logged);
        slot.data.set_start_location_unlogged(start_location_unlogged);
        slot.data.set_end_location_logged(end_location_logged);
        slot.data.set_end_location_unlogged(end_location_unlogged);
    }

    /// Try to hand a finalized request off to the background workers.
    ///
    /// Returns [`AdmissionOutcome::Background`] when the workers will take
    /// care of it (or when the transaction never wrote undo and there is
    /// nothing to do). Otherwise the handle comes back in
    /// [`AdmissionOutcome::Foreground`] and the caller must process the
    /// undo itself.
    ///
    /// `force` asserts that foreground undo is impossible — for instance in
    /// post-commit error handling — and admits the request regardless of
    /// the soft limit. Use it sparingly; it eats into the headroom kept for
    /// requests that are already queued.
    ///
    /// This runs during transaction abort and therefore cannot fail; the
    /// index-node pool is provisioned for the worst case, so exhausting it
    /// panics as a bug rather than surfacing an error.
    pub fn perform_undo_in_background(
        &self,
        req: UndoRequestRef,
        force: bool,
    ) -> AdmissionOutcome {
        let mut inner = self.inner.lock();
        debug_assert_eq!(inner.slots[req.slot].state, SlotState::Unlisted);

        // A transaction that failed before writing any undo left nothing to
        // process; release the slot instead of queueing a no-op.
        if !inner.slots[req.slot].data.has_undo() {
            trace!(
                fxid = %inner.slots[req.slot].data.fxid(),
                "transaction wrote no undo; dropping its request"
            );
            inner.release_slot(req.slot);
            return AdmissionOutcome::Background;
        }

        // TODO: also weigh the request's own size here, so that one huge
        // transaction cannot claim a worker while utilization still looks
        // low.
        let background = force || inner.utilization <= inner.soft_size_limit;
        if background {
            inner.list_ready(req.slot);
            debug!(
                fxid = %inner.slots[req.slot].data.fxid(),
                force,
                "undo request queued for background processing"
            );
            AdmissionOutcome::Background
        } else {
            debug!(
                fxid = %inner.slots[req.slot].data.fxid(),
                utilization = inner.utilization,
                soft_size_limit = inner.soft_size_limit,
                "queue is hot; undo stays in the foreground"
            );
            AdmissionOutcome::Foreground(req)
        }
    }

    /// Claim the next undo request a worker should process, if any.
    ///
    /// The scheduler rotates between the three queue orderings, advancing
    /// its cursor on every attempt whether or not that queue yields a
    /// candidate. Rotating evenly is a weaker promise than any blended
    /// priority score, but it is one that provably starves nobody: as long
    /// as requests keep being claimed, every ordering gets its turn.
    ///
    /// When `dbid` is valid, only requests from that database qualify. A
    /// candidate from the wrong database is skipped, and if nothing turns
    /// up and `exhaustive_db_search` is set, the queues are walked
    /// left-to-right in interleaved order to latch onto the
    /// highest-priority request from the wanted database anywhere. Workers
    /// that have met their minimum runtime pass `false` and simply exit
    /// when the rotation comes up empty.
    ///
    /// The returned request is unlisted — no other worker can claim it —
    /// and must eventually be handed back via
    /// [`unregister`](Self::unregister) or
    /// [`reschedule`](Self::reschedule).
    pub fn get_next_undo_request(
        &self,
        dbid: DatabaseId,
        exhaustive_db_search: bool,
    ) -> Option<(UndoRequestRef, UndoRequestData)> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let mut chosen: Option<usize> = None;
        let mut saw_db_mismatch = false;

        for _ in 0..3 {
            let source = inner.source;
            inner.source = source.next();

            let Some(candidate) = inner.queues.leftmost(source) else {
                continue;
            };

            // Failed requests only become eligible once their retry time
            // has passed.
            if source == UndoRequestSource::RetryTime
                && inner.slots[candidate].retry_time > now
            {
                continue;
            }

            // The database check runs last, so the mismatch flag is only
            // set for candidates that were otherwise eligible.
            if dbid.is_valid() && *inner.slots[candidate].data.dbid() != dbid {
                saw_db_mismatch = true;
                continue;
            }

            chosen = Some(candidate);
            break;
        }

        // Looking harder only helps if a matching request might exist: a
        // rotation that came up empty without a database mismatch means
        // there is nothing to do for anyone.
        if chosen.is_none() && saw_db_mismatch && exhaustive_db_search {
            chosen = inner.find_for_database(dbid);
        }

        let slot = chosen?;
        inner.remove_from_queues(slot);
        inner.slots[slot].state = SlotState::Unlisted;
        let data = inner.slots[slot].data;
        trace!(fxid = %data.fxid(), "handing undo request to a worker");
        Some((UndoRequestRef { slot }, data))
    }

    /// Put a request whose undo just failed back in line.
    ///
    /// Used after both foreground failures (admission was refused and the
    /// caller could not finish the job) and background ones (a worker
    /// claimed the request and failed). Either way the request is unlisted
    /// on entry, so there is nothing to remove first. Runs during abort
    /// handling and cannot fail.
    pub fn reschedule(&self, req: UndoRequestRef) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        debug_assert_eq!(inner.slots[req.slot].state, SlotState::Unlisted);

        let retry_time = if inner.slots[req.slot].retry_time.is_never_begin() {
            now.plus_millis(FIRST_RETRY_DELAY_MS)
        } else {
            now.plus_millis(LATER_RETRY_DELAY_MS)
        };
        inner.slots[req.slot].retry_time = retry_time;

        let fxid = *inner.slots[req.slot].data.fxid();
        inner.queues.insert_retry(req.slot, fxid, retry_time);
        inner.slots[req.slot].state = SlotState::Listed(ListedIn::RetryTime);
        debug!(fxid = %fxid, ?retry_time, "undo failed; request rescheduled");
    }

    /// Return a request slot to the free-list, at transaction commit or
    /// once an aborted transaction's undo has been fully applied.
    ///
    /// May run as a post-commit step and therefore cannot fail.
    pub fn unregister(&self, req: UndoRequestRef) {
        let mut inner = self.inner.lock();
        inner.remove_from_queues(req.slot);
        inner.release_slot(req.slot);
    }

    /// Pull the request for a prepared transaction back out of the queues
    /// after a restart, so that no worker applies undo for a transaction
    /// that may yet commit.
    ///
    /// Must be called after every [`restore`](Self::restore) and before the
    /// first [`get_next_undo_request`](Self::get_next_undo_request). The
    /// caller keeps the returned handle until the transaction resolves,
    /// then unregisters it (commit) or finalizes and queues it (abort).
    /// A missing request means the recovery driver lost track of a
    /// prepared transaction, which is unrecoverable.
    pub fn suspend_prepared_undo_request(&self, fxid: FullTransactionId) -> UndoRequestRef {
        let mut inner = self.inner.lock();
        let Some(slot) = inner.queues.find_by_fxid(fxid) else {
            panic!("no queued undo request for prepared transaction {fxid}");
        };
        debug_assert_eq!(
            inner.slots[slot].state,
            SlotState::Listed(ListedIn::FxidAndSize)
        );
        debug_assert_ne!(*inner.slots[slot].data.size(), 0);

        inner.remove_from_queues(slot);
        inner.slots[slot].state = SlotState::Unlisted;
        debug!(fxid = %fxid, "suspended undo request for prepared transaction");
        UndoRequestRef { slot }
    }

    /// Oldest registered fxid, queued or not, or the invalid sentinel when
    /// no requests exist. Cached so repeated calls stay cheap.
    pub fn oldest_fxid(&self) -> FullTransactionId {
        let mut inner = self.inner.lock();
        if !inner.oldest_fxid_valid {
            let mut result = FullTransactionId::INVALID;
            for slot in &inner.slots {
                let fxid = *slot.data.fxid();
                if fxid.is_valid() && (!result.is_valid() || fxid < result) {
                    result = fxid;
                }
            }
            inner.oldest_fxid = result;
            inner.oldest_fxid_valid = true;
        }
        inner.oldest_fxid
    }

    /// Pack every queued request into a byte blob for the checkpoint.
    ///
    /// Only queued requests are saved: an unlisted request does not yet
    /// hold final data and its transaction will resolve it after recovery,
    /// while a free slot holds nothing at all. Retry deadlines are not
    /// saved either; see [`restore`](Self::restore).
    pub fn serialize(&self) -> Vec<u8> {
        let inner = self.inner.lock();
        let count = inner.queues.ready_len() + inner.queues.retry_len();
        let mut out = vec![0u8; count * UndoRequestData::ENCODED_LEN];

        let mut offset = 0;
        for slot in inner
            .queues
            .iter_source(UndoRequestSource::Fxid)
            .chain(inner.queues.iter_source(UndoRequestSource::RetryTime))
        {
            inner.slots[slot]
                .data
                .encode_into(&mut out[offset..offset + UndoRequestData::ENCODED_LEN]);
            offset += UndoRequestData::ENCODED_LEN;
        }
        debug_assert_eq!(offset, out.len());
        out
    }

    /// Reload a blob produced by [`serialize`](Self::serialize) into a
    /// freshly built manager.
    ///
    /// Every record reenters as a fresh, never-failed request even if it
    /// had been rescheduled before the crash. Carrying failure history
    /// across restarts would only matter for avoiding busy-loops and
    /// starvation, and both are already guaranteed by rescheduling anew on
    /// the next failure.
    ///
    /// A blob whose length is not a whole number of records, or that holds
    /// more records than this manager has capacity, is rejected with the
    /// manager left untouched — the latter typically means the session
    /// limit was lowered between runs.
    pub fn restore(&self, data: &[u8]) -> Result<(), RestoreError> {
        let record_len = UndoRequestData::ENCODED_LEN;
        if data.len() % record_len != 0 {
            return Err(RestoreError::CorruptLength {
                nbytes: data.len(),
                record_len,
            });
        }
        let count = data.len() / record_len;

        let mut inner = self.inner.lock();
        if count > inner.capacity {
            return Err(RestoreError::TooManyRequests {
                count,
                capacity: inner.capacity,
            });
        }

        for chunk in data.chunks_exact(record_len) {
            let record = UndoRequestData::decode(chunk);
            debug_assert!(record.fxid().is_valid());
            debug_assert!(record.dbid().is_valid());
            debug_assert_ne!(*record.size(), 0);

            let Some(slot) = inner.first_free else {
                panic!("no free undo request slot while restoring");
            };
            inner.first_free = inner.slots[slot].next_free;
            inner.slots[slot].next_free = None;
            inner.utilization += 1;

            inner.slots[slot].data = record;
            inner.slots[slot].retry_time = Timestamp::NEVER_BEGIN;
            inner.note_registered_fxid(*record.fxid());
            inner.list_ready(slot);
        }

        debug!(count, "restored undo requests from checkpoint");
        Ok(())
    }
}

impl ManagerInner {
    /// Fold a newly registered fxid into the oldest-fxid cache.
    fn note_registered_fxid(&mut self, fxid: FullTransactionId) {
        if self.oldest_fxid_valid && (!self.oldest_fxid.is_valid() || fxid < self.oldest_fxid)
        {
            self.oldest_fxid = fxid;
        }
    }

    /// Queue an unlisted request under the fxid and size orderings.
    fn list_ready(&mut self, slot: usize) {
        let fxid = *self.slots[slot].data.fxid();
        let size = *self.slots[slot].data.size();
        self.queues.insert_ready(slot, fxid, size);
        self.slots[slot].state = SlotState::Listed(ListedIn::FxidAndSize);
    }

    /// Drop a request from whichever queues hold it. An unlisted request is
    /// in none, so this is a no-op for it.
    fn remove_from_queues(&mut self, slot: usize) {
        let fxid = *self.slots[slot].data.fxid();
        let size = *self.slots[slot].data.size();
        let retry_time = self.slots[slot].retry_time;
        match self.slots[slot].state {
            SlotState::Listed(ListedIn::FxidAndSize) => self.queues.remove_ready(fxid, size),
            SlotState::Listed(ListedIn::RetryTime) => {
                self.queues.remove_retry(fxid, retry_time)
            }
            SlotState::Unlisted => {}
            SlotState::Free => panic!("free undo request slot cannot be queued"),
        }
    }

    /// Push a slot back onto the free-list.
    fn release_slot(&mut self, slot: usize) {
        let fxid = *self.slots[slot].data.fxid();
        if fxid == self.oldest_fxid {
            // Recompute lazily on the next oldest-fxid query.
            self.oldest_fxid_valid = false;
        }

        let head = self.first_free;
        let vacated = &mut self.slots[slot];
        vacated.data = UndoRequestData::empty(FullTransactionId::INVALID, DatabaseId::INVALID);
        vacated.retry_time = Timestamp::NEVER_BEGIN;
        vacated.state = SlotState::Free;
        vacated.next_free = head;
        self.first_free = Some(slot);
        self.utilization -= 1;

        trace!(fxid = %fxid, "released undo request slot");
    }

    /// Interleaved left-to-right walk of all three queues, returning the
    /// first request from the wanted database. Interleaving means we latch
    /// onto the highest-priority match under *some* ordering without fully
    /// draining any one queue first.
    fn find_for_database(&self, dbid: DatabaseId) -> Option<usize> {
        let mut iters: [Box<dyn Iterator<Item = usize> + '_>; 3] = [
            self.queues.iter_source(UndoRequestSource::Fxid),
            self.queues.iter_source(UndoRequestSource::Size),
            self.queues.iter_source(UndoRequestSource::RetryTime),
        ];
        let mut done = [false; 3];
        let mut i = 0;
        loop {
            if !done[i] {
                match iters[i].next() {
                    None => {
                        done[i] = true;
                        if done == [true; 3] {
                            return None;
                        }
                    }
                    Some(slot) if *self.slots[slot].data.dbid() == dbid => return Some(slot),
                    Some(_) => {}
                }
            }
            i = (i + 1) % 3;
        }
    }
}


#[cfg(test)]
mod lifecycle_tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn register_and_commit_leaves_nothing_behind() {
        let urm = UndoRequestManager::new(4, 3);

        let req = urm
            .register(FullTransactionId(100), DatabaseId(7))
            .unwrap();
        assert_eq!(urm.utilization(), 1);
        assert_eq!(urm.oldest_fxid(), FullTransactionId(100));

        urm.unregister(req);
        assert_eq!(urm.utilization(), 0);
        assert_eq!(urm.oldest_fxid(), FullTransactionId::INVALID);
        assert!(urm.is_empty());
    }

    #[test]
    fn register_returns_none_when_full() {
        let urm = UndoRequestManager::new(1, 1);

        let first = urm.register(FullTransactionId(1), DatabaseId(1)).unwrap();
        assert!(urm.register(FullTransactionId(2), DatabaseId(1)).is_none());

        // Releasing the only slot makes the arena usable again.
        urm.unregister(first);
        assert!(urm.register(FullTransactionId(3), DatabaseId(1)).is_some());
    }

    #[test]
    fn abort_with_background_admission() {
        let urm = UndoRequestManager::new(4, 3);

        let req = urm
            .register(FullTransactionId(200), DatabaseId(7))
            .unwrap();
        urm.finalize(
            &req,
            1024,
            UndoRecPtr(0x10),
            UndoRecPtr::INVALID,
            UndoRecPtr(0x410),
            UndoRecPtr::INVALID,
        );
        assert!(urm.perform_undo_in_background(req, false).is_background());
        assert_eq!(urm.utilization(), 1);

        let (req, data) = urm
            .get_next_undo_request(DatabaseId::INVALID, false)
            .unwrap();
        assert_eq!(*data.fxid(), FullTransactionId(200));
        assert_eq!(*data.dbid(), DatabaseId(7));
        assert_eq!(*data.size(), 1024);
        assert_eq!(*data.start_location_logged(), UndoRecPtr(0x10));
        assert_eq!(*data.end_location_logged(), UndoRecPtr(0x410));
        assert_eq!(*data.start_location_unlogged(), UndoRecPtr::INVALID);
        assert_eq!(*data.end_location_unlogged(), UndoRecPtr::INVALID);

        // Claimed but not yet finished: the slot is still occupied.
        assert_eq!(urm.utilization(), 1);

        urm.unregister(req);
        assert_eq!(urm.utilization(), 0);
    }

    #[test]
    fn request_without_undo_is_dropped_at_admission() {
        let urm = UndoRequestManager::new(4, 3);

        // The transaction aborted before writing a single undo record.
        let req = urm
            .register(FullTransactionId(600), DatabaseId(7))
            .unwrap();
        assert!(urm.perform_undo_in_background(req, false).is_background());
        assert_eq!(urm.utilization(), 0);
        assert!(urm
            .get_next_undo_request(DatabaseId::INVALID, false)
            .is_none());
    }

    #[test]
    fn soft_limit_pushes_undo_back_to_the_caller() {
        let urm = UndoRequestManager::new(4, 2);

        register_and_queue(&urm, 300, 7, 512);
        register_and_queue(&urm, 301, 7, 1024);

        let third = urm
            .register(FullTransactionId(302), DatabaseId(7))
            .unwrap();
        finalize_logged(&urm, &third, 64, 0x900, 0x940);
        let third = match urm.perform_undo_in_background(third, false) {
            AdmissionOutcome::Foreground(req) => req,
            AdmissionOutcome::Background => panic!("admission should have been refused"),
        };

        // The caller did the undo itself and is done.
        urm.unregister(third);
        assert_eq!(urm.utilization(), 2);

        // The queued requests are untouched: the fxid rotation yields 300,
        // then the size rotation yields 301.
        let (r1, d1) = urm
            .get_next_undo_request(DatabaseId::INVALID, false)
            .unwrap();
        assert_eq!(*d1.fxid(), FullTransactionId(300));
        let (r2, d2) = urm
            .get_next_undo_request(DatabaseId::INVALID, false)
            .unwrap();
        assert_eq!(*d2.fxid(), FullTransactionId(301));

        urm.unregister(r1);
        urm.unregister(r2);
        assert!(urm.is_empty());
    }

    #[test]
    fn force_bypasses_the_soft_limit() {
        let urm = UndoRequestManager::new(4, 0);

        let req = urm
            .register(FullTransactionId(800), DatabaseId(7))
            .unwrap();
        finalize_logged(&urm, &req, 128, 0x100, 0x180);

        let req = match urm.perform_undo_in_background(req, false) {
            AdmissionOutcome::Foreground(req) => req,
            AdmissionOutcome::Background => panic!("soft limit of zero admits nothing"),
        };
        assert!(urm.perform_undo_in_background(req, true).is_background());

        let (req, data) = urm
            .get_next_undo_request(DatabaseId::INVALID, false)
            .unwrap();
        assert_eq!(*data.fxid(), FullTransactionId(800));
        urm.unregister(req);
    }

    #[test]
    fn register_then_unregister_is_invisible() {
        let urm = UndoRequestManager::new(4, 3);

        let r100 = urm
            .register(FullTransactionId(100), DatabaseId(1))
            .unwrap();
        let r200 = urm
            .register(FullTransactionId(200), DatabaseId(1))
            .unwrap();
        assert_eq!(urm.oldest_fxid(), FullTransactionId(100));

        // A younger-than-everything registration extends the cached
        // minimum; unregistering it forces a recompute.
        let r50 = urm.register(FullTransactionId(50), DatabaseId(1)).unwrap();
        assert_eq!(urm.oldest_fxid(), FullTransactionId(50));
        urm.unregister(r50);

        assert_eq!(urm.utilization(), 2);
        assert_eq!(urm.oldest_fxid(), FullTransactionId(100));

        urm.unregister(r100);
        urm.unregister(r200);
        assert!(urm.is_empty());
    }

    #[test]
    #[should_panic(expected = "already queued")]
    fn duplicate_fxid_is_a_bug() {
        let urm = UndoRequestManager::new(4, 3);

        let a = urm.register(FullTransactionId(42), DatabaseId(1)).unwrap();
        let b = urm.register(FullTransactionId(42), DatabaseId(1)).unwrap();
        finalize_logged(&urm, &a, 100, 0x10, 0x74);
        finalize_logged(&urm, &b, 100, 0x80, 0xE4);

        assert!(urm.perform_undo_in_background(a, false).is_background());
        let _ = urm.perform_undo_in_background(b, false);
    }
}


#[cfg(test)]
mod retry_tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn failed_undo_waits_ten_then_thirty_seconds() {
        let t0 = 1_700_000_000_000;
        let clock = ManualClock::starting_at(t0);
        let urm = UndoRequestManager::with_clock(4, 3, clock.clone());

        let req = urm
            .register(FullTransactionId(400), DatabaseId(7))
            .unwrap();
        finalize_logged(&urm, &req, 256, 0x100, 0x200);
        assert!(urm.perform_undo_in_background(req, false).is_background());

        let (req, _) = urm
            .get_next_undo_request(DatabaseId::INVALID, false)
            .unwrap();
        urm.reschedule(req);

        // First failure: a ten-second wait.
        clock.set(t0 + 5_000);
        assert!(urm
            .get_next_undo_request(DatabaseId::INVALID, false)
            .is_none());
        clock.set(t0 + 11_000);
        let (req, data) = urm
            .get_next_undo_request(DatabaseId::INVALID, false)
            .unwrap();
        assert_eq!(*data.fxid(), FullTransactionId(400));

        // Second failure: thirty seconds from now.
        urm.reschedule(req);
        clock.set(t0 + 11_000 + 29_999);
        assert!(urm
            .get_next_undo_request(DatabaseId::INVALID, false)
            .is_none());
        clock.set(t0 + 11_000 + 30_001);
        let (req, _) = urm
            .get_next_undo_request(DatabaseId::INVALID, false)
            .unwrap();

        urm.unregister(req);
        assert!(urm.is_empty());
    }
}


#[cfg(test)]
mod persistence_tests {
    use super::testing::*;
    use super::*;
    use pretty_assertions_sorted::assert_eq;

    #[test]
    fn queued_requests_survive_a_restart() {
        let clock = ManualClock::starting_at(9_000_000);
        let urm = UndoRequestManager::with_clock(4, 3, clock.clone());

        register_and_queue(&urm, 300, 7, 2048);
        register_and_queue(&urm, 301, 7, 512);

        // One of them fails before the crash.
        let (req, data) = urm
            .get_next_undo_request(DatabaseId::INVALID, false)
            .unwrap();
        assert_eq!(*data.fxid(), FullTransactionId(300));
        urm.reschedule(req);

        let blob = urm.serialize();
        assert_eq!(blob.len(), 2 * UndoRequestData::ENCODED_LEN);

        // "Restart": a fresh manager with the same shape, same clock.
        let recovered = UndoRequestManager::with_clock(4, 3, clock.clone());
        recovered.restore(&blob).unwrap();
        assert_eq!(recovered.utilization(), 2);
        assert_eq!(recovered.oldest_fxid(), FullTransactionId(300));

        // The failed request came back without its retry penalty: it is
        // claimable immediately even though its window never elapsed.
        let (r1, d1) = recovered
            .get_next_undo_request(DatabaseId::INVALID, false)
            .unwrap();
        assert_eq!(*d1.fxid(), FullTransactionId(300));
        assert_eq!(*d1.size(), 2048);
        assert_eq!(*d1.start_location_logged(), UndoRecPtr(0x10));
        assert_eq!(*d1.end_location_logged(), UndoRecPtr(0x10 + 2048));

        let (r2, d2) = recovered
            .get_next_undo_request(DatabaseId::INVALID, false)
            .unwrap();
        assert_eq!(*d2.fxid(), FullTransactionId(301));

        recovered.unregister(r1);
        recovered.unregister(r2);
        assert!(recovered.is_empty());
    }

    #[test]
    fn serializing_an_idle_manager_yields_nothing() {
        let urm = UndoRequestManager::new(4, 3);

        // Unlisted requests are the caller's business, not the checkpoint's.
        let req = urm.register(FullTransactionId(9), DatabaseId(1)).unwrap();
        assert!(urm.serialize().is_empty());
        urm.unregister(req);

        urm.restore(&[]).unwrap();
        assert!(urm.is_empty());
    }

    #[test]
    fn restore_rejects_a_torn_blob() {
        let urm = UndoRequestManager::new(4, 3);
        let blob = vec![0u8; UndoRequestData::ENCODED_LEN + 1];

        let err = urm.restore(&blob).unwrap_err();
        assert!(matches!(err, RestoreError::CorruptLength { .. }));
        assert!(urm.is_empty());
    }

    #[test]
    fn restore_rejects_more_requests_than_capacity() {
        let donor = UndoRequestManager::new(4, 3);
        register_and_queue(&donor, 1, 1, 100);
        register_and_queue(&donor, 2, 1, 200);
        let blob = donor.serialize();

        // The session limit was lowered between runs.
        let urm = UndoRequestManager::new(1, 1);
        let err = urm.restore(&blob).unwrap_err();
        assert!(matches!(
            err,
            RestoreError::TooManyRequests {
                count: 2,
                capacity: 1
            }
        ));
        assert!(urm.is_empty());
    }
}


#[cfg(test)]
mod threading_tests {
    use super::testing::*;
    use super::*;
    use std::thread;

    #[test]
    fn producers_and_a_worker_agree_on_the_final_state() {
        let _ = common::util::trace::initialize_tracing();

        let urm = Arc::new(UndoRequestManager::new(200, 200));
        let mut handles = Vec::new();

        for t in 0..2u64 {
            let urm = Arc::clone(&urm);
            handles.push(thread::spawn(move || {
                for i in 1..=50u64 {
                    let fxid = t * 50 + i;
                    let req = urm
                        .register(FullTransactionId(fxid), DatabaseId(1))
                        .expect("arena full");
                    finalize_logged(&urm, &req, 64, 0x10, 0x50);
                    assert!(urm.perform_undo_in_background(req, true).is_background());
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(urm.utilization(), 100);

        let mut drained = 0;
        while let Some((req, _)) = urm.get_next_undo_request(DatabaseId::INVALID, false) {
            urm.unregister(req);
            drained += 1;
        }
        assert_eq!(drained, 100);
        assert!(urm.is_empty());
        assert_eq!(urm.inner.lock().queues.live_nodes(), 0);
    }
}
