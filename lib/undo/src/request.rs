use byteorder::{ByteOrder, LittleEndian};
use common::{DatabaseId, FullTransactionId, Timestamp, UndoRecPtr};
use getset::{Getters, Setters};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

/// The durable portion of an undo request: everything a background worker
/// needs in order to apply a transaction's undo, and everything that must
/// survive a restart.
///
/// While the transaction is still running only `fxid` and `dbid` are
/// meaningful; the size and log locations are filled in when the request is
/// finalized at prepare or abort time. The retry deadline deliberately lives
/// outside this struct, because failure history is not carried across
/// crashes.
///
/// Note that temporary undo never appears here. Temporary objects die with
/// the session that owned them, so their undo can never need background
/// processing.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    Getters,
    Setters,
    TypedBuilder,
)]
#[getset(get = "pub", set = "pub")]
pub struct UndoRequestData {
    fxid: FullTransactionId,
    dbid: DatabaseId,
    /// Total bytes of logged plus unlogged undo the transaction wrote.
    size: u64,
    start_location_logged: UndoRecPtr,
    end_location_logged: UndoRecPtr,
    start_location_unlogged: UndoRecPtr,
    end_location_unlogged: UndoRecPtr,
}

impl UndoRequestData {
    /// Width of one record in the serialized checkpoint blob: fxid (8),
    /// dbid (4), size (8), and the four log pointers (8 each).
    pub const ENCODED_LEN: usize = 52;

    pub(crate) fn empty(fxid: FullTransactionId, dbid: DatabaseId) -> Self {
        UndoRequestData::builder()
            .fxid(fxid)
            .dbid(dbid)
            .size(0)
            .start_location_logged(UndoRecPtr::INVALID)
            .end_location_logged(UndoRecPtr::INVALID)
            .start_location_unlogged(UndoRecPtr::INVALID)
            .end_location_unlogged(UndoRecPtr::INVALID)
            .build()
    }

    /// True when the transaction wrote any undo at all. A request that never
    /// did can be dropped instead of queued.
    pub fn has_undo(&self) -> bool {
        self.start_location_logged.is_valid() || self.start_location_unlogged.is_valid()
    }

    pub(crate) fn encode_into(&self, buf: &mut [u8]) {
        debug_assert_eq!(buf.len(), Self::ENCODED_LEN);
        LittleEndian::write_u64(&mut buf[0..8], self.fxid.0);
        LittleEndian::write_u32(&mut buf[8..12], self.dbid.0);
        LittleEndian::write_u64(&mut buf[12..20], self.size);
        LittleEndian::write_u64(&mut buf[20..28], self.start_location_logged.0);
        LittleEndian::write_u64(&mut buf[28..36], self.end_location_logged.0);
        LittleEndian::write_u64(&mut buf[36..44], self.start_location_unlogged.0);
        LittleEndian::write_u64(&mut buf[44..52], self.end_location_unlogged.0);
    }

    pub(crate) fn decode(buf: &[u8]) -> Self {
        debug_assert_eq!(buf.len(), Self::ENCODED_LEN);
        UndoRequestData::builder()
            .fxid(FullTransactionId(LittleEndian::read_u64(&buf[0..8])))
            .dbid(DatabaseId(LittleEndian::read_u32(&buf[8..12])))
            .size(LittleEndian::read_u64(&buf[12..20]))
            .start_location_logged(UndoRecPtr(LittleEndian::read_u64(&buf[20..28])))
            .end_location_logged(UndoRecPtr(LittleEndian::read_u64(&buf[28..36])))
            .start_location_unlogged(UndoRecPtr(LittleEndian::read_u64(&buf[36..44])))
            .end_location_unlogged(UndoRecPtr(LittleEndian::read_u64(&buf[44..52])))
            .build()
    }
}

/// Which index set a LISTED request occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ListedIn {
    /// Both the by-fxid and by-size queues; the request has never failed.
    FxidAndSize,
    /// The by-retry-time queue; a previous undo attempt failed.
    RetryTime,
}

/// Lifecycle tag for a request slot.
///
/// The tag always agrees with the retry-time sentinel: a slot is
/// `Listed(RetryTime)` exactly when its retry time is not never-begin. The
/// tag is what membership decisions are made from; the sentinel is what gets
/// compared against the clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotState {
    /// On the free-list, available for reuse. The slot's fxid is invalid.
    Free,
    /// Allocated to a transaction but in no queue. The slot is owned by
    /// whichever caller holds its [`UndoRequestRef`].
    Unlisted,
    /// Queued for background processing.
    Listed(ListedIn),
}

/// One slot in the request arena.
#[derive(Debug)]
pub(crate) struct UndoRequestSlot {
    pub(crate) data: UndoRequestData,
    /// Earliest moment a previously failed undo may be retried;
    /// never-begin until the first failure.
    pub(crate) retry_time: Timestamp,
    pub(crate) state: SlotState,
    /// Free-list successor, meaningful only while the slot is free.
    pub(crate) next_free: Option<usize>,
}

impl UndoRequestSlot {
    pub(crate) fn vacant(next_free: Option<usize>) -> Self {
        UndoRequestSlot {
            data: UndoRequestData::empty(FullTransactionId::INVALID, DatabaseId::INVALID),
            retry_time: Timestamp::NEVER_BEGIN,
            state: SlotState::Free,
            next_free,
        }
    }
}

/// Caller-held capability for an unlisted undo request.
///
/// Whoever holds this value owns the request: the manager will not touch the
/// slot until the holder hands the value back through one of the manager's
/// entry points. The type is deliberately not `Clone` — dropping it without
/// unregistering, rescheduling, or queueing leaks the slot for good.
#[derive(Debug)]
pub struct UndoRequestRef {
    pub(crate) slot: usize,
}
