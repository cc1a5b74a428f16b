//! Tracking of transactions whose effects may need to be rolled back.
//!
//! From the moment a transaction begins until the moment it commits, it
//! might abort, either through an error or because the whole system goes
//! down. If that happens, every undo record the transaction wrote must
//! eventually be applied. The [`manager::UndoRequestManager`] keeps one
//! request per such transaction in a fixed-size arena, decides whether an
//! abort's undo runs in the caller or in a background worker, and hands
//! queued requests to workers in an order that starves no one.

pub mod manager;
pub mod queue;
pub mod request;

pub use manager::{AdmissionOutcome, RestoreError, UndoRequestManager};
pub use request::{UndoRequestData, UndoRequestRef};
