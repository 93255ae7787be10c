//! rollcall-store — durable attendance state.
//!
//! Students, course sessions, and the attendance arbiter: the
//! at-most-one-record-per-(session, student) invariant lives here, enforced
//! by the database's unique constraint rather than any in-process check.

pub mod records;
pub mod store;

pub use records::{
    AttendanceRecord, AttendanceStatus, CheckInMethod, MarkOutcome, SessionInfo, StoreError,
};
pub use store::{AttendanceStore, MarkRequest};
