//! Lease-based distributed lock on top of the blob store
//!
//! # Lock States
//!
//! | State | Record | Another writer may acquire |
//! |-------|--------|----------------------------|
//! | Unlocked | absent | yes |
//! | Acquired | `released_at` empty, heartbeat recent | no |
//! | Lapsed | `released_at` empty, heartbeat older than `expire_s + acquire_margin` | yes |
//! | Released | `released_at` set | yes |
//!
//! A lapsed lease is overwritten wholesale by the next acquirer. The old
//! holder finds out on its next [`LockHandle::maintain`], which fails with
//! [`crate::MemoError::LockStolen`].

mod guard;
mod lease;
mod record;

pub use guard::{locked, Maintainer};
pub use lease::{acquire, read_lock_record, LockHandle, LockOptions};
pub use record::{epoch_now, LockRecord, LOCK_FILE};
