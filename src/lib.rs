//! blobmemo - Memoized computation over a blob store
//!
//! Every call to a memoized function gets a deterministic address derived
//! from the function, its logic key, the logic keys of everything it calls,
//! and its canonicalized arguments. Results and failures are recorded as
//! control files under that address, so any process sharing the store can
//! reuse them. A lease lock built on the same store serializes writers that
//! need at-most-once computation.

pub mod audit;
pub mod cli;
pub mod config;
pub mod error;
pub mod host;
pub mod lock;
pub mod memo;
pub mod runner;
pub mod store;
pub mod ui;

pub use error::{MemoError, MemoResult};
