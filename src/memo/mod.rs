//! Memoization protocol
//!
//! Derives a deterministic memospace address for each call and records the
//! call's lifecycle as control files under that address.
//!
//! # Control States
//!
//! | State | Blobs present | Runner behavior |
//! |-------|---------------|-----------------|
//! | Miss | none | compute |
//! | In flight / crashed | `invocation` | compute again (see [`OrphanPolicy`]) |
//! | Result | `result` | return cached value |
//! | Exception | `exception` | replay cached failure |

pub mod control;
pub mod identity;
pub mod negative;
pub mod pipeline;

pub use control::{
    ControlFiles, ControlHeader, ControlRecord, Invocation, MemoStatus, OrphanPolicy,
};
pub use identity::{
    argument_key, canonicalize, parse_logic_key, Args, CallGraph, CanonicalArgs, FunctionInfo,
    IdentityDeriver, MemospaceAddress, Param,
};
pub use negative::NegativeCache;
pub use pipeline::{PipelineContext, PipelineScope};
