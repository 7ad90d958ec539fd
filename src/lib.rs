//! Asynchronous interior-node topology update engine for a copy-on-write,
//! multi-device btree.
//!
//! This crate owns splits, foreground merges, full-node rewrites, root
//! replacements and pointer rewrites, coordinating node allocation,
//! journal pins and disk reservations so that a partially constructed
//! subtree is never reachable from a persisted root. The leaf key/value
//! path, bset packing, journal I/O and bucket allocator are external
//! collaborators; [`journal`] and [`allocator`] define their contracts
//! plus small in-memory reference implementations good enough to drive
//! [`engine::Engine`] end to end in tests.
//!
//! See `DESIGN.md` in the repository root for how each module is grounded.

pub mod allocator;
pub mod bkey;
pub mod cache;
pub mod config;
pub mod constructor;
pub mod engine;
pub mod error;
pub mod fixup;
pub mod flags;
pub mod format;
pub mod journal;
pub mod lock;
pub mod node;
pub mod pool;
pub mod pos;
pub mod root;
pub mod update;

pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{Error, ErrorKind, Result};
pub use pos::{BtreeId, Pos};

/// Initialize `env_logger` from the environment, for test harnesses and
/// downstream binaries that want the crate's `trace!`/`debug!` output
/// without configuring a logger themselves. No-op if a logger is already
/// installed. Only present when the `init_env_logger` feature is on; the
/// crate itself never calls this.
#[cfg(feature = "init_env_logger")]
pub fn init_logging() {
    let _ = env_logger::try_init();
}
