//! Conclave Core Library
//!
//! Orchestrates one user prompt across several independent external
//! command-line agents ("members"), each run by its own detached worker
//! process:
//! - Crash-safe status persistence (atomic rename, tolerant reads)
//! - Worker execution with timeout, stop, and rate-limit fallback
//! - Job creation and aggregate status reduction
//! - Cursor-based long-poll wait protocol
//! - Fingerprint cache of previous runs
//!
//! All cross-process coordination happens through the job directory tree;
//! there is no shared memory and no network surface.

pub mod aggregate;
pub mod cache;
pub mod config;
pub mod control;
pub mod coordinator;
pub mod error;
pub mod job;
pub mod mask;
pub mod results;
pub mod scenario;
pub mod status;
pub mod store;
pub mod tracing_init;
pub mod wait;
pub mod worker;

pub use config::Config;
pub use error::{Error, Result};
pub use status::{MemberState, MemberStatus};
