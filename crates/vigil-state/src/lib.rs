//! vigil-state — durable state for the Vigil engine.
//!
//! Backed by [redb](https://docs.rs/redb). Holds one record per service
//! (machine state, counters, recent checks, recovery progress), one record
//! per incident (with embedded recovery attempts and notifications), and a
//! dedup index keyed by notification dedup key.
//!
//! # Atomicity
//!
//! redb serializes write transactions, so every read-modify-write below
//! runs inside a single write transaction. Service records additionally
//! carry a `version` that `commit_transition` compares before writing.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and is shared by every per-service pipeline.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
