//! # Rewind Core
//!
//! A tiered, bounded-memory history cache for periodic full-state snapshots
//! of a running simulation.
//!
//! This crate provides:
//! - **[`RingStateStore`]**: a fixed-byte-budget circular store of opaque
//!   snapshots keyed by a strictly increasing frame number
//! - **[`StateHistory`]**: three ring stores (Current, Recent, Ancient)
//!   composed into a coarsening pipeline, plus reserved snapshots, a
//!   frame-0 anchor, and a decompression cache
//! - **[`Statable`]**: the collaborator contract for anything that can
//!   stream its complete runtime state out and back in
//!
//! ## Design Principles
//!
//! 1. **Strict byte budgets** - every tier owns one fixed arena; eviction
//!    is FIFO by frame and demotes into the next, coarser tier
//! 2. **Dense near the present, sparse in the past** - spacing policies
//!    widen with tier age while total memory stays bounded
//! 3. **Total queries** - once engaged, a closest-frame lookup always has
//!    an answer, down to the frame-0 anchor
//! 4. **Single-threaded, synchronous** - one owner per history; hosts
//!    needing threads serialize access externally
//!
//! ## Example
//!
//! ```rust,ignore
//! use rewind_core::{HistorySettings, StateHistory};
//!
//! let mut history = StateHistory::new(HistorySettings::default())?;
//! history.engage(initial_state_bytes)?;
//! for frame in 0..1000 {
//!     machine.run_frame();
//!     history.capture(frame, &machine)?;
//! }
//! let closest = history.get_state_closest_to(500)?;
//! machine.load_state(&mut closest.reader())?;
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cache;
mod codec;
pub mod history;
pub mod settings;
pub mod statable;
pub mod store;

pub use cache::DecompressionCache;
pub use history::{ClosestState, HistoryError, StateHistory};
pub use settings::{HistorySettings, SettingsError};
pub use statable::Statable;
pub use store::{RingStateStore, StateView, StoreConfig, StoreError};

/// Result type for rewind-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for rewind-core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Ring-store errors
    #[error("store error: {0}")]
    Store(#[from] store::StoreError),

    /// History-manager errors
    #[error("history error: {0}")]
    History(#[from] history::HistoryError),

    /// Settings validation errors
    #[error("settings error: {0}")]
    Settings(#[from] settings::SettingsError),
}
