//! # ReefDB
//!
//! An embeddable in-memory key/value store with optional durable
//! persistence. Values are binary strings keyed by binary strings.
//!
//! This crate provides:
//! - ACID transactions: a single writer serialized against many readers
//! - Secondary indexes, both value-ordered (B-tree) and spatial (R-tree)
//! - Per-item time-to-live eviction with a background sweeper
//! - An append-only RESP command log with online compaction
//!
//! ## Example
//!
//! ```rust,ignore
//! use reefdb_core::{ordering, Database};
//!
//! let db = Database::open(":memory:")?;
//! db.create_index("names", b"user:*", &[ordering::string()])?;
//! db.update(|tx| {
//!     tx.set(b"user:1", b"Carol", None)?;
//!     tx.set(b"user:2", b"Alan", None)?;
//!     Ok(())
//! })?;
//! db.view(|tx| {
//!     tx.ascend("names", |_, key, value| {
//!         println!("{:?} = {:?}", key, value);
//!         Ok(true)
//!     })
//! })?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod database;
mod error;
mod index;
mod item;
mod log;
mod tx;

pub mod pattern;
pub mod rect;

pub use config::{Config, OnExpired, OnExpiredSync, SyncPolicy};
pub use database::Database;
pub use error::{Error, Result};
pub use index::ordering;
pub use index::ordering::LessFn;
pub use index::IndexOptions;
pub use rect::{Rect, RectFn, MAX_DIMS};
pub use tx::{SetOptions, Tx};
