//! # tablesync Storage
//!
//! Local key-value persistence for the tablesync engine.
//!
//! The engine persists two kinds of blobs across process restarts: the
//! pending action log and the local cache snapshot. This crate provides the
//! abstraction it writes them through. Persistence backends are **opaque byte
//! stores** keyed by short strings; they never interpret the bytes.
//!
//! ## Available Backends
//!
//! - [`InMemoryPersistence`] - For testing and ephemeral engines
//! - [`DirPersistence`] - One file per key inside a directory
//!
//! ## Example
//!
//! ```rust
//! use tablesync_storage::{InMemoryPersistence, Persistence};
//!
//! let store = InMemoryPersistence::new();
//! store.save("pending", b"queued").unwrap();
//! assert_eq!(store.load("pending").unwrap(), Some(b"queued".to_vec()));
//! ```

mod dir;
mod error;
mod memory;
mod persistence;

pub use dir::DirPersistence;
pub use error::{StorageError, StorageResult};
pub use memory::InMemoryPersistence;
pub use persistence::{validate_key, Persistence};
