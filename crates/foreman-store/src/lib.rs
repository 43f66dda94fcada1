//! Persistence port for the foreman engine.
//!
//! The engine's durable components (dead-letter queue, state manager,
//! checkpoint service) talk to a keyed byte-blob store through the
//! [`BlobStore`] trait. Implementations in this crate:
//!
//! - [`FsStore`] -- one file per key under a base directory, with
//!   atomic write-to-tmp-then-rename semantics.
//! - [`MemoryStore`] -- a HashMap behind a mutex, for tests and for
//!   callers that opt out of durability.

pub mod blob;
pub mod error;
pub mod fs;

pub use blob::{BlobStore, MemoryStore};
pub use error::{StoreError, StoreResult};
pub use fs::FsStore;
