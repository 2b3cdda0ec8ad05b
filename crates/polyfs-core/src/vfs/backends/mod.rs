//! Storage backends.
//!
//! Backends implement [`Storage`](super::Storage) for different kinds of
//! storage.

mod local;
mod memory;

pub use local::LocalBackend;
pub use memory::MemoryBackend;
