//! The `persistence` module keeps presence state across restarts.
//!
//! It stores JSON snapshots of user and location records and the region
//! list in `sled`, an embedded key-value store. Records are written after
//! each mutation and read back the first time a key is looked up.

pub mod sled_store;

pub use sled_store::Persistence;
