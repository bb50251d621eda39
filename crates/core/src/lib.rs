//! Domain layer shared by the HTTP service and the storage crate.
//!
//! Nothing in here performs I/O: carrier payloads are parsed by
//! [`normalizer`], carrier states are ranked by [`status`], and the records
//! exchanged with storage live in [`types`].

pub mod normalizer;
pub mod status;
pub mod types;
