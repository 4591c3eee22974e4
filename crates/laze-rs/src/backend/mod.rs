//! Backend contract shared by every execution target.
//!
//! `spec` defines the portable step-program format and the [`spec::DeviceBackend`]
//! trait; `hashing` provides the fingerprint primitive used by the step cache.

pub(crate) mod hashing;
pub mod spec;
