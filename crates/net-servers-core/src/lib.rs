//! Configuration management core for the net-servers fleet.
//!
//! This crate owns the typed schema for every YAML document, the atomic
//! persistent store, the path layout and the environment registry. The
//! runtime machinery (watcher, synchronizers, certificates, container
//! supervision) lives in `net-servers-server`; this crate stays free of
//! subprocess and filesystem-watching concerns.

pub mod context;
pub mod environments;
pub mod error;
pub mod fsutil;
pub mod paths;
pub mod schema;
pub mod secrets;
pub mod store;

pub use context::CoreContext;
pub use environments::EnvironmentManager;
pub use error::{CoreError, CoreResult, ErrorKind, Issue};
pub use paths::Paths;
pub use store::{ConfigStore, Transaction};
