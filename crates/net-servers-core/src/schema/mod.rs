//! Typed records for every YAML document the store owns.
//!
//! Each record type implements [`Document`]: a strict parser from a generic
//! YAML tree with per-field issue accumulation, a canonical emitter, a
//! documented default, and an intra-document validator list. Cross-document
//! rules live in [`validate`].

pub mod certificate;
pub mod domain;
pub mod environment;
pub mod global;
pub mod service;
pub mod user;
pub mod validate;
pub mod yaml;

pub use certificate::{CertificateMeta, CertificateMode};
pub use domain::{Domain, DomainsFile};
pub use environment::{Environment, EnvironmentsFile, PortMapping, Protocol};
pub use global::{GlobalConfig, SystemSettings};
pub use service::{DeclaredPort, ServiceConfig, ServicesFile};
pub use user::{User, UsersFile};

use crate::error::Issue;
use serde_yaml::Value;

/// The fixed set of documents under `<base>/config/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocKind {
    Global,
    Users,
    Domains,
    Services,
    Environments,
    Secrets,
}

impl DocKind {
    /// Path of the document relative to the config directory.
    #[must_use]
    pub fn relative_path(self) -> &'static str {
        match self {
            Self::Global => "global.yaml",
            Self::Users => "users.yaml",
            Self::Domains => "domains.yaml",
            Self::Services => "services/services.yaml",
            Self::Environments => "environments.yaml",
            Self::Secrets => "secrets.yaml",
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Users => "users",
            Self::Domains => "domains",
            Self::Services => "services",
            Self::Environments => "environments",
            Self::Secrets => "secrets",
        }
    }
}

/// A typed, validated configuration document.
pub trait Document: Clone + Send + Sync + 'static {
    const KIND: DocKind;

    /// Strict parse from a generic YAML tree. All findings are accumulated;
    /// a record is only returned when none are fatal.
    fn parse(value: &Value) -> Result<Self, Vec<Issue>>
    where
        Self: Sized;

    /// Canonical emission: fixed key order, suitable for byte-stable
    /// round-trips.
    fn emit(&self) -> Value;

    /// Documented minimal default written by `initialize_defaults`.
    fn default_document() -> Self;

    /// Intra-document validation rules.
    fn validate(&self) -> Vec<Issue>;
}
