use serde::{Deserialize, Serialize};

/// How a domain's certificate is provisioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CertificateMode {
    #[default]
    None,
    SelfSigned,
    Acme,
}

impl CertificateMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::SelfSigned => "self_signed",
            Self::Acme => "acme",
        }
    }

    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Self::None),
            "self_signed" => Some(Self::SelfSigned),
            "acme" => Some(Self::Acme),
            _ => None,
        }
    }
}

/// Metadata persisted as `meta.yaml` next to the PEM triple.
///
/// Renewal decisions read this record instead of re-parsing X.509; the
/// certificate manager rewrites it on every issuance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateMeta {
    pub domain: String,
    pub mode: CertificateMode,
    pub not_before: chrono::DateTime<chrono::Utc>,
    pub not_after: chrono::DateTime<chrono::Utc>,
    pub fingerprint_sha256: String,
}

impl CertificateMeta {
    /// True when the certificate is inside the renewal window.
    #[must_use]
    pub fn due_for_renewal(&self, now: chrono::DateTime<chrono::Utc>, window_days: i64) -> bool {
        self.not_after - now < chrono::Duration::days(window_days)
    }

    #[must_use]
    pub fn expired(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        now >= self.not_after
    }
}
