use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Closed set of error kinds surfaced by the core.
///
/// Every error carries one of these tags so the CLI can map it to a stable
/// exit code and `--json` consumers can switch on it without parsing
/// messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    ConfigParse,
    ConfigValidate,
    IoTransient,
    IoFatal,
    EnvNotFound,
    EnvNotEnabled,
    EnvLastRemaining,
    EnvCurrentRemove,
    PortConflict,
    PathConflict,
    PathNotAbsolute,
    RuntimeUnavailable,
    RuntimeTimeout,
    RuntimeError,
    CertIssueFailed,
    CertExpired,
    ZoneCheckFailed,
    ReloadFailed,
    PlanConflict,
}

impl ErrorKind {
    /// Stable tag used in log lines and `--json` output.
    #[must_use]
    pub fn tag(self) -> &'static str {
        match self {
            Self::ConfigParse => "CONFIG_PARSE",
            Self::ConfigValidate => "CONFIG_VALIDATE",
            Self::IoTransient => "IO_TRANSIENT",
            Self::IoFatal => "IO_FATAL",
            Self::EnvNotFound => "ENV_NOT_FOUND",
            Self::EnvNotEnabled => "ENV_NOT_ENABLED",
            Self::EnvLastRemaining => "ENV_LAST_REMAINING",
            Self::EnvCurrentRemove => "ENV_CURRENT_REMOVE",
            Self::PortConflict => "PORT_CONFLICT",
            Self::PathConflict => "PATH_CONFLICT",
            Self::PathNotAbsolute => "PATH_NOT_ABSOLUTE",
            Self::RuntimeUnavailable => "RUNTIME_UNAVAILABLE",
            Self::RuntimeTimeout => "RUNTIME_TIMEOUT",
            Self::RuntimeError => "RUNTIME_ERROR",
            Self::CertIssueFailed => "CERT_ISSUE_FAILED",
            Self::CertExpired => "CERT_EXPIRED",
            Self::ZoneCheckFailed => "ZONE_CHECK_FAILED",
            Self::ReloadFailed => "RELOAD_FAILED",
            Self::PlanConflict => "PLAN_CONFLICT",
        }
    }

    /// Process exit code for the CLI surface.
    ///
    /// 2 validation, 3 not-found, 4 conflict, 5 runtime, 6 external service.
    #[must_use]
    pub fn exit_code(self) -> i32 {
        match self {
            Self::ConfigParse | Self::ConfigValidate | Self::PathNotAbsolute => 2,
            Self::EnvNotFound => 3,
            Self::EnvNotEnabled
            | Self::EnvLastRemaining
            | Self::EnvCurrentRemove
            | Self::PortConflict
            | Self::PathConflict
            | Self::PlanConflict => 4,
            Self::IoTransient
            | Self::IoFatal
            | Self::RuntimeUnavailable
            | Self::RuntimeTimeout
            | Self::RuntimeError
            | Self::ReloadFailed => 5,
            Self::CertIssueFailed | Self::CertExpired | Self::ZoneCheckFailed => 6,
        }
    }
}

/// Structured error carried across every core boundary.
///
/// The `context` map holds machine-readable details (file, position, rule,
/// port numbers) that `--json` emits verbatim. Messages and context must
/// never contain secret material; call sites that handle secrets go through
/// [`crate::secrets::Secret`], whose `Display` is already redacted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, String>,
}

impl CoreError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with(mut self, key: &str, value: impl fmt::Display) -> Self {
        self.context.insert(key.to_string(), value.to_string());
        self
    }

    /// Classify a filesystem error as transient or fatal.
    ///
    /// Interrupted and would-block conditions are retriable; permission and
    /// space problems are not.
    pub fn from_io(err: &std::io::Error, path: &std::path::Path) -> Self {
        use std::io::ErrorKind as Io;
        let kind = match err.kind() {
            Io::Interrupted | Io::WouldBlock | Io::TimedOut => ErrorKind::IoTransient,
            _ => ErrorKind::IoFatal,
        };
        Self::new(kind, err.to_string()).with("path", path.display())
    }

    #[must_use]
    pub fn exit_code(&self) -> i32 {
        self.kind.exit_code()
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.tag(), self.message)?;
        for (k, v) in &self.context {
            write!(f, " [{k}={v}]")?;
        }
        Ok(())
    }
}

impl std::error::Error for CoreError {}

pub type CoreResult<T> = Result<T, CoreError>;

/// A single parse or validation finding, addressed by a dotted path like
/// `users[3].email`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub path: String,
    pub rule: String,
    pub message: String,
}

impl Issue {
    pub fn new(path: impl Into<String>, rule: &str, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            rule: rule.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} ({})", self.path, self.message, self.rule)
    }
}

/// Fold a non-empty issue list into a `CONFIG_VALIDATE` error.
pub fn validation_error(file: &str, issues: &[Issue]) -> CoreError {
    let first = issues.first().expect("validation_error requires issues");
    let mut err = CoreError::new(
        ErrorKind::ConfigValidate,
        format!("{file}: {} validation issue(s), first: {first}", issues.len()),
    )
    .with("file", file)
    .with("path", &first.path)
    .with("rule", &first.rule);
    if issues.len() > 1 {
        err = err.with("additional", issues.len() - 1);
    }
    err
}

/// Fold parse issues into a `CONFIG_PARSE` error.
pub fn parse_error(file: &str, issues: &[Issue]) -> CoreError {
    let first = issues.first().expect("parse_error requires issues");
    CoreError::new(
        ErrorKind::ConfigParse,
        format!("{file}: {} parse issue(s), first: {first}", issues.len()),
    )
    .with("file", file)
    .with("position", &first.path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_grouped_by_class() {
        assert_eq!(ErrorKind::ConfigValidate.exit_code(), 2);
        assert_eq!(ErrorKind::EnvNotFound.exit_code(), 3);
        assert_eq!(ErrorKind::PortConflict.exit_code(), 4);
        assert_eq!(ErrorKind::RuntimeTimeout.exit_code(), 5);
        assert_eq!(ErrorKind::CertIssueFailed.exit_code(), 6);
    }

    #[test]
    fn display_includes_tag_and_context() {
        let err = CoreError::new(ErrorKind::PortConflict, "host port already bound")
            .with("port", 8180)
            .with("owner", "net-servers-apache-testing");
        let text = err.to_string();
        assert!(text.starts_with("PORT_CONFLICT: "));
        assert!(text.contains("[port=8180]"));
        assert!(text.contains("[owner=net-servers-apache-testing]"));
    }

    #[test]
    fn json_rendering_carries_kind_tag() {
        let err = CoreError::new(ErrorKind::EnvNotFound, "no such environment").with("name", "qa");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "ENV_NOT_FOUND");
        assert_eq!(json["context"]["name"], "qa");
    }
}
