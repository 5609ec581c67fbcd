//! Rendering for the two CLI output modes.
//!
//! Human mode prints terse lines; `--json` prints exactly one JSON document
//! per command on stdout. Errors go to stderr in both modes and carry the
//! stable kind tag.

use net_servers_core::error::CoreError;

pub struct Output {
    pub json: bool,
}

impl Output {
    #[must_use]
    pub fn new(json: bool) -> Self {
        Self { json }
    }

    /// Emit a command's result.
    pub fn emit(&self, human: &str, json: serde_json::Value) {
        if self.json {
            println!("{}", serde_json::to_string_pretty(&json).unwrap_or_default());
        } else if !human.is_empty() {
            println!("{human}");
        }
    }

    pub fn error(&self, err: &CoreError) {
        if self.json {
            let doc = serde_json::json!({
                "kind": err.kind.tag(),
                "message": err.message,
                "context": err.context,
            });
            eprintln!("{}", serde_json::to_string_pretty(&doc).unwrap_or_default());
        } else {
            eprintln!("error: {err}");
        }
    }
}
