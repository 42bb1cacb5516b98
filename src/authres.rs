use serde::{Deserialize, Serialize};
use std::fmt::Write;

/// One method result destined for the Authentication-Results field
/// (RFC 8601), e.g. `spf=pass smtp.mailfrom=alice@example.org`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthResult {
    pub method: String,
    pub result: String,
    pub reason: Option<String>,
    /// ptype.property / value pairs, e.g. ("smtp.mailfrom", "a@b").
    pub props: Vec<(String, String)>,
}

impl AuthResult {
    pub fn new(method: impl Into<String>, result: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            result: result.into(),
            reason: None,
            props: Vec::new(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_prop(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.props.push((key.into(), value.into()));
        self
    }

    /// Shorthand for an SPF verdict on the envelope sender.
    pub fn spf(result: impl Into<String>, mail_from: impl Into<String>) -> Self {
        Self::new("spf", result).with_prop("smtp.mailfrom", mail_from)
    }
}

/// Render one Authentication-Results field value: the authserv-id followed
/// by every method result, `none` if there are no results.
pub fn render(authserv_id: &str, results: &[AuthResult]) -> String {
    if results.is_empty() {
        return format!("{authserv_id}; none");
    }
    let mut out = String::from(authserv_id);
    for res in results {
        let _ = write!(out, "; {}={}", res.method, res.result);
        if let Some(reason) = &res.reason {
            let _ = write!(out, " reason=\"{reason}\"");
        }
        for (key, value) in &res.props {
            let _ = write!(out, " {key}={value}");
        }
    }
    out
}
