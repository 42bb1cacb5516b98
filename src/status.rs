use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// SMTP-style status surfaced by the pipeline. Callers at the protocol
/// boundary translate these directly into wire responses.
///
/// The 4xx range is retryable, the 5xx range is final. Anything the pipeline
/// cannot attribute to a remote reply gets a synthesized code in the right
/// range so the retry decision stays uniform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmtpStatus {
    pub code: u16,
    pub enhanced: [u8; 3],
    pub message: String,
    /// Internal tag identifying the component that produced the status.
    pub reason: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub misc: BTreeMap<String, String>,
}

impl SmtpStatus {
    pub fn new(code: u16, enhanced: [u8; 3], message: impl Into<String>) -> Self {
        Self {
            code,
            enhanced,
            message: message.into(),
            reason: String::new(),
            misc: BTreeMap::new(),
        }
    }

    /// Generic permanent rejection (550 5.7.0).
    pub fn reject(message: impl Into<String>) -> Self {
        Self::new(550, [5, 7, 0], message)
    }

    /// Generic temporary deferral (451 4.0.0).
    pub fn defer(message: impl Into<String>) -> Self {
        Self::new(451, [4, 0, 0], message)
    }

    /// Temporary local failure, e.g. a disk write error (451 4.3.0).
    pub fn local_failure(message: impl Into<String>) -> Self {
        Self::new(451, [4, 3, 0], message)
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    pub fn with_misc(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.misc.insert(key.into(), value.into());
        self
    }

    pub fn is_permanent(&self) -> bool {
        self.code / 100 == 5
    }

    pub fn is_temporary(&self) -> bool {
        self.code / 100 == 4
    }

    /// Valid reply codes for configured rejects are restricted to 4xx/5xx.
    pub fn is_valid_reject_code(code: u16) -> bool {
        (400..600).contains(&code)
    }

    /// The `x.y.z` form used in DSN `Status:` fields.
    pub fn enhanced_code(&self) -> String {
        format!(
            "{}.{}.{}",
            self.enhanced[0], self.enhanced[1], self.enhanced[2]
        )
    }
}

impl fmt::Display for SmtpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.code, self.enhanced_code(), self.message)
    }
}

impl std::error::Error for SmtpStatus {}

impl From<std::io::Error> for SmtpStatus {
    fn from(err: std::io::Error) -> Self {
        SmtpStatus::new(451, [4, 4, 2], format!("I/O error: {err}")).with_reason("io")
    }
}
