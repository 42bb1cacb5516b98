use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use uuid::Uuid;

/// Opaque per-message identifier: 32 lowercase hex digits.
///
/// Used as the logging correlation key and as the queue filename stem, so the
/// textual form is load-bearing and parsing is strict.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("message id must be 32 lowercase hex digits")]
pub struct ParseMessageIdError;

impl FromStr for MessageId {
    type Err = ParseMessageIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() == 32 && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
            Ok(Self(s.to_string()))
        } else {
            Err(ParseMessageIdError)
        }
    }
}

/// A boolean shared between everyone holding a clone of the message metadata.
///
/// Checks flip the quarantine flag after delivery targets have already been
/// opened with their own metadata clone, so the flag has to be shared rather
/// than copied.
#[derive(Debug, Clone, Default)]
pub struct SharedFlag(Arc<AtomicBool>);

impl SharedFlag {
    pub fn new(value: bool) -> Self {
        Self(Arc::new(AtomicBool::new(value)))
    }

    pub fn get(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set(&self, value: bool) {
        self.0.store(value, Ordering::Relaxed);
    }
}

impl Serialize for SharedFlag {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bool(self.get())
    }
}

impl<'de> Deserialize<'de> for SharedFlag {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        bool::deserialize(deserializer).map(SharedFlag::new)
    }
}

/// Metadata attached to a message at ingress and carried through the
/// pipeline and the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMeta {
    pub id: MessageId,
    /// Protocol the message arrived over ("smtp", "submission", "internal", ...).
    pub source_proto: String,
    /// Remote address of the peer: an IP address or a unix socket path.
    pub source_addr: Option<String>,
    /// Hostname the peer used in its greeting.
    pub source_hostname: String,
    pub auth_user: Option<String>,
    pub tls: bool,
    pub smtp_utf8: bool,
    /// True for submission: suppresses Received-header tracing of the client.
    pub dont_trace_sender: bool,
    pub quarantine: SharedFlag,
    pub received_at: DateTime<Utc>,
}

impl MessageMeta {
    pub fn new(source_proto: impl Into<String>, source_hostname: impl Into<String>) -> Self {
        Self {
            id: MessageId::generate(),
            source_proto: source_proto.into(),
            source_addr: None,
            source_hostname: source_hostname.into(),
            auth_user: None,
            tls: false,
            smtp_utf8: false,
            dont_trace_sender: false,
            quarantine: SharedFlag::default(),
            received_at: Utc::now(),
        }
    }
}
