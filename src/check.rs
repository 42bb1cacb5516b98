use async_trait::async_trait;
use futures::FutureExt;
use futures::future::join_all;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::error;

use crate::authres::AuthResult;
use crate::buffer::BodyBuffer;
use crate::header::Header;
use crate::message::MessageMeta;
use crate::status::SmtpStatus;

/// Verdict of one check stage. Checks never touch shared state; the group
/// merges these value results under its own control.
#[derive(Debug, Clone, Default)]
pub struct CheckResult {
    /// Non-nil rejects the message (or recipient) at the current stage.
    pub reject: Option<SmtpStatus>,
    pub quarantine: bool,
    pub score_adjust: i32,
    /// Records to append to the outgoing Authentication-Results field.
    pub auth_results: Vec<AuthResult>,
    /// Fields to prepend to the outgoing header.
    pub header: Header,
}

impl CheckResult {
    pub fn rejected(status: SmtpStatus) -> Self {
        Self {
            reject: Some(status),
            ..Default::default()
        }
    }
}

/// Factory for per-message check state, registered in the pipeline
/// configuration.
pub trait Check: Send + Sync {
    fn name(&self) -> &'static str;

    fn state(&self, meta: &MessageMeta) -> Box<dyn CheckState>;
}

/// Check state bound to one message. Stages are invoked in order:
/// connection, sender, rcpt (once per recipient), body.
#[async_trait]
pub trait CheckState: Send {
    async fn check_connection(&mut self) -> CheckResult {
        CheckResult::default()
    }

    async fn check_sender(&mut self, _mail_from: &str) -> CheckResult {
        CheckResult::default()
    }

    async fn check_rcpt(&mut self, _rcpt_to: &str) -> CheckResult {
        CheckResult::default()
    }

    async fn check_body(&mut self, _header: &Header, _body: &dyn BodyBuffer) -> CheckResult {
        CheckResult::default()
    }

    /// Release per-message resources. Always called, also after a reject.
    async fn close(&mut self) {}
}

/// A set of checks that run concurrently per stage.
#[derive(Clone, Default)]
pub struct CheckGroup {
    checks: Vec<Arc<dyn Check>>,
}

impl CheckGroup {
    pub fn new(checks: Vec<Arc<dyn Check>>) -> Self {
        Self { checks }
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    pub fn open(&self, meta: &MessageMeta) -> CheckGroupState {
        CheckGroupState {
            states: self
                .checks
                .iter()
                .map(|check| (check.name(), check.state(meta)))
                .collect(),
        }
    }
}

impl std::fmt::Debug for CheckGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.checks.iter().map(|c| c.name()))
            .finish()
    }
}

/// Per-message state of a check group: one state per member check.
pub struct CheckGroupState {
    states: Vec<(&'static str, Box<dyn CheckState>)>,
}

/// Run one member's stage future, converting a panic into a temporary
/// reject so one broken check cannot take down the connection task.
async fn guard(
    name: &'static str,
    fut: impl Future<Output = CheckResult>,
) -> CheckResult {
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(_) => {
            error!(check = name, "check panicked, deferring message");
            CheckResult::rejected(
                SmtpStatus::local_failure("internal check error").with_reason("check-panic"),
            )
        }
    }
}

/// Merge concurrent member results: scores sum, quarantine ORs,
/// header/auth-result lists concatenate, the first reject wins. All members
/// have already run to completion by the time this is called.
fn merge(results: Vec<CheckResult>) -> CheckResult {
    let mut merged = CheckResult::default();
    for mut result in results {
        merged.score_adjust += result.score_adjust;
        merged.quarantine |= result.quarantine;
        merged.auth_results.append(&mut result.auth_results);
        merged.header.append_all(&result.header);
        if merged.reject.is_none() {
            merged.reject = result.reject;
        }
    }
    merged
}

impl CheckGroupState {
    pub async fn connection(&mut self) -> CheckResult {
        merge(
            join_all(
                self.states
                    .iter_mut()
                    .map(|(name, state)| guard(*name, state.check_connection())),
            )
            .await,
        )
    }

    pub async fn sender(&mut self, mail_from: &str) -> CheckResult {
        merge(
            join_all(
                self.states
                    .iter_mut()
                    .map(|(name, state)| guard(*name, state.check_sender(mail_from))),
            )
            .await,
        )
    }

    pub async fn rcpt(&mut self, rcpt_to: &str) -> CheckResult {
        merge(
            join_all(
                self.states
                    .iter_mut()
                    .map(|(name, state)| guard(*name, state.check_rcpt(rcpt_to))),
            )
            .await,
        )
    }

    pub async fn body(&mut self, header: &Header, body: &dyn BodyBuffer) -> CheckResult {
        merge(
            join_all(
                self.states
                    .iter_mut()
                    .map(|(name, state)| guard(*name, state.check_body(header, body))),
            )
            .await,
        )
    }

    pub async fn close(&mut self) {
        join_all(self.states.iter_mut().map(|(_, state)| state.close())).await;
    }
}
