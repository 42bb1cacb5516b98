//! Shared test fixtures: scripted checks, modifiers and delivery targets.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::buffer::{BodyBuffer, MemoryBuffer, read_to_vec};
use crate::check::{Check, CheckResult, CheckState};
use crate::header::Header;
use crate::message::MessageMeta;
use crate::modify::{Modifier, ModifierChain, ModifierState};
use crate::status::SmtpStatus;
use crate::target::{Delivery, DeliveryTarget, StatusCollector};

/// Check returning fixed results per stage.
#[derive(Default)]
pub(crate) struct StaticCheck {
    pub connection: Option<CheckResult>,
    pub sender: Option<CheckResult>,
    pub rcpt: Option<CheckResult>,
    pub body: Option<CheckResult>,
}

impl StaticCheck {
    pub fn body_stage(result: CheckResult) -> Self {
        Self {
            body: Some(result),
            ..Default::default()
        }
    }

    pub fn sender_stage(result: CheckResult) -> Self {
        Self {
            sender: Some(result),
            ..Default::default()
        }
    }
}

impl Check for StaticCheck {
    fn name(&self) -> &'static str {
        "static"
    }

    fn state(&self, _meta: &MessageMeta) -> Box<dyn CheckState> {
        Box::new(StaticCheckState {
            connection: self.connection.clone(),
            sender: self.sender.clone(),
            rcpt: self.rcpt.clone(),
            body: self.body.clone(),
        })
    }
}

struct StaticCheckState {
    connection: Option<CheckResult>,
    sender: Option<CheckResult>,
    rcpt: Option<CheckResult>,
    body: Option<CheckResult>,
}

#[async_trait]
impl CheckState for StaticCheckState {
    async fn check_connection(&mut self) -> CheckResult {
        self.connection.clone().unwrap_or_default()
    }

    async fn check_sender(&mut self, _mail_from: &str) -> CheckResult {
        self.sender.clone().unwrap_or_default()
    }

    async fn check_rcpt(&mut self, _rcpt_to: &str) -> CheckResult {
        self.rcpt.clone().unwrap_or_default()
    }

    async fn check_body(&mut self, _header: &Header, _body: &dyn BodyBuffer) -> CheckResult {
        self.body.clone().unwrap_or_default()
    }
}

/// Modifier appending a fixed suffix to the sender address.
struct SuffixSender {
    suffix: &'static str,
}

impl Modifier for SuffixSender {
    fn name(&self) -> &'static str {
        "suffix-sender"
    }

    fn state(&self, _meta: &MessageMeta) -> Box<dyn ModifierState> {
        Box::new(SuffixSenderState {
            suffix: self.suffix,
        })
    }
}

struct SuffixSenderState {
    suffix: &'static str,
}

#[async_trait]
impl ModifierState for SuffixSenderState {
    async fn rewrite_sender(&mut self, mail_from: String) -> Result<String, SmtpStatus> {
        Ok(format!("{mail_from}{}", self.suffix))
    }
}

pub(crate) fn suffix_sender_chain(suffix: &'static str) -> ModifierChain {
    ModifierChain::new(vec![Arc::new(SuffixSender { suffix })])
}

/// Everything a target saw at commit time.
pub(crate) struct CommittedMessage {
    pub mail_from: String,
    pub rcpts: Vec<String>,
    pub header: Header,
    pub body: Vec<u8>,
    pub quarantine: bool,
}

#[derive(Default)]
struct RecordingInner {
    committed: Mutex<Vec<Arc<CommittedMessage>>>,
    aborted: AtomicUsize,
    body_error: Mutex<Option<SmtpStatus>>,
}

/// Target recording every committed message; the body stage can be
/// scripted to fail.
pub(crate) struct RecordingTarget {
    name: &'static str,
    inner: Arc<RecordingInner>,
}

impl RecordingTarget {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: Arc::new(RecordingInner::default()),
        }
    }

    pub fn fail_body(&self, status: SmtpStatus) {
        *self.inner.body_error.lock().unwrap() = Some(status);
    }

    pub fn committed(&self) -> Vec<Arc<CommittedMessage>> {
        self.inner.committed.lock().unwrap().clone()
    }

    pub fn aborted(&self) -> usize {
        self.inner.aborted.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeliveryTarget for RecordingTarget {
    fn name(&self) -> &str {
        self.name
    }

    async fn start(
        &self,
        meta: &MessageMeta,
        mail_from: &str,
    ) -> Result<Box<dyn Delivery>, SmtpStatus> {
        Ok(Box::new(RecordingDelivery {
            inner: self.inner.clone(),
            meta: meta.clone(),
            mail_from: mail_from.to_string(),
            rcpts: Vec::new(),
            content: None,
        }))
    }
}

struct RecordingDelivery {
    inner: Arc<RecordingInner>,
    meta: MessageMeta,
    mail_from: String,
    rcpts: Vec<String>,
    content: Option<(Header, Vec<u8>)>,
}

#[async_trait]
impl Delivery for RecordingDelivery {
    async fn add_rcpt(&mut self, rcpt: &str) -> Result<(), SmtpStatus> {
        self.rcpts.push(rcpt.to_string());
        Ok(())
    }

    async fn body(&mut self, header: &Header, body: &dyn BodyBuffer) -> Result<(), SmtpStatus> {
        if let Some(status) = self.inner.body_error.lock().unwrap().clone() {
            return Err(status);
        }
        self.content = Some((header.clone(), read_to_vec(body).unwrap()));
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), SmtpStatus> {
        let (header, body) = self.content.take().expect("commit without body");
        self.inner
            .committed
            .lock()
            .unwrap()
            .push(Arc::new(CommittedMessage {
                mail_from: self.mail_from.clone(),
                rcpts: std::mem::take(&mut self.rcpts),
                header,
                body,
                quarantine: self.meta.quarantine.get(),
            }));
        Ok(())
    }

    async fn abort(&mut self) -> Result<(), SmtpStatus> {
        self.inner.aborted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct ScriptedInner {
    attempts: AtomicUsize,
    /// attempt number (1-based) -> rcpt -> outcome; unscripted means
    /// success, the key `*` covers every recipient of the attempt.
    script: Mutex<HashMap<usize, HashMap<String, Result<(), SmtpStatus>>>>,
    commits: Mutex<Vec<Vec<String>>>,
}

/// Target with per-attempt, per-recipient scripted outcomes, reporting
/// through the status collector like the remote client does.
#[derive(Default)]
pub(crate) struct ScriptedTarget {
    inner: Arc<ScriptedInner>,
}

impl ScriptedTarget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_rcpt_status(&self, attempt: usize, rcpt: &str, result: Result<(), SmtpStatus>) {
        self.inner
            .script
            .lock()
            .unwrap()
            .entry(attempt)
            .or_default()
            .insert(rcpt.to_string(), result);
    }

    /// Script every recipient of `attempt` to fail with a 4xx.
    pub fn fail_attempt_temporarily(&self, attempt: usize) {
        self.set_rcpt_status(
            attempt,
            "*",
            Err(SmtpStatus::defer("try again later").with_reason("scripted")),
        );
    }

    /// Recipient lists of every commit, in order.
    pub fn commits(&self) -> Vec<Vec<String>> {
        self.inner.commits.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeliveryTarget for ScriptedTarget {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn start(
        &self,
        _meta: &MessageMeta,
        _mail_from: &str,
    ) -> Result<Box<dyn Delivery>, SmtpStatus> {
        let attempt = self.inner.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Box::new(ScriptedDelivery {
            inner: self.inner.clone(),
            attempt,
            rcpts: Vec::new(),
        }))
    }
}

struct ScriptedDelivery {
    inner: Arc<ScriptedInner>,
    attempt: usize,
    rcpts: Vec<String>,
}

impl ScriptedDelivery {
    fn outcome_for(&self, rcpt: &str) -> Result<(), SmtpStatus> {
        let script = self.inner.script.lock().unwrap();
        let Some(attempt) = script.get(&self.attempt) else {
            return Ok(());
        };
        attempt
            .get(rcpt)
            .or_else(|| attempt.get("*"))
            .cloned()
            .unwrap_or(Ok(()))
    }
}

#[async_trait]
impl Delivery for ScriptedDelivery {
    async fn add_rcpt(&mut self, rcpt: &str) -> Result<(), SmtpStatus> {
        self.rcpts.push(rcpt.to_string());
        Ok(())
    }

    async fn body(&mut self, _header: &Header, _body: &dyn BodyBuffer) -> Result<(), SmtpStatus> {
        for rcpt in &self.rcpts {
            self.outcome_for(rcpt)?;
        }
        Ok(())
    }

    fn status_collection(&self) -> bool {
        true
    }

    async fn body_non_atomic(
        &mut self,
        collector: &mut dyn StatusCollector,
        _header: &Header,
        _body: &dyn BodyBuffer,
    ) {
        for rcpt in &self.rcpts {
            collector.set_status(rcpt, self.outcome_for(rcpt));
        }
    }

    async fn commit(&mut self) -> Result<(), SmtpStatus> {
        self.inner
            .commits
            .lock()
            .unwrap()
            .push(std::mem::take(&mut self.rcpts));
        Ok(())
    }

    async fn abort(&mut self) -> Result<(), SmtpStatus> {
        Ok(())
    }
}

/// Status collector keeping everything it is told.
#[derive(Default)]
pub(crate) struct CollectAll {
    pub results: HashMap<String, Result<(), SmtpStatus>>,
}

impl StatusCollector for CollectAll {
    fn set_status(&mut self, rcpt: &str, result: Result<(), SmtpStatus>) {
        self.results.insert(rcpt.to_string(), result);
    }

    fn set_remaining(&mut self, result: Result<(), SmtpStatus>) {
        self.results.insert("*".to_string(), result);
    }
}

/// Drive a target through one complete delivery the way an ingress
/// endpoint would: start, every recipient, body, then commit (or abort on
/// the first error).
pub(crate) async fn deliver(
    target: &dyn DeliveryTarget,
    meta: &MessageMeta,
    mail_from: &str,
    rcpts: &[&str],
    raw: &[u8],
) -> Result<(), SmtpStatus> {
    let (header, body) = split_message(raw);
    let body = MemoryBuffer::new(body);

    let mut delivery = target.start(meta, mail_from).await?;
    let steps = async {
        for rcpt in rcpts {
            delivery.add_rcpt(rcpt).await?;
        }
        delivery.body(&header, &body).await
    }
    .await;
    match steps {
        Ok(()) => delivery.commit().await,
        Err(status) => {
            let _ = delivery.abort().await;
            Err(status)
        }
    }
}

/// Split a raw message into its header block and body.
pub(crate) fn split_message(raw: &[u8]) -> (Header, Vec<u8>) {
    if let Some(body) = raw.strip_prefix(b"\r\n") {
        return (Header::new(), body.to_vec());
    }
    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|at| at + 4)
        .unwrap_or(raw.len());
    let header = Header::parse(&raw[..split]).expect("test message header");
    (header, raw[split..].to_vec())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn split_message_finds_the_seam() {
        let (header, body) = split_message(b"Subject: x\r\n\r\nbody");
        assert_eq!(header.first("Subject").unwrap(), "x");
        assert_eq!(body, b"body");

        let (header, body) = split_message(b"\r\nonly body");
        assert!(header.is_empty());
        assert_eq!(body, b"only body");
    }
}
