//! Durable retry queue.
//!
//! The queue is a [`DeliveryTarget`] wrapping another target. `commit`
//! persists the message to disk and returns; delivery then happens
//! asynchronously, with temporary per-recipient failures retried on an
//! exponential schedule until every recipient is delivered or failed
//! permanently, or the attempt budget runs out. Finalization with permanent
//! failures produces a bounce message for the original sender.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bounce;
use crate::buffer::{BodyBuffer, FileBuffer, MemoryBuffer, read_to_vec};
use crate::header::Header;
use crate::message::{MessageId, MessageMeta};
use crate::status::SmtpStatus;
use crate::target::{Delivery, DeliveryTarget, StatusCollector};

mod entry;
mod wheel;

pub use entry::{EntryMeta, FailedRcpt, StorageError};

use entry::QueueStorage;
use wheel::TimeWheel;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Directory holding the `<id>.{meta,header,body}` triples.
    pub location: PathBuf,
    /// Attempt budget, the first attempt included.
    pub max_tries: u32,
    /// Delay before the first retry; retry *k* waits `initial_retry_time *
    /// retry_time_scale^(k-1)` after the failed attempt.
    pub initial_retry_time: Duration,
    pub retry_time_scale: f64,
    /// Grace period after startup before recovered entries may run.
    pub post_init_delay: Duration,
    pub workers: usize,
    /// Hard deadline per delivery attempt; expiry counts as a temporary
    /// failure for every pending recipient.
    pub attempt_timeout: Duration,
    /// Our hostname, used as the reporting MTA of bounce messages.
    pub hostname: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            location: PathBuf::from("queue"),
            max_tries: 20,
            initial_retry_time: Duration::from_secs(15 * 60),
            retry_time_scale: 2.0,
            post_init_delay: Duration::from_secs(5),
            workers: 4,
            attempt_timeout: Duration::from_secs(15 * 60),
            hostname: "localhost".to_string(),
        }
    }
}

impl QueueConfig {
    pub fn new(location: impl Into<PathBuf>) -> Self {
        Self {
            location: location.into(),
            ..Default::default()
        }
    }
}

/// Retry delays stop growing here, so a misconfigured scale cannot push
/// entries beyond any reasonable horizon.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(14 * 24 * 60 * 60);

pub struct Queue {
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct Shared {
    cfg: QueueConfig,
    storage: QueueStorage,
    target: Arc<dyn DeliveryTarget>,
    bounce_target: Option<Arc<dyn DeliveryTarget>>,
    wheel: TimeWheel,
    /// In-memory entry table; the per-entry lock single-flights attempts.
    entries: Mutex<HashMap<MessageId, Arc<QueueEntry>>>,
    shutdown: CancellationToken,
}

struct QueueEntry {
    state: tokio::sync::Mutex<EntryState>,
}

struct EntryState {
    /// Attempts completed in or before this process. Starts at the persisted
    /// try count for recovered entries and at zero for fresh ones.
    attempts_done: u32,
}

impl Queue {
    /// Open (or create) the queue directory, recover persisted entries and
    /// start the worker pool. Cancelling `shutdown` stops the workers;
    /// [`Queue::close`] does that and also waits for them.
    pub async fn open(
        cfg: QueueConfig,
        target: Arc<dyn DeliveryTarget>,
        bounce_target: Option<Arc<dyn DeliveryTarget>>,
        shutdown: CancellationToken,
    ) -> Result<Self, StorageError> {
        tokio::fs::create_dir_all(&cfg.location).await?;
        let storage = QueueStorage::new(&cfg.location);
        let recovered = storage.scan().await?;

        let shared = Arc::new(Shared {
            storage,
            target,
            bounce_target,
            wheel: TimeWheel::new(),
            entries: Mutex::new(HashMap::new()),
            shutdown,
            cfg,
        });

        let now = Utc::now();
        for (id, meta) in recovered {
            let next = shared.recovery_schedule(&meta, now);
            info!(
                message_id = %id,
                tries = meta.tries,
                pending = meta.recipients.len(),
                next_attempt = %next,
                "recovered queued message"
            );
            shared.entries.lock().expect("queue lock poisoned").insert(
                id.clone(),
                Arc::new(QueueEntry {
                    state: tokio::sync::Mutex::new(EntryState {
                        attempts_done: meta.tries,
                    }),
                }),
            );
            shared.wheel.insert(next, id);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let mut tasks = vec![tokio::spawn(pump(shared.clone(), tx))];
        for _ in 0..shared.cfg.workers.max(1) {
            tasks.push(tokio::spawn(worker(shared.clone(), rx.clone())));
        }

        Ok(Self {
            shared,
            tasks: Mutex::new(tasks),
        })
    }

    /// Stop scheduling, let workers drain their current attempt and block
    /// until everything has exited. Entries stay on disk for the next open.
    pub async fn close(&self) {
        self.shared.shutdown.cancel();
        self.shared.wheel.close();
        let tasks = std::mem::take(&mut *self.tasks.lock().expect("queue lock poisoned"));
        for task in tasks {
            let _ = task.await;
        }
        debug!("queue shut down");
    }
}

async fn pump(shared: Arc<Shared>, tx: mpsc::UnboundedSender<MessageId>) {
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => return,
            id = shared.wheel.next() => match id {
                Some(id) => {
                    if tx.send(id).is_err() {
                        return;
                    }
                }
                None => return,
            },
        }
    }
}

async fn worker(shared: Arc<Shared>, rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<MessageId>>>) {
    loop {
        let id = {
            let mut rx = rx.lock().await;
            tokio::select! {
                _ = shared.shutdown.cancelled() => return,
                id = rx.recv() => match id {
                    Some(id) => id,
                    None => return,
                },
            }
        };
        shared.attempt(id).await;
    }
}

/// Per-recipient outcome of one delivery attempt.
#[derive(Default)]
struct AttemptOutcome {
    delivered: Vec<String>,
    temporary: Vec<(String, SmtpStatus)>,
    permanent: Vec<(String, SmtpStatus)>,
}

impl AttemptOutcome {
    fn all(rcpts: &[String], status: SmtpStatus) -> Self {
        let mut outcome = Self::default();
        outcome.spread(rcpts.to_vec(), status);
        outcome
    }

    /// Apply one status to a set of recipients, classified by kind.
    fn spread(&mut self, rcpts: Vec<String>, status: SmtpStatus) {
        let list = if status.is_permanent() {
            &mut self.permanent
        } else {
            &mut self.temporary
        };
        list.extend(rcpts.into_iter().map(|r| (r, status.clone())));
    }
}

/// Collector handed to targets that report per-recipient outcomes.
struct RcptStatuses {
    statuses: Vec<(String, Option<Result<(), SmtpStatus>>)>,
}

impl RcptStatuses {
    fn new(rcpts: Vec<String>) -> Self {
        Self {
            statuses: rcpts.into_iter().map(|r| (r, None)).collect(),
        }
    }

    /// A failed target commit voids apparent successes.
    fn demote_successes(&mut self, status: &SmtpStatus) {
        for (_, slot) in &mut self.statuses {
            if matches!(slot, Some(Ok(()))) {
                *slot = Some(Err(status.clone()));
            }
        }
    }

    fn into_results(self) -> Vec<(String, Result<(), SmtpStatus>)> {
        self.statuses
            .into_iter()
            .map(|(rcpt, slot)| {
                let result = slot.unwrap_or_else(|| {
                    Err(SmtpStatus::defer("target reported no delivery status")
                        .with_reason("queue"))
                });
                (rcpt, result)
            })
            .collect()
    }
}

impl StatusCollector for RcptStatuses {
    fn set_status(&mut self, rcpt: &str, result: Result<(), SmtpStatus>) {
        if let Some((_, slot)) = self
            .statuses
            .iter_mut()
            .find(|(r, slot)| r.as_str() == rcpt && slot.is_none())
        {
            *slot = Some(result);
        }
    }

    fn set_remaining(&mut self, result: Result<(), SmtpStatus>) {
        for (_, slot) in &mut self.statuses {
            if slot.is_none() {
                *slot = Some(result.clone());
            }
        }
    }
}

impl Shared {
    fn retry_delay(&self, tries: u32) -> TimeDelta {
        let secs = self.cfg.initial_retry_time.as_secs_f64()
            * self.cfg.retry_time_scale.powi(tries.saturating_sub(1) as i32);
        let capped = Duration::from_secs_f64(secs.min(MAX_RETRY_DELAY.as_secs_f64()));
        TimeDelta::from_std(capped).unwrap_or_else(|_| TimeDelta::days(14))
    }

    /// Where a recovered entry resumes on the schedule it crashed out of.
    fn recovery_schedule(&self, meta: &EntryMeta, now: DateTime<Utc>) -> DateTime<Utc> {
        let earliest = now + TimeDelta::from_std(self.cfg.post_init_delay).unwrap_or_default();
        earliest.max(meta.last_attempt + self.retry_delay(meta.tries))
    }

    async fn attempt(&self, id: MessageId) {
        let queue_entry = {
            self.entries
                .lock()
                .expect("queue lock poisoned")
                .get(&id)
                .cloned()
        };
        let Some(queue_entry) = queue_entry else {
            warn!(message_id = %id, "due entry is no longer tracked, skipping");
            return;
        };
        let mut state = queue_entry.state.lock().await;

        let (mut meta, header) = match self.load_entry(&id).await {
            Ok(loaded) => loaded,
            Err(e) => {
                // temporary local failure, keep the files and try again later
                error!(message_id = %id, error = %e, "cannot load queue entry");
                let next = Utc::now() + self.retry_delay(state.attempts_done.max(1));
                self.wheel.insert(next, id);
                return;
            }
        };
        let body = self.storage.body_buffer(&id);

        debug!(
            message_id = %id,
            attempt = state.attempts_done + 1,
            pending = meta.recipients.len(),
            "attempting delivery"
        );

        let outcome = match tokio::time::timeout(
            self.cfg.attempt_timeout,
            self.deliver_once(&meta, &header, &body),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(message_id = %id, "delivery attempt timed out");
                AttemptOutcome::all(
                    &meta.recipients,
                    SmtpStatus::defer("delivery attempt timed out").with_reason("queue-timeout"),
                )
            }
        };

        state.attempts_done = state.attempts_done.saturating_add(1);
        meta.last_attempt = Utc::now();
        meta.tries = state.attempts_done.max(meta.tries).min(self.cfg.max_tries);

        for rcpt in &outcome.delivered {
            info!(message_id = %id, %rcpt, "delivered");
        }
        for (rcpt, status) in outcome.permanent {
            warn!(message_id = %id, %rcpt, %status, "recipient failed permanently");
            meta.failed.push(FailedRcpt { rcpt, status });
        }
        meta.recipients = outcome.temporary.iter().map(|(r, _)| r.clone()).collect();

        let exhausted = state.attempts_done >= self.cfg.max_tries;
        if exhausted && !meta.recipients.is_empty() {
            info!(message_id = %id, tries = state.attempts_done, "attempt budget exhausted");
            for (rcpt, status) in outcome.temporary {
                meta.failed.push(FailedRcpt { rcpt, status });
            }
            meta.recipients.clear();
        }

        if meta.recipients.is_empty() {
            drop(state);
            self.finalize(&id, &meta).await;
        } else {
            let next = meta.last_attempt + self.retry_delay(meta.tries);
            if let Err(e) = self.storage.update_meta(&id, &meta).await {
                // the previous meta survives the failed rename; after a
                // reload the entry just retries once more
                error!(message_id = %id, error = %e, "failed to update queue metadata");
            }
            info!(
                message_id = %id,
                pending = meta.recipients.len(),
                next_attempt = %next,
                "delivery incomplete, retry scheduled"
            );
            self.wheel.insert(next, id);
        }
    }

    async fn load_entry(&self, id: &MessageId) -> Result<(EntryMeta, Header), StorageError> {
        let meta = self.storage.read_meta(id).await?;
        let header = self.storage.read_header(id).await?;
        Ok((meta, header))
    }

    /// Replay the three-phase delivery against the wrapped target and
    /// classify every pending recipient.
    async fn deliver_once(
        &self,
        meta: &EntryMeta,
        header: &Header,
        body: &FileBuffer,
    ) -> AttemptOutcome {
        let mut outcome = AttemptOutcome::default();

        let mut delivery = match self.target.start(&meta.meta, &meta.mail_from).await {
            Ok(delivery) => delivery,
            Err(status) => return AttemptOutcome::all(&meta.recipients, status),
        };

        let mut attempted = Vec::new();
        for rcpt in &meta.recipients {
            match delivery.add_rcpt(rcpt).await {
                Ok(()) => attempted.push(rcpt.clone()),
                Err(status) => outcome.spread(vec![rcpt.clone()], status),
            }
        }
        if attempted.is_empty() {
            let _ = delivery.abort().await;
            return outcome;
        }

        if delivery.status_collection() {
            let mut collector = RcptStatuses::new(attempted);
            delivery.body_non_atomic(&mut collector, header, body).await;
            if let Err(status) = delivery.commit().await {
                collector.demote_successes(&status);
            }
            for (rcpt, result) in collector.into_results() {
                match result {
                    Ok(()) => outcome.delivered.push(rcpt),
                    Err(status) => outcome.spread(vec![rcpt], status),
                }
            }
        } else {
            match delivery.body(header, body).await {
                Ok(()) => match delivery.commit().await {
                    Ok(()) => outcome.delivered.extend(attempted),
                    Err(status) => outcome.spread(attempted, status),
                },
                Err(status) => {
                    let _ = delivery.abort().await;
                    outcome.spread(attempted, status);
                }
            }
        }
        outcome
    }

    /// Remove the entry, emitting a bounce first when recipients failed for
    /// good. Bounce submission is best-effort.
    async fn finalize(&self, id: &MessageId, meta: &EntryMeta) {
        if !meta.failed.is_empty() {
            self.emit_bounce(id, meta).await;
        }
        if let Err(e) = self.storage.remove_entry(id).await {
            error!(message_id = %id, error = %e, "failed to remove queue entry");
        }
        self.entries
            .lock()
            .expect("queue lock poisoned")
            .remove(id);
        info!(
            message_id = %id,
            failed = meta.failed.len(),
            "queue entry finalized"
        );
    }

    async fn emit_bounce(&self, id: &MessageId, meta: &EntryMeta) {
        if meta.mail_from.is_empty() {
            // never bounce a bounce
            warn!(message_id = %id, "dropping failure notification for null sender");
            return;
        }
        let Some(target) = &self.bounce_target else {
            warn!(message_id = %id, "no bounce target configured, dropping failure notification");
            return;
        };

        let original_header = match self.storage.read_header(id).await {
            Ok(header) => header,
            Err(e) => {
                error!(message_id = %id, error = %e, "cannot read original header for bounce");
                Header::new()
            }
        };
        let dsn = bounce::generate_dsn(&self.cfg.hostname, meta, &original_header);

        let mut bounce_meta = MessageMeta::new("internal", self.cfg.hostname.as_str());
        bounce_meta.dont_trace_sender = true;

        let result = async {
            let mut delivery = target.start(&bounce_meta, "").await?;
            if let Err(status) = delivery.add_rcpt(&meta.mail_from).await {
                let _ = delivery.abort().await;
                return Err(status);
            }
            let body = MemoryBuffer::new(dsn.body);
            if let Err(status) = delivery.body(&dsn.header, &body).await {
                let _ = delivery.abort().await;
                return Err(status);
            }
            delivery.commit().await
        }
        .await;

        match result {
            Ok(()) => info!(message_id = %id, bounce_id = %bounce_meta.id, "bounce message submitted"),
            Err(status) => {
                error!(message_id = %id, %status, "failed to submit bounce message");
            }
        }
    }
}

#[async_trait]
impl DeliveryTarget for Queue {
    fn name(&self) -> &str {
        "queue"
    }

    async fn start(
        &self,
        meta: &MessageMeta,
        mail_from: &str,
    ) -> Result<Box<dyn Delivery>, SmtpStatus> {
        Ok(Box::new(QueueDelivery {
            shared: self.shared.clone(),
            meta: meta.clone(),
            mail_from: mail_from.to_string(),
            rcpts: Vec::new(),
            content: None,
        }))
    }
}

struct QueueDelivery {
    shared: Arc<Shared>,
    meta: MessageMeta,
    mail_from: String,
    rcpts: Vec<String>,
    content: Option<(Header, Vec<u8>)>,
}

#[async_trait]
impl Delivery for QueueDelivery {
    async fn add_rcpt(&mut self, rcpt: &str) -> Result<(), SmtpStatus> {
        self.rcpts.push(rcpt.to_string());
        Ok(())
    }

    async fn body(&mut self, header: &Header, body: &dyn BodyBuffer) -> Result<(), SmtpStatus> {
        // the caller's buffer is only valid for this call, so rebuffer now
        let data = read_to_vec(body).map_err(SmtpStatus::from)?;
        self.content = Some((header.clone(), data));
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), SmtpStatus> {
        if self.rcpts.is_empty() {
            debug!(message_id = %self.meta.id, "no recipients queued, nothing to do");
            return Ok(());
        }
        let (header, data) = self
            .content
            .take()
            .ok_or_else(|| SmtpStatus::local_failure("message has no content").with_reason("queue"))?;

        let now = Utc::now();
        let entry_meta = EntryMeta {
            meta: self.meta.clone(),
            mail_from: self.mail_from.clone(),
            recipients: std::mem::take(&mut self.rcpts),
            failed: Vec::new(),
            tries: 1,
            queued_at: now,
            last_attempt: now,
        };
        let body = MemoryBuffer::new(data);
        self.shared
            .storage
            .write_entry(&self.meta.id, &entry_meta, &header, &body)
            .await
            .map_err(|e| {
                error!(message_id = %self.meta.id, error = %e, "failed to persist queue entry");
                SmtpStatus::local_failure("failed to persist message").with_reason("queue")
            })?;

        self.shared
            .entries
            .lock()
            .expect("queue lock poisoned")
            .insert(
                self.meta.id.clone(),
                Arc::new(QueueEntry {
                    state: tokio::sync::Mutex::new(EntryState { attempts_done: 0 }),
                }),
            );
        // first attempt runs as soon as a worker is free
        self.shared.wheel.insert(now, self.meta.id.clone());
        debug!(message_id = %self.meta.id, "message queued");
        Ok(())
    }

    async fn abort(&mut self) -> Result<(), SmtpStatus> {
        self.content = None;
        self.rcpts.clear();
        Ok(())
    }
}
