//! Per-message dispatch pipeline.
//!
//! For every accepted message the dispatcher composes the configured checks,
//! modifiers and delivery targets into one three-phase delivery: global
//! checks, source selection, per-recipient routing with target fan-out, body
//! checks and modification, then commit-or-abort across every opened target.
//! The dispatcher itself implements [`DeliveryTarget`], so a pipeline can be
//! a target of another pipeline.

use async_trait::async_trait;
use futures::future::join_all;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

use crate::authres;
use crate::buffer::BodyBuffer;
use crate::check::{CheckGroupState, CheckResult};
use crate::header::Header;
use crate::message::MessageMeta;
use crate::modify::ModifierChainState;
use crate::status::SmtpStatus;
use crate::target::{Delivery, DeliveryTarget, StatusCollector};

mod config;

pub use config::{ConfigError, DispatchConfig, RcptBlock, SourceBlock};

pub struct Dispatcher {
    cfg: Arc<DispatchConfig>,
}

impl Dispatcher {
    pub fn new(cfg: DispatchConfig) -> Result<Self, ConfigError> {
        cfg.validate()?;
        Ok(Self { cfg: Arc::new(cfg) })
    }
}

#[async_trait]
impl DeliveryTarget for Dispatcher {
    fn name(&self) -> &str {
        "dispatch"
    }

    async fn start(
        &self,
        meta: &MessageMeta,
        mail_from: &str,
    ) -> Result<Box<dyn Delivery>, SmtpStatus> {
        let mut delivery = DispatchDelivery {
            cfg: self.cfg.clone(),
            meta: meta.clone(),
            original_from: mail_from.to_string(),
            mail_from: mail_from.to_string(),
            score: 0,
            auth_results: Vec::new(),
            header_adds: Header::new(),
            global: self.cfg.checks.open(meta),
            source: None,
            rcpt_states: Vec::new(),
            deliveries: Vec::new(),
        };
        match delivery.run_start().await {
            Ok(()) => Ok(Box::new(delivery)),
            Err(status) => {
                debug!(message_id = %meta.id, %status, "message rejected at start");
                delivery.shutdown_states().await;
                Err(status)
            }
        }
    }
}

struct SourceState {
    block: Arc<SourceBlock>,
    checks: CheckGroupState,
    modifiers: ModifierChainState,
}

struct RcptState {
    block: Arc<RcptBlock>,
    checks: CheckGroupState,
    modifiers: ModifierChainState,
}

struct TargetDelivery {
    target: Arc<dyn DeliveryTarget>,
    delivery: Box<dyn Delivery>,
    /// Recipients this target accepted, used for per-target deduplication.
    rcpts: Vec<String>,
    /// Body-stage failure, scoped to this target's recipients. A failed
    /// target is aborted at commit time while the others still commit.
    failed: Option<SmtpStatus>,
}

struct DispatchDelivery {
    cfg: Arc<DispatchConfig>,
    meta: MessageMeta,
    /// MAIL FROM as received, used for rule matching.
    original_from: String,
    /// MAIL FROM after source modifiers, used for delivery.
    mail_from: String,
    /// Policy score accumulated across all stages of all checks.
    score: i32,
    auth_results: Vec<crate::authres::AuthResult>,
    /// Check-produced fields, prepended to the outgoing header at body time.
    header_adds: Header,
    global: CheckGroupState,
    source: Option<SourceState>,
    /// One entry per distinct recipient block touched by this message.
    rcpt_states: Vec<RcptState>,
    /// One entry per distinct target touched by this message.
    deliveries: Vec<TargetDelivery>,
}

impl DispatchDelivery {
    /// Fold one merged stage result into the per-message totals; a reject
    /// short-circuits the current stage.
    fn absorb(&mut self, result: CheckResult) -> Result<(), SmtpStatus> {
        self.score += result.score_adjust;
        if result.quarantine {
            self.meta.quarantine.set(true);
        }
        self.auth_results.extend(result.auth_results);
        self.header_adds.append_all(&result.header);
        match result.reject {
            Some(status) => Err(status),
            None => Ok(()),
        }
    }

    async fn run_start(&mut self) -> Result<(), SmtpStatus> {
        let from = self.original_from.clone();

        let result = self.global.connection().await;
        self.absorb(result)?;
        let result = self.global.sender(&from).await;
        self.absorb(result)?;

        let block = self
            .cfg
            .sources
            .lookup(&from)
            .cloned()
            .ok_or_else(|| SmtpStatus::local_failure("no source rule matched").with_reason("dispatch"))?;
        if let Some(reject) = &block.reject {
            return Err(reject.clone());
        }

        self.source = Some(SourceState {
            checks: block.checks.open(&self.meta),
            modifiers: block.modifiers.open(&self.meta),
            block,
        });
        let source = self.source.as_mut().expect("just set");
        let result = source.checks.connection().await;
        self.absorb(result)?;
        let result = self
            .source
            .as_mut()
            .expect("just set")
            .checks
            .sender(&from)
            .await;
        self.absorb(result)?;

        self.mail_from = self
            .source
            .as_mut()
            .expect("just set")
            .modifiers
            .rewrite_sender(from)
            .await?;
        trace!(message_id = %self.meta.id, mail_from = %self.mail_from, "sender accepted");
        Ok(())
    }

    /// Index of the state for `block`, creating it (and running its
    /// connection and sender stages) on first use.
    async fn rcpt_state_for(&mut self, block: &Arc<RcptBlock>) -> Result<usize, SmtpStatus> {
        if let Some(i) = self
            .rcpt_states
            .iter()
            .position(|s| Arc::ptr_eq(&s.block, block))
        {
            return Ok(i);
        }
        self.rcpt_states.push(RcptState {
            block: block.clone(),
            checks: block.checks.open(&self.meta),
            modifiers: block.modifiers.open(&self.meta),
        });
        let i = self.rcpt_states.len() - 1;
        let result = self.rcpt_states[i].checks.connection().await;
        self.absorb(result)?;
        let from = self.mail_from.clone();
        let result = self.rcpt_states[i].checks.sender(&from).await;
        self.absorb(result)?;
        Ok(i)
    }

    /// Index of the delivery for `target`, starting it on first use.
    async fn delivery_for(&mut self, target: &Arc<dyn DeliveryTarget>) -> Result<usize, SmtpStatus> {
        if let Some(i) = self
            .deliveries
            .iter()
            .position(|d| Arc::ptr_eq(&d.target, target))
        {
            return Ok(i);
        }
        let delivery = target.start(&self.meta, &self.mail_from).await?;
        self.deliveries.push(TargetDelivery {
            target: target.clone(),
            delivery,
            rcpts: Vec::new(),
            failed: None,
        });
        Ok(self.deliveries.len() - 1)
    }

    async fn run_add_rcpt(&mut self, rcpt: &str) -> Result<(), SmtpStatus> {
        let source = self.source.as_ref().expect("start ran");
        let block = source.block.rcpts.lookup(rcpt).cloned().ok_or_else(|| {
            SmtpStatus::new(554, [5, 7, 1], "no delivery route for recipient")
                .with_reason("dispatch")
        })?;
        if let Some(reject) = &block.reject {
            return Err(reject.clone());
        }
        if block.targets.is_empty() {
            return Err(SmtpStatus::new(554, [5, 7, 1], "no delivery targets for recipient")
                .with_reason("dispatch"));
        }

        let state = self.rcpt_state_for(&block).await?;
        let result = self.rcpt_states[state].checks.rcpt(rcpt).await;
        self.absorb(result)?;

        let rewritten = self.rcpt_states[state]
            .modifiers
            .rewrite_rcpt(rcpt.to_string())
            .await?;
        if rewritten.is_empty() {
            debug!(message_id = %self.meta.id, rcpt, "recipient dropped by modifiers");
            return Ok(());
        }

        for rcpt in rewritten {
            for target in block.targets.clone() {
                let i = self.delivery_for(&target).await?;
                let td = &mut self.deliveries[i];
                if td.rcpts.iter().any(|r| r == &rcpt) {
                    trace!(message_id = %self.meta.id, %rcpt, "duplicate recipient dropped");
                    continue;
                }
                td.delivery.add_rcpt(&rcpt).await?;
                td.rcpts.push(rcpt.clone());
            }
        }
        Ok(())
    }

    /// Everything of the body stage that concerns the message as a whole:
    /// body checks, score thresholds, header assembly, body modifiers.
    /// Failures here reject the message outright.
    async fn prepare_body(
        &mut self,
        header: &Header,
        body: &dyn BodyBuffer,
    ) -> Result<Header, SmtpStatus> {
        // Body stage of every check state, concurrently across groups.
        let results = {
            let Self {
                global,
                source,
                rcpt_states,
                ..
            } = self;
            let mut stages: Vec<Pin<Box<dyn Future<Output = CheckResult> + Send + '_>>> =
                vec![Box::pin(global.body(header, body))];
            if let Some(source) = source {
                stages.push(Box::pin(source.checks.body(header, body)));
            }
            for state in rcpt_states {
                stages.push(Box::pin(state.checks.body(header, body)));
            }
            join_all(stages).await
        };
        let mut reject = None;
        for result in results {
            if let Err(status) = self.absorb(result)
                && reject.is_none()
            {
                reject = Some(status);
            }
        }
        if let Some(status) = reject {
            return Err(status);
        }

        if let Some(threshold) = self.cfg.reject_score
            && self.score >= threshold
        {
            info!(message_id = %self.meta.id, score = self.score, "rejecting message on score");
            return Err(SmtpStatus::new(550, [5, 7, 1], "message rejected due to policy score")
                .with_reason("score")
                .with_misc("score", self.score.to_string()));
        }
        if let Some(threshold) = self.cfg.quarantine_score
            && self.score >= threshold
        {
            info!(message_id = %self.meta.id, score = self.score, "quarantining message on score");
            self.meta.quarantine.set(true);
        }

        let mut out = header.clone();
        if !self.auth_results.is_empty() {
            out.prepend(
                "Authentication-Results",
                &authres::render(&self.cfg.hostname, &self.auth_results),
            );
        }
        out.prepend_all(&self.header_adds);

        self.source
            .as_mut()
            .expect("start ran")
            .modifiers
            .rewrite_body(&mut out, body)
            .await?;
        Ok(out)
    }

    /// Hand the finished body to every open target. A failure is recorded
    /// against the target it happened on and scoped to that target's
    /// recipients; the other targets are unaffected.
    async fn fan_out_body(&mut self, out: &Header, body: &dyn BodyBuffer) {
        for td in &mut self.deliveries {
            if let Err(status) = td.delivery.body(out, body).await {
                warn!(
                    message_id = %self.meta.id,
                    target = td.target.name(),
                    %status,
                    "target refused the message body"
                );
                td.failed = Some(status);
            }
        }
    }

    /// Per-recipient verdicts after the body fan-out: a recipient fails if
    /// any target it was routed to failed, each recipient reported once.
    fn body_verdicts(&self) -> Vec<(String, Result<(), SmtpStatus>)> {
        let mut verdicts: Vec<(String, Result<(), SmtpStatus>)> = Vec::new();
        for td in &self.deliveries {
            for rcpt in &td.rcpts {
                match verdicts.iter_mut().find(|(r, _)| r.as_str() == rcpt.as_str()) {
                    Some((_, verdict)) => {
                        if verdict.is_ok()
                            && let Some(status) = &td.failed
                        {
                            *verdict = Err(status.clone());
                        }
                    }
                    None => verdicts.push((
                        rcpt.clone(),
                        match &td.failed {
                            Some(status) => Err(status.clone()),
                            None => Ok(()),
                        },
                    )),
                }
            }
        }
        verdicts
    }

    async fn shutdown_states(&mut self) {
        self.global.close().await;
        if let Some(source) = &mut self.source {
            source.checks.close().await;
            source.modifiers.close().await;
        }
        for state in &mut self.rcpt_states {
            state.checks.close().await;
            state.modifiers.close().await;
        }
    }
}

#[async_trait]
impl Delivery for DispatchDelivery {
    async fn add_rcpt(&mut self, rcpt: &str) -> Result<(), SmtpStatus> {
        let result = self.run_add_rcpt(rcpt).await;
        if let Err(status) = &result {
            debug!(message_id = %self.meta.id, rcpt, %status, "recipient rejected");
        }
        result
    }

    async fn body(&mut self, header: &Header, body: &dyn BodyBuffer) -> Result<(), SmtpStatus> {
        let out = self.prepare_body(header, body).await?;
        self.fan_out_body(&out, body).await;
        // a target failure only fails the recipients routed through that
        // target; the message as a whole fails once no target is left
        let failed = self.deliveries.iter().filter_map(|d| d.failed.as_ref());
        if !self.deliveries.is_empty() && failed.clone().count() == self.deliveries.len() {
            return Err(failed.cloned().next().expect("at least one failure"));
        }
        Ok(())
    }

    fn status_collection(&self) -> bool {
        true
    }

    async fn body_non_atomic(
        &mut self,
        collector: &mut dyn StatusCollector,
        header: &Header,
        body: &dyn BodyBuffer,
    ) {
        let out = match self.prepare_body(header, body).await {
            Ok(out) => out,
            Err(status) => {
                collector.set_remaining(Err(status));
                return;
            }
        };
        self.fan_out_body(&out, body).await;
        for (rcpt, verdict) in self.body_verdicts() {
            collector.set_status(&rcpt, verdict);
        }
    }

    async fn commit(&mut self) -> Result<(), SmtpStatus> {
        let mut result = Ok(());
        for td in &mut self.deliveries {
            if let Some(status) = td.failed.clone() {
                debug!(
                    message_id = %self.meta.id,
                    target = td.target.name(),
                    %status,
                    "aborting failed delivery"
                );
                if let Err(status) = td.delivery.abort().await {
                    warn!(
                        message_id = %self.meta.id,
                        target = td.target.name(),
                        %status,
                        "failed to abort delivery"
                    );
                }
                continue;
            }
            if let Err(status) = td.delivery.commit().await {
                // earlier commits are already durable, surface the failure
                result = Err(status);
                break;
            }
        }
        self.shutdown_states().await;
        result
    }

    async fn abort(&mut self) -> Result<(), SmtpStatus> {
        let mut first = None;
        for td in &mut self.deliveries {
            if let Err(status) = td.delivery.abort().await
                && first.is_none()
            {
                first = Some(status);
            }
        }
        self.shutdown_states().await;
        match first {
            Some(status) => Err(status),
            None => Ok(()),
        }
    }
}
