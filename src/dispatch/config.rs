use std::sync::Arc;
use thiserror::Error;

use crate::address::{AddressError, AddressTable};
use crate::check::CheckGroup;
use crate::modify::ModifierChain;
use crate::status::SmtpStatus;
use crate::target::DeliveryTarget;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Address(#[from] AddressError),
    #[error("reject replies must use a 4xx or 5xx code, got {0}")]
    RejectCode(u16),
    #[error("no default source block configured")]
    NoDefaultSource,
}

/// Routing rules for recipients matched to one block: which checks and
/// rewrites apply and which targets receive the message. A block may instead
/// carry a fixed reject reply.
pub struct RcptBlock {
    pub(crate) checks: CheckGroup,
    pub(crate) reject: Option<SmtpStatus>,
    pub(crate) targets: Vec<Arc<dyn DeliveryTarget>>,
    pub(crate) modifiers: ModifierChain,
}

impl RcptBlock {
    pub fn deliver_to(targets: Vec<Arc<dyn DeliveryTarget>>) -> Self {
        Self {
            checks: CheckGroup::default(),
            reject: None,
            targets,
            modifiers: ModifierChain::default(),
        }
    }

    pub fn reject(status: SmtpStatus) -> Result<Self, ConfigError> {
        if !SmtpStatus::is_valid_reject_code(status.code) {
            return Err(ConfigError::RejectCode(status.code));
        }
        Ok(Self {
            checks: CheckGroup::default(),
            reject: Some(status),
            targets: Vec::new(),
            modifiers: ModifierChain::default(),
        })
    }

    pub fn with_checks(mut self, checks: CheckGroup) -> Self {
        self.checks = checks;
        self
    }

    pub fn with_modifiers(mut self, modifiers: ModifierChain) -> Self {
        self.modifiers = modifiers;
        self
    }
}

/// Rules applied to messages from one sender (or sender domain): source
/// checks and rewrites plus the per-recipient routing table.
pub struct SourceBlock {
    pub(crate) checks: CheckGroup,
    pub(crate) reject: Option<SmtpStatus>,
    pub(crate) rcpts: AddressTable<Arc<RcptBlock>>,
    pub(crate) modifiers: ModifierChain,
}

impl SourceBlock {
    /// A source block routing every recipient through one block.
    pub fn route_all(block: RcptBlock) -> Self {
        let mut rcpts = AddressTable::new();
        rcpts.set_default(Arc::new(block));
        Self {
            checks: CheckGroup::default(),
            reject: None,
            rcpts,
            modifiers: ModifierChain::default(),
        }
    }

    pub fn reject(status: SmtpStatus) -> Result<Self, ConfigError> {
        if !SmtpStatus::is_valid_reject_code(status.code) {
            return Err(ConfigError::RejectCode(status.code));
        }
        Ok(Self {
            checks: CheckGroup::default(),
            reject: Some(status),
            rcpts: AddressTable::new(),
            modifiers: ModifierChain::default(),
        })
    }

    /// Route recipients matching `key` (an address or a domain) through
    /// `block`; more specific rules win at lookup time.
    pub fn with_rcpt_rule(mut self, key: &str, block: RcptBlock) -> Result<Self, ConfigError> {
        self.rcpts.insert(key, Arc::new(block))?;
        Ok(self)
    }

    pub fn with_default_rcpt(mut self, block: RcptBlock) -> Self {
        self.rcpts.set_default(Arc::new(block));
        self
    }

    pub fn with_checks(mut self, checks: CheckGroup) -> Self {
        self.checks = checks;
        self
    }

    pub fn with_modifiers(mut self, modifiers: ModifierChain) -> Self {
        self.modifiers = modifiers;
        self
    }
}

/// Complete pipeline configuration. Built once at startup, immutable
/// afterwards; `validate` is called by [`super::Dispatcher::new`].
pub struct DispatchConfig {
    /// Our hostname: the authserv-id of generated Authentication-Results
    /// fields.
    pub(crate) hostname: String,
    pub(crate) checks: CheckGroup,
    pub(crate) sources: AddressTable<Arc<SourceBlock>>,
    pub(crate) reject_score: Option<i32>,
    pub(crate) quarantine_score: Option<i32>,
}

impl DispatchConfig {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            checks: CheckGroup::default(),
            sources: AddressTable::new(),
            reject_score: None,
            quarantine_score: None,
        }
    }

    pub fn with_checks(mut self, checks: CheckGroup) -> Self {
        self.checks = checks;
        self
    }

    pub fn with_source_rule(mut self, key: &str, block: SourceBlock) -> Result<Self, ConfigError> {
        self.sources.insert(key, Arc::new(block))?;
        Ok(self)
    }

    pub fn with_default_source(mut self, block: SourceBlock) -> Self {
        self.sources.set_default(Arc::new(block));
        self
    }

    pub fn with_reject_score(mut self, score: i32) -> Self {
        self.reject_score = Some(score);
        self
    }

    pub fn with_quarantine_score(mut self, score: i32) -> Self {
        self.quarantine_score = Some(score);
        self
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if !self.sources.has_default() {
            return Err(ConfigError::NoDefaultSource);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reject_blocks_validate_the_code_range() {
        assert!(RcptBlock::reject(SmtpStatus::new(550, [5, 7, 1], "no")).is_ok());
        assert!(matches!(
            RcptBlock::reject(SmtpStatus::new(250, [2, 0, 0], "yes")),
            Err(ConfigError::RejectCode(250))
        ));
        assert!(matches!(
            SourceBlock::reject(SmtpStatus::new(354, [3, 0, 0], "go on")),
            Err(ConfigError::RejectCode(354))
        ));
    }

    #[test]
    fn config_requires_a_default_source() {
        let config = DispatchConfig::new("mx.example.net");
        assert!(matches!(config.validate(), Err(ConfigError::NoDefaultSource)));

        let config = config.with_default_source(SourceBlock::route_all(RcptBlock::deliver_to(vec![])));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn source_rules_reject_bad_conditions() {
        let block = || SourceBlock::route_all(RcptBlock::deliver_to(vec![]));
        let config = DispatchConfig::new("mx.example.net");
        assert!(config.with_source_rule("", block()).is_err());

        let config = DispatchConfig::new("mx.example.net");
        assert!(config.with_source_rule("user@", block()).is_err());

        let config = DispatchConfig::new("mx.example.net");
        assert!(config.with_source_rule("example.org", block()).is_ok());
    }
}
