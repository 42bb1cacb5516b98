use async_trait::async_trait;
use std::sync::Arc;

use crate::buffer::BodyBuffer;
use crate::header::Header;
use crate::message::MessageMeta;
use crate::status::SmtpStatus;

/// Factory for per-message modifier state, registered in the pipeline
/// configuration. Modifiers rewrite envelope addresses and header content;
/// unlike checks they run strictly sequentially.
pub trait Modifier: Send + Sync {
    fn name(&self) -> &'static str;

    fn state(&self, meta: &MessageMeta) -> Box<dyn ModifierState>;
}

#[async_trait]
pub trait ModifierState: Send {
    async fn rewrite_sender(&mut self, mail_from: String) -> Result<String, SmtpStatus> {
        Ok(mail_from)
    }

    /// May fan a recipient out into several, or drop it by returning an
    /// empty list.
    async fn rewrite_rcpt(&mut self, rcpt_to: String) -> Result<Vec<String>, SmtpStatus> {
        Ok(vec![rcpt_to])
    }

    async fn rewrite_body(
        &mut self,
        _header: &mut Header,
        _body: &dyn BodyBuffer,
    ) -> Result<(), SmtpStatus> {
        Ok(())
    }

    async fn close(&mut self) {}
}

/// Ordered modifier list: the output of step *i* is the input of step *i+1*.
#[derive(Clone, Default)]
pub struct ModifierChain {
    modifiers: Vec<Arc<dyn Modifier>>,
}

impl ModifierChain {
    pub fn new(modifiers: Vec<Arc<dyn Modifier>>) -> Self {
        Self { modifiers }
    }

    pub fn is_empty(&self) -> bool {
        self.modifiers.is_empty()
    }

    pub fn open(&self, meta: &MessageMeta) -> ModifierChainState {
        ModifierChainState {
            states: self
                .modifiers
                .iter()
                .map(|modifier| modifier.state(meta))
                .collect(),
        }
    }
}

impl std::fmt::Debug for ModifierChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.modifiers.iter().map(|m| m.name()))
            .finish()
    }
}

pub struct ModifierChainState {
    states: Vec<Box<dyn ModifierState>>,
}

impl ModifierChainState {
    pub async fn rewrite_sender(&mut self, mut mail_from: String) -> Result<String, SmtpStatus> {
        for state in &mut self.states {
            mail_from = state.rewrite_sender(mail_from).await?;
        }
        Ok(mail_from)
    }

    /// Sequential composition of the member rewrites; fan-out from an early
    /// member feeds every produced recipient through the later members.
    pub async fn rewrite_rcpt(&mut self, rcpt_to: String) -> Result<Vec<String>, SmtpStatus> {
        let mut current = vec![rcpt_to];
        for state in &mut self.states {
            let mut next = Vec::new();
            for rcpt in current {
                next.extend(state.rewrite_rcpt(rcpt).await?);
            }
            current = next;
            if current.is_empty() {
                break;
            }
        }
        Ok(current)
    }

    pub async fn rewrite_body(
        &mut self,
        header: &mut Header,
        body: &dyn BodyBuffer,
    ) -> Result<(), SmtpStatus> {
        for state in &mut self.states {
            state.rewrite_body(header, body).await?;
        }
        Ok(())
    }

    /// Close every state, also the ones after a failed member.
    pub async fn close(&mut self) {
        for state in &mut self.states {
            state.close().await;
        }
    }
}
