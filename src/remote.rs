//! Remote delivery: resolve MX hosts and hand the message to them over
//! SMTP, reporting per-recipient outcomes faithfully to the caller.

use async_trait::async_trait;
use chrono::Utc;
use mail_send::{SmtpClient, SmtpClientBuilder, smtp};
use std::collections::BTreeMap;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::rustls::{crypto, crypto::CryptoProvider};
use tracing::{debug, info, trace, warn};

use crate::address::split_address;
use crate::buffer::{BodyBuffer, read_to_vec};
use crate::dns::{MxHost, MxResolver, ResolveError};
use crate::header::Header;
use crate::message::MessageMeta;
use crate::status::SmtpStatus;
use crate::target::{Delivery, DeliveryTarget, StatusCollector};

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// Our hostname: EHLO argument and Received-header "by" host.
    pub hostname: String,
    /// Refuse to deliver without a TLS channel; TLS failures become
    /// permanent instead of falling back.
    pub require_tls: bool,
    /// Permit falling back to plaintext when STARTTLS is unavailable.
    /// Ignored when `require_tls` is set.
    pub allow_plaintext: bool,
    pub connect_timeout: Duration,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            require_tls: false,
            allow_plaintext: false,
            connect_timeout: Duration::from_secs(60),
        }
    }
}

pub struct RemoteTarget {
    cfg: Arc<RemoteConfig>,
    resolver: MxResolver,
}

impl RemoteTarget {
    pub fn new(cfg: RemoteConfig, resolver: MxResolver) -> Self {
        if CryptoProvider::get_default().is_none() {
            CryptoProvider::install_default(crypto::aws_lc_rs::default_provider())
                .expect("Failed to install crypto provider");
        }
        Self {
            cfg: Arc::new(cfg),
            resolver,
        }
    }
}

#[async_trait]
impl DeliveryTarget for RemoteTarget {
    fn name(&self) -> &str {
        "remote"
    }

    async fn start(
        &self,
        meta: &MessageMeta,
        mail_from: &str,
    ) -> Result<Box<dyn Delivery>, SmtpStatus> {
        Ok(Box::new(RemoteDelivery {
            cfg: self.cfg.clone(),
            resolver: self.resolver.clone(),
            meta: meta.clone(),
            mail_from: mail_from.to_string(),
            rcpts: Vec::new(),
        }))
    }
}

struct RemoteDelivery {
    cfg: Arc<RemoteConfig>,
    resolver: MxResolver,
    meta: MessageMeta,
    mail_from: String,
    rcpts: Vec<String>,
}

enum SendError {
    Permanent(SmtpStatus),
    Temporary(SmtpStatus),
}

/// Collector adapter for the atomic [`Delivery::body`] entry point: any
/// per-recipient failure fails the whole delivery.
struct AtomicStatuses {
    first_error: Option<SmtpStatus>,
}

impl StatusCollector for AtomicStatuses {
    fn set_status(&mut self, _rcpt: &str, result: Result<(), SmtpStatus>) {
        if let Err(status) = result
            && self.first_error.is_none()
        {
            self.first_error = Some(status);
        }
    }

    fn set_remaining(&mut self, result: Result<(), SmtpStatus>) {
        self.set_status("", result);
    }
}

#[async_trait]
impl Delivery for RemoteDelivery {
    async fn add_rcpt(&mut self, rcpt: &str) -> Result<(), SmtpStatus> {
        // grouping by domain happens at body time, but a recipient we
        // cannot even split is never deliverable
        split_address(rcpt).map_err(|e| {
            SmtpStatus::new(553, [5, 1, 3], format!("invalid recipient address: {e}"))
                .with_reason("remote")
        })?;
        self.rcpts.push(rcpt.to_string());
        Ok(())
    }

    async fn body(&mut self, header: &Header, body: &dyn BodyBuffer) -> Result<(), SmtpStatus> {
        let mut collector = AtomicStatuses { first_error: None };
        self.body_non_atomic(&mut collector, header, body).await;
        match collector.first_error {
            Some(status) => Err(status),
            None => Ok(()),
        }
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
        let data = match self.assemble(header, body) {
            Ok(data) => data,
            Err(status) => {
                collector.set_remaining(Err(status));
                return;
            }
        };

        // one MX resolution per domain, recipients grouped under it
        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for rcpt in &self.rcpts {
            let domain = match split_address(rcpt) {
                Ok((_, domain)) => domain.to_ascii_lowercase(),
                Err(_) => continue, // rejected in add_rcpt already
            };
            groups.entry(domain).or_default().push(rcpt.clone());
        }

        for (domain, rcpts) in groups {
            self.deliver_domain(&domain, &rcpts, &data, collector).await;
        }
    }

    async fn commit(&mut self) -> Result<(), SmtpStatus> {
        // delivery happened at body time, there is nothing to make durable
        Ok(())
    }

    async fn abort(&mut self) -> Result<(), SmtpStatus> {
        Ok(())
    }
}

impl RemoteDelivery {
    /// Serialized message as sent on the wire, with our trace header.
    fn assemble(&self, header: &Header, body: &dyn BodyBuffer) -> Result<Vec<u8>, SmtpStatus> {
        let mut header = header.clone();
        if !self.meta.dont_trace_sender {
            header.prepend("Received", &self.received_field());
        }
        let mut data = header.to_bytes();
        data.extend_from_slice(&read_to_vec(body).map_err(SmtpStatus::from)?);
        Ok(data)
    }

    fn received_field(&self) -> String {
        let from = match &self.meta.source_addr {
            Some(addr) => format!("{} ({addr})", self.meta.source_hostname),
            None => self.meta.source_hostname.clone(),
        };
        format!(
            "from {from}\r\n\tby {} (mailward) with {}{} id {};\r\n\t{}",
            self.cfg.hostname,
            self.meta.source_proto.to_ascii_uppercase(),
            if self.meta.tls { "S" } else { "" },
            self.meta.id,
            Utc::now().to_rfc2822(),
        )
    }

    async fn deliver_domain(
        &self,
        domain: &str,
        rcpts: &[String],
        data: &[u8],
        collector: &mut dyn StatusCollector,
    ) {
        let hosts = match self.resolver.lookup_mx(domain).await {
            Ok(hosts) => hosts,
            Err(ResolveError::NoMailServers) => {
                for rcpt in rcpts {
                    collector.set_status(
                        rcpt,
                        Err(SmtpStatus::new(556, [5, 1, 10], "domain does not accept mail")
                            .with_reason("remote")),
                    );
                }
                return;
            }
            Err(ResolveError::Dns(err)) => {
                debug!(domain, "could not resolve mail domain: {err}");
                for rcpt in rcpts {
                    collector.set_status(
                        rcpt,
                        Err(SmtpStatus::new(451, [4, 4, 3], "mail domain resolution failed")
                            .with_reason("remote")),
                    );
                }
                return;
            }
        };

        for rcpt in rcpts {
            let mut last_temporary = None;
            let mut verdict = None;
            for host in &hosts {
                match self.send_single_upstream(host, rcpt, data).await {
                    Ok(()) => {
                        verdict = Some(Ok(()));
                        break;
                    }
                    Err(SendError::Permanent(status)) => {
                        verdict = Some(Err(status));
                        break;
                    }
                    Err(SendError::Temporary(status)) => {
                        // keep walking the preference list
                        last_temporary = Some(status);
                    }
                }
            }
            let result = verdict.unwrap_or_else(|| {
                info!(domain, %rcpt, "all mail servers exhausted");
                Err(last_temporary.unwrap_or_else(|| {
                    SmtpStatus::defer("no mail server reachable").with_reason("remote")
                }))
            });
            collector.set_status(rcpt, result);
        }
    }

    async fn send_single_upstream(
        &self,
        host: &MxHost,
        rcpt: &str,
        data: &[u8],
    ) -> Result<(), SendError> {
        let builder = || {
            SmtpClientBuilder::new(host.host.as_str(), host.port)
                .implicit_tls(false)
                .helo_host(self.cfg.hostname.as_str())
                .timeout(self.cfg.connect_timeout)
        };

        let message = smtp::message::Message {
            mail_from: self.mail_from.as_str().into(),
            rcpt_to: vec![rcpt.into()],
            body: data.into(),
        };

        let result = match builder().connect().await {
            Ok(mut client) => {
                trace!(host = %host.host, port = host.port, "securely connected to upstream server");
                let result = client.send(message.clone()).await;
                Self::quit_smtp(client, &host.host).await;
                result
            }
            Err(err) if self.cfg.allow_plaintext && !self.cfg.require_tls => {
                debug!(host = %host.host, "TLS unavailable, retrying in plaintext: {err}");
                match builder().connect_plain().await {
                    Err(err) => Err(err),
                    Ok(mut client) => {
                        trace!(host = %host.host, port = host.port, "INSECURELY connected to upstream server");
                        let result = client.send(message).await;
                        Self::quit_smtp(client, &host.host).await;
                        result
                    }
                }
            }
            Err(err) => Err(err),
        };

        let Err(err) = result else {
            debug!(host = %host.host, rcpt, "successfully delivered");
            return Ok(());
        };

        info!(host = %host.host, rcpt, "could not use server: {err}");
        Err(self.classify(err))
    }

    async fn quit_smtp<T, D>(client: SmtpClient<T>, hostname: D)
    where
        D: Display,
        T: AsyncRead + AsyncWrite + Unpin,
    {
        client
            .quit()
            .await
            .inspect_err(|err| {
                warn!("failed to close upstream SMTP connection with {hostname}: {err}");
            })
            .ok();
    }

    fn classify(&self, err: mail_send::Error) -> SendError {
        let temporary = |status| SendError::Temporary(status);
        let permanent = |status| SendError::Permanent(status);
        match err {
            mail_send::Error::UnexpectedReply(response)
            | mail_send::Error::AuthenticationFailed(response) => {
                // SMTP 4xx replies are temporary failures
                let transient =
                    response.severity() == smtp_proto::Severity::TransientNegativeCompletion;
                let status = SmtpStatus {
                    code: response.code,
                    enhanced: response.esc,
                    message: response.message,
                    reason: "remote".into(),
                    misc: Default::default(),
                };
                if transient { temporary(status) } else { permanent(status) }
            }
            mail_send::Error::Tls(err) if self.cfg.require_tls => permanent(
                SmtpStatus::new(550, [5, 7, 10], format!("TLS required but unavailable: {err}"))
                    .with_reason("remote-tls"),
            ),
            mail_send::Error::MissingStartTls if self.cfg.require_tls => permanent(
                SmtpStatus::new(550, [5, 7, 10], "TLS required but not offered")
                    .with_reason("remote-tls"),
            ),
            mail_send::Error::Io(err) => {
                temporary(SmtpStatus::new(451, [4, 4, 2], format!("connection failed: {err}")))
            }
            mail_send::Error::Tls(err) => {
                temporary(SmtpStatus::new(451, [4, 7, 10], format!("TLS handshake failed: {err}")))
            }
            mail_send::Error::Timeout => {
                temporary(SmtpStatus::new(451, [4, 4, 2], "connection timed out"))
            }
            mail_send::Error::UnparseableReply
            | mail_send::Error::Base64(_)
            | mail_send::Error::Auth(_)
            | mail_send::Error::InvalidTLSName => {
                temporary(SmtpStatus::defer(format!("SMTP dialogue failed: {err}")))
            }
            err => permanent(
                SmtpStatus::new(550, [5, 5, 0], format!("delivery impossible: {err}"))
                    .with_reason("remote"),
            ),
        }
    }
}
