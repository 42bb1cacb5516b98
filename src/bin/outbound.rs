use anyhow::Context;
use mailward::{
    DispatchConfig, Dispatcher, Queue, QueueConfig, RcptBlock, RemoteConfig, RemoteTarget,
    SourceBlock, dns::MxResolver, init_tracing, shutdown_signal, target::DeliveryTarget,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Outbound relay runner: recovers the on-disk spool and keeps delivering
/// it to remote MX hosts until told to stop. Ingress endpoints feed the
/// spool through the library's queue target.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    init_tracing();

    let hostname =
        std::env::var("MAILWARD_HOSTNAME").context("MAILWARD_HOSTNAME must be set")?;
    let spool = std::env::var("MAILWARD_SPOOL").unwrap_or_else(|_| "queue".to_string());
    let require_tls = std::env::var("MAILWARD_REQUIRE_TLS")
        .is_ok_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));

    let remote: Arc<dyn DeliveryTarget> = Arc::new(RemoteTarget::new(
        RemoteConfig {
            hostname: hostname.clone(),
            require_tls,
            ..Default::default()
        },
        MxResolver::new(),
    ));

    // failure notifications leave through their own pipeline, so deployments
    // can hang checks and routing off it without touching the queue
    let bounce = Arc::new(Dispatcher::new(
        DispatchConfig::new(hostname.clone()).with_default_source(SourceBlock::route_all(
            RcptBlock::deliver_to(vec![remote.clone()]),
        )),
    )?);

    let shutdown = CancellationToken::new();
    let queue = Queue::open(
        QueueConfig {
            location: spool.into(),
            hostname,
            ..Default::default()
        },
        remote,
        Some(bounce),
        shutdown.clone(),
    )
    .await
    .context("failed to open the delivery spool")?;
    info!("delivering spooled mail");

    shutdown_signal(shutdown.clone()).await;
    info!("received shutdown signal, draining delivery attempts");
    queue.close().await;

    Ok(())
}
