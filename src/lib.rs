//! SMTP message-handling core: a per-message dispatch pipeline composing
//! checks, modifiers and delivery targets, plus a durable retry queue for
//! outbound delivery. Protocol endpoints and storage backends plug in
//! through the [`target::DeliveryTarget`] seam.

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub mod address;
pub mod authres;
pub mod buffer;
pub mod check;
pub mod dispatch;
pub mod dns;
pub mod header;
pub mod message;
pub mod modify;
pub mod queue;
pub mod remote;
pub mod status;
pub mod target;

mod bounce;

#[cfg(test)]
pub(crate) mod testutil;

pub use buffer::{BodyBuffer, FileBuffer, MemoryBuffer};
pub use dispatch::{DispatchConfig, Dispatcher, RcptBlock, SourceBlock};
pub use header::Header;
pub use message::{MessageId, MessageMeta};
pub use queue::{Queue, QueueConfig};
pub use remote::{RemoteConfig, RemoteTarget};
pub use status::SmtpStatus;
pub use target::{Delivery, DeliveryTarget};

/// Structured JSON logging for the delivery runners. `RUST_LOG` overrides
/// the default of debug for this crate (message-id correlated delivery
/// traces) and info for everything underneath it.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("{}=debug,info", env!("CARGO_CRATE_NAME")).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

/// Wait for ctrl-c, SIGTERM or a programmatic cancellation of `token` (the
/// same token handed to [`Queue::open`], so embedders can stop delivery
/// without a process signal).
pub async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = token.cancelled() => {},
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
