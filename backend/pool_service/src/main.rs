//! Gift pool service: entry point.
//!
//! Serves the contribution/funding REST API and runs the background
//! reconciler that settles stale payments, retries refunds, delivers
//! notifications and audits pooled amounts.

mod api;
mod config;
mod db;
mod errors;
mod funding;
mod gateway;
mod ledger;
mod models;
mod notify;
mod reconciler;

#[cfg(test)]
mod test_ledger;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::Config;
use gateway::{PaymentGateway, SandboxGateway, StripeGateway};
use ledger::Ledger;
use notify::{HttpDispatcher, NotificationDispatcher, TracingDispatcher};
use reconciler::ReconcilerSettings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,pool_service=debug")),
        )
        .init();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;

    let pool = db::init_pool(&config.database_url).await?;

    let timeout = Duration::from_secs(config.gateway_timeout_secs);
    let gateway: Arc<dyn PaymentGateway> = match &config.stripe_secret_key {
        Some(key) => Arc::new(StripeGateway::new(key, &config.stripe_api_base, timeout)?),
        None => {
            warn!("STRIPE_SECRET_KEY not set, using the auto-capturing sandbox gateway");
            Arc::new(SandboxGateway::auto_capturing())
        }
    };
    let dispatcher: Arc<dyn NotificationDispatcher> = match &config.notify_webhook_url {
        Some(url) => Arc::new(HttpDispatcher::new(url, timeout)?),
        None => Arc::new(TracingDispatcher),
    };

    let ledger = Arc::new(Ledger {
        pool,
        gateway,
        dispatcher,
        currency: config.currency.clone(),
        max_apply_attempts: config.max_apply_attempts,
    });

    // ─── Background reconciler ────────────────────────────
    let shutdown = CancellationToken::new();
    let reconciler = tokio::spawn(reconciler::run(
        ledger.clone(),
        ReconcilerSettings {
            interval: Duration::from_secs(config.reconcile_interval_secs),
            stale_after_secs: config.stale_pending_secs,
        },
        shutdown.clone(),
    ));

    // ─── REST API ─────────────────────────────────────────
    let app = api::router(Arc::new(api::ApiState { ledger }));

    let addr = format!("0.0.0.0:{}", config.api_port);
    info!("API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    reconciler.await?;
    Ok(())
}
