use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use run_relay::config::RelayConfig;
use run_relay::forward::EventForwarder;
use run_relay::poller::RunPoller;
use run_relay::relay::Scheduler;
use run_relay::server::{AppState, build_router};
use run_relay::store::Broker;
use run_relay::tfc::TfcClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "run_relay=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = RelayConfig::from_env().context("invalid configuration")?;
    tracing::info!(data_dir = %config.data_dir.display(), "Opening store");

    let broker = Arc::new(
        Broker::open(&config.data_dir)
            .with_context(|| format!("failed to open store at {}", config.data_dir.display()))?,
    );
    let scheduler = Scheduler::connect(broker.clone(), config.scheduler.clone())
        .await
        .context("failed to prepare streams and buckets")?;

    let shutdown = CancellationToken::new();
    let pump = broker.spawn_source_pump(config.scheduler.dispatch_interval, shutdown.clone());

    let polling = match &config.tfc_token {
        Some(token) => {
            let poller = Arc::new(RunPoller::new(
                scheduler.clone(),
                TfcClient::new(&config.tfc_url, token),
            ));
            let workers = scheduler
                .start_polling(&shutdown, move |task| {
                    let poller = poller.clone();
                    async move { poller.poll(task).await }
                })
                .context("failed to start polling workers")?;
            Some(workers)
        }
        None => {
            tracing::warn!("RUN_RELAY_TFC_TOKEN not set; run polling and dispatch disabled");
            None
        }
    };

    let forwarding = match (&config.events_url, &config.events_queue) {
        (Some(url), Some(queue)) => {
            let forwarder = Arc::new(EventForwarder::new(
                url,
                config.events_token.clone().map(String::into_bytes),
            ));
            let subscription = scheduler
                .subscribe_run_events(queue, move |event| {
                    let forwarder = forwarder.clone();
                    async move { forwarder.forward(event).await }
                })
                .with_context(|| format!("failed to subscribe to run events for {queue}"))?;
            tracing::info!(%queue, %url, "Forwarding run events");
            Some(subscription)
        }
        _ => {
            tracing::warn!("RUN_RELAY_EVENTS_URL not set; run events are stored but not forwarded");
            None
        }
    };

    let app_state = AppState::new(
        scheduler.clone(),
        config.notification_token.clone().map(String::into_bytes),
    );
    let app = build_router(app_state);

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    tracing::info!("listening on {}", config.listen_addr);

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
        }
        tracing::info!("Shutdown signal received");
        signal.cancel();
    });

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
        .await
        .context("server error")?;

    shutdown.cancel();
    if let Some(workers) = polling {
        workers.close().await;
    }
    if let Some(subscription) = forwarding {
        subscription.close().await;
    }
    let _ = pump.await;
    tracing::info!("Stopped");
    Ok(())
}
