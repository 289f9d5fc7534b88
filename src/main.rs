use drone_position_relay::config::Config;
use drone_position_relay::db::sqlite::SqliteRegistrationStore;
use drone_position_relay::db::RegistrySource;
use drone_position_relay::dispatch::Dispatcher;
use drone_position_relay::ingest::IngestLoop;
use drone_position_relay::notify::{Notifier, NotifyEvent, NullNotifier, TelegramNotifier};
use drone_position_relay::rate_limit::RateLimiter;
use drone_position_relay::record::MessageRecorder;
use drone_position_relay::registry::{self, Registry};
use drone_position_relay::replay;
use drone_position_relay::sink::CalTopoSink;
use drone_position_relay::transport::{self, Transport};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    // Load configuration
    dotenvy::dotenv().ok();
    let cfg = Config::from_env()?;
    info!(workers = cfg.dispatch_workers, "Starting position relay");

    // Registration store and live registry
    let store = Arc::new(SqliteRegistrationStore::connect(&cfg.registration_db_url).await?);
    let registry = Arc::new(Registry::new());

    // Inbound queue and transport seam
    let (channel_transport, inbound_rx) = transport::channel();
    let channel_transport = Arc::new(channel_transport);
    let transport_dyn: Arc<dyn Transport> = channel_transport.clone();

    let notifier: Arc<dyn Notifier> = match (&cfg.telegram_bot_token, &cfg.telegram_chat_id) {
        (Some(token), Some(chat_id)) => Arc::new(TelegramNotifier::new(token, chat_id)),
        _ => {
            info!("notification channel not configured, events will be dropped");
            Arc::new(NullNotifier)
        }
    };

    // Outbound side
    let sink = Arc::new(CalTopoSink::new(&cfg.sink_base_url, cfg.sink_timeout)?);
    let dispatcher = Dispatcher::spawn(sink, cfg.dispatch_workers);
    let limiter = Arc::new(RateLimiter::new(cfg.min_send_interval));

    // Initial registry load, then periodic reconciliation
    registry::reconcile_once(
        store.as_ref(),
        registry.as_ref(),
        transport_dyn.as_ref(),
        notifier.as_ref(),
        true,
    )
    .await?;
    info!(devices = registry.device_count(), "Initial registry load complete");

    let source: Arc<dyn RegistrySource> = store.clone();
    tokio::spawn(registry::run_reconciler(
        source,
        Arc::clone(&registry),
        Arc::clone(&transport_dyn),
        Arc::clone(&notifier),
        cfg.registry_poll_interval,
    ));

    // Ingestion consumer, optionally archiving raw messages
    let mut ingest = IngestLoop::new(
        Arc::clone(&registry),
        limiter,
        dispatcher,
        cfg.geofence,
        Arc::clone(&notifier),
    );
    if let Some(base) = cfg.record_dir.as_deref() {
        ingest = ingest.with_recorder(MessageRecorder::create(Path::new(base))?);
    }
    tokio::spawn(ingest.run(inbound_rx));

    // Offline replay feeds the queue when configured
    if let Some(dir) = cfg.replay_dir.clone() {
        let transport = Arc::clone(&channel_transport);
        let use_real_timestamps = cfg.replay_use_real_timestamps;
        let delay = cfg.replay_delay;
        let multiplier = cfg.replay_time_multiplier;
        tokio::spawn(async move {
            if let Err(e) = replay::replay(
                Path::new(&dir),
                &transport,
                use_real_timestamps,
                delay,
                multiplier,
            )
            .await
            {
                error!(error = %e, "offline replay failed");
            }
        });
    }

    notifier.notify(NotifyEvent::Startup);

    // Heartbeat loop until shutdown
    let mut heartbeat = tokio::time::interval(Duration::from_secs(60));
    heartbeat.tick().await;
    loop {
        tokio::select! {
            _ = heartbeat.tick() => notifier.notify(NotifyEvent::Heartbeat),
            _ = shutdown_signal() => break,
        }
    }

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
