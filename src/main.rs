use std::sync::Arc;

use carecall::config::CompanionConfig;
use carecall::dispatch::Dispatcher;
use carecall::gateway::{TwilioAgent, TwilioConfig, TwilioGateway};
use carecall::presence::PresenceTracker;
use carecall::scheduler::{Scheduler, SystemClock};
use carecall::session::spawn_session_pump;
use carecall::store::{LibSqlStore, Store};
use carecall::webhooks::{self, WebhookState};
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = CompanionConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        eprintln!("  export TARGET_PHONE_NUMBER=+1...");
        std::process::exit(1);
    });
    let twilio_config = TwilioConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        eprintln!("  export TWILIO_ACCOUNT_SID=AC...");
        eprintln!("  export TWILIO_AUTH_TOKEN=...");
        eprintln!("  export TWILIO_PHONE_NUMBER=+1...");
        std::process::exit(1);
    });

    eprintln!("📞 CareCall v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Recipient: {}", config.recipient);
    eprintln!("   Webhooks: http://{}/webhook", config.bind_addr);
    eprintln!("   Tick: every {}s\n", config.tick_interval.as_secs());

    // ── Database ─────────────────────────────────────────────────────────
    let store: Arc<dyn Store> = Arc::new(
        LibSqlStore::new_local(std::path::Path::new(&config.db_path))
            .await
            .unwrap_or_else(|e| {
                eprintln!("Error: Failed to open database at {}: {e}", config.db_path);
                std::process::exit(1);
            }),
    );

    // ── Presence and session events ─────────────────────────────────────
    let presence = Arc::new(PresenceTracker::new());
    let (lifecycle_tx, lifecycle_rx) = mpsc::channel(64);
    let (turn_tx, turn_rx) = mpsc::channel(64);
    let pump = spawn_session_pump(store.clone(), presence.clone(), lifecycle_rx, turn_rx);

    // ── Delivery pipeline ───────────────────────────────────────────────
    let gateway = Arc::new(TwilioGateway::new(twilio_config.clone()));
    let agent = Arc::new(TwilioAgent::new(twilio_config));
    let dispatcher = Arc::new(Dispatcher::new(
        presence.clone(),
        gateway,
        agent,
        config.recipient.clone(),
        config.origination_timeout,
    ));
    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        dispatcher,
        Arc::new(SystemClock),
        config.scheduler_config(),
    ));
    let scheduler_task = scheduler.spawn();

    // ── Webhook server ──────────────────────────────────────────────────
    let router = webhooks::router(WebhookState {
        lifecycle_tx,
        turn_tx,
    });
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, "Webhook server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await?;

    scheduler_task.abort();
    pump.abort();
    Ok(())
}
