mod advisor;
mod config;
mod executor;
mod fusion;
mod mqtt;
mod physics;
mod pipeline;
mod rules;
mod snapshot;
mod state;
mod watchdog;
mod web;

use anyhow::Result;
use rumqttc::{AsyncClient, MqttOptions};
use std::collections::BTreeSet;
use std::io::IsTerminal;
use std::{env, sync::Arc, time::Duration};
use time::OffsetDateTime;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{error, info, warn};
use tracing_subscriber::filter::EnvFilter;

use executor::Executor;
use pipeline::{Pipeline, Settings};
use rules::RuleBook;
use state::{LiveState, LiveStateStore};
use watchdog::Watchdog;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise `HUB_LOG_LEVEL` picks the level
/// (default `info`).  `FORCE_COLOR` overrides TTY detection.
fn init_tracing() {
    let use_color = match env::var("FORCE_COLOR").as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => std::io::stderr().is_terminal(),
    };

    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match env::var("HUB_LOG_LEVEL").ok().as_deref() {
            Some("trace") => "trace",
            Some("debug") => "debug",
            Some("warn") => "warn",
            Some("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("{level},rumqttc=warn"))
    };

    tracing_subscriber::fmt()
        .with_target(true)
        .with_env_filter(env_filter)
        .with_ansi(use_color)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

/// Log advisory changes as they are published.
async fn log_advisories(mut rx: watch::Receiver<Arc<LiveState>>) {
    let mut shown: BTreeSet<String> = BTreeSet::new();
    while rx.changed().await.is_ok() {
        let st = rx.borrow_and_update().clone();
        let current: BTreeSet<String> = st.recommendations.iter().map(|r| r.id.clone()).collect();
        for r in st.recommendations.iter().filter(|r| !shown.contains(&r.id)) {
            info!(id = %r.id, severity = ?r.severity, "advisory: {}", r.message);
        }
        for id in shown.difference(&current) {
            info!(%id, "advisory resolved");
        }
        shown = current;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    // ── Env config ──────────────────────────────────────────────────
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let web_port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    // ── Config file ─────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;
    let controller_id = cfg.hub.controller_id.clone();

    let book = RuleBook::from_entries(&cfg.rules);
    if book.len() < cfg.rules.len() {
        warn!(
            loaded = book.len(),
            configured = cfg.rules.len(),
            "some rules were rejected; see warnings above"
        );
    }
    info!(
        controller = %controller_id,
        mode = ?cfg.hub.mode,
        phase = ?cfg.hub.phase,
        rules = book.len(),
        "config loaded from {config_path}"
    );
    let rules = Arc::new(RwLock::new(book));

    // ── Live state + web ────────────────────────────────────────────
    let now = OffsetDateTime::now_utc();
    let store = LiveStateStore::new(LiveState::new(cfg.hub.mode, cfg.hub.phase, now));

    let app = web::AppState {
        store: store.clone(),
        rules: Arc::clone(&rules),
    };
    tokio::spawn(async move {
        if let Err(e) = web::serve(app, web_port).await {
            error!("web server stopped: {e:#}");
        }
    });
    tokio::spawn(log_advisories(store.subscribe()));

    // ── MQTT ────────────────────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new(format!("growroom-hub-{controller_id}"), broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    let (client, eventloop) = AsyncClient::new(mqttoptions, 20);

    let (tx, mut rx) = mpsc::channel(64);
    tokio::spawn(mqtt::run_event_loop(
        eventloop,
        client.clone(),
        mqtt::subscription(&controller_id),
        tx,
    ));

    // ── Pipeline ────────────────────────────────────────────────────
    let mut pipeline = Pipeline::new(
        Settings::from(&cfg),
        rules,
        store,
        Executor::new(client, &controller_id, cfg.hub.mode),
        Watchdog::new(cfg.watchdog.thresholds()),
        now,
    );

    let mut ticker = tokio::time::interval(cfg.watchdog.tick());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(event) => pipeline.handle(event, OffsetDateTime::now_utc()).await,
                None => {
                    error!("mqtt event loop ended");
                    break;
                }
            },
            _ = ticker.tick() => pipeline.tick(OffsetDateTime::now_utc()).await,
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }

    Ok(())
}
