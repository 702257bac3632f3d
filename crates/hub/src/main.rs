mod actuator;
mod condition;
mod config;
mod db;
mod lock;
mod mqtt;
mod notify;
mod phase;
mod relay;
mod rules;
mod sensor;
mod state;
mod store;
mod web;
mod window;

#[cfg(test)]
mod fakes;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::{env, time::Duration};
use tokio::time::sleep;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use actuator::{Actuator, Command, ShellyClient};
use db::Db;
use lock::ActuationLock;
use notify::{AnyNotifier, LogNotifier, TelegramNotifier};
use phase::PhaseController;
use relay::RelayState;
use rules::RuleEngine;
use state::{SharedState, SystemState};
use store::{JsonAuditLog, JsonRelayStore, JsonRuleStore, RelayStore};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

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
    let db_url =
        env::var("DB_URL").unwrap_or_else(|_| "sqlite:growbox.db?mode=rwc".to_string());
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());

    // ── Config file ─────────────────────────────────────────────────
    let cfg = config::load(&config_path)?;
    info!(
        phases = cfg.phases.len(),
        relay = %cfg.irrigation.relay,
        moisture_sensor = %cfg.irrigation.moisture_sensor,
        "config loaded from {config_path}"
    );

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    // ── Shared pieces ───────────────────────────────────────────────
    let shared = SystemState::shared();
    shared.write().await.record_system("hub started".to_string());
    let lock = ActuationLock::new();
    let actuator = ShellyClient::new(cfg.actuator.timeout(), cfg.actuator.retry_policy())?;

    let notifier = match (env::var("TELEGRAM_BOT_TOKEN"), env::var("TELEGRAM_CHAT_ID")) {
        (Ok(token), Ok(chat)) if !token.is_empty() && !chat.is_empty() => {
            AnyNotifier::Telegram(TelegramNotifier::new(token, chat)?)
        }
        _ => {
            warn!("telegram not configured, notifications go to the log");
            AnyNotifier::Log(LogNotifier)
        }
    };

    // ── Rule engine ─────────────────────────────────────────────────
    let engine = RuleEngine::new(
        JsonRuleStore::new(&cfg.files.rules),
        JsonRelayStore::new(&cfg.files.relays),
        db.clone(),
        actuator.clone(),
        JsonAuditLog::new(&cfg.files.audit_log, cfg.files.audit_capacity),
        lock.clone(),
        shared.clone(),
    );
    tokio::spawn(engine.run(cfg.engine.rule_tick()));

    // ── Irrigation phases ───────────────────────────────────────────
    let controller = PhaseController::new(
        cfg.irrigation.clone(),
        cfg.phases.clone(),
        JsonRelayStore::new(&cfg.files.relays),
        db.clone(),
        actuator.clone(),
        db.clone(),
        notifier,
        lock.clone(),
        shared.clone(),
    );
    tokio::spawn(controller.run(cfg.engine.phase_check(), cfg.engine.state_save()));

    // ── Web server ──────────────────────────────────────────────────
    let web_state = shared.clone();
    tokio::spawn(async move {
        if let Err(e) = web::serve(web_state, web_port).await {
            error!("{e:#}");
        }
    });

    // ── MQTT ────────────────────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new("growbox-hub", broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    let (client, eventloop) = AsyncClient::new(mqttoptions, 20);
    client.subscribe("tele/+/climate", QoS::AtLeastOnce).await?;
    client.subscribe("tele/+/moisture", QoS::AtLeastOnce).await?;
    info!("hub subscribed to tele/+/climate and tele/+/moisture");

    tokio::select! {
        _ = intake(eventloop, db.clone(), shared.clone()) => {}
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                error!("waiting for ctrl-c failed: {e}");
            }
        }
    }

    info!("shutting down, switching relays off");
    all_off(&JsonRelayStore::new(&cfg.files.relays), &actuator).await;
    Ok(())
}

/// Telemetry intake. Runs until the process exits.
async fn intake(mut eventloop: EventLoop, db: Db, shared: SharedState) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                if let Err(e) = mqtt::ingest(&db, &shared, &p.topic, &p.payload).await {
                    warn!(topic = %p.topic, "telemetry rejected: {e:#}");
                    let mut st = shared.write().await;
                    st.record_error(format!("{}: {e:#}", p.topic));
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                let mut st = shared.write().await;
                st.mqtt_connected = true;
                st.record_system("mqtt connected".to_string());
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_system("mqtt disconnected".to_string());
            }
            Ok(_) => {}
            Err(e) => {
                error!("mqtt error: {e}. reconnecting...");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_error(format!("mqtt error: {e}"));
                drop(st);

                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

/// Best-effort: every registered relay gets an "off".
async fn all_off<Y: RelayStore, A: Actuator>(relays: &Y, actuator: &A) {
    let list = match relays.list().await {
        Ok(l) => l,
        Err(e) => {
            error!("loading relays for shutdown failed: {e:#}");
            return;
        }
    };
    for r in list {
        match actuator.send(&r.endpoint, Command::set(RelayState::Off)).await {
            Ok(()) => info!(relay = %r.name, "relay off"),
            Err(e) => error!(relay = %r.name, "switching off failed: {e}"),
        }
    }
}
