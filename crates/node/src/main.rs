mod sim;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use std::{env, time::Duration};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use sim::{ChamberSim, Device, Scenario};

// ---------------------------------------------------------------------------
// Wire messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Switch {
    On,
    Off,
}

/// Hub → node.
#[derive(Debug, Clone, PartialEq, Deserialize)]
struct Command {
    rule_id: String,
    device: Device,
    state: Switch,
}

/// Node → hub, one per [`Command`].
#[derive(Debug, Serialize)]
struct ActionResult {
    rule_id: String,
    device: Device,
    state: Switch,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct LinkStatus {
    #[serde(rename = "mqttConnected")]
    mqtt_connected: bool,
}

#[derive(Debug, Serialize)]
struct Alert {
    severity: &'static str,
    message: String,
}

#[derive(Debug, Serialize)]
struct NutrientStatus {
    dosing: bool,
    watering: bool,
}

enum NodeEvent {
    Connected,
    Command(Command),
}

/// CO2-ish gas reading above which the node raises an alert.
const GAS_ALERT_LEVEL: f64 = 650.0;

fn now_unix_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

fn topic(controller_id: &str, event: &str) -> String {
    format!("grow/{controller_id}/{event}")
}

fn parse_command(payload: &[u8]) -> Result<Command> {
    serde_json::from_slice(payload).context("bad command json")
}

/// Apply `cmd` to the simulator and build the report for the hub.
fn execute(sim: &mut ChamberSim, cmd: Command) -> ActionResult {
    let error = if sim.command_fails() {
        Some(format!("{:?} relay did not respond", cmd.device))
    } else {
        sim.set_device(cmd.device, cmd.state == Switch::On);
        None
    };
    ActionResult {
        rule_id: cmd.rule_id,
        device: cmd.device,
        state: cmd.state,
        ok: error.is_none(),
        error,
    }
}

async fn publish_json<T: Serialize>(client: &AsyncClient, topic: &str, msg: &T) {
    let payload = match serde_json::to_vec(msg) {
        Ok(p) => p,
        Err(e) => {
            error!("encode error on {topic}: {e}");
            return;
        }
    };
    if let Err(e) = client.publish(topic, QoS::AtLeastOnce, false, payload).await {
        error!("publish error on {topic}: {e}");
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Env config
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let controller_id = env::var("CONTROLLER_ID").unwrap_or_else(|_| "chamber-1".to_string());
    let sample_every_s: u64 = env::var("SAMPLE_EVERY_S")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(5);
    let scenario = Scenario::from_str_lossy(&env::var("SIM_SCENARIO").unwrap_or_default());

    let mut mqttoptions =
        MqttOptions::new(format!("growroom-node-{controller_id}"), broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 20);

    let command_topic = topic(&controller_id, "command");
    let (tx, mut rx) = mpsc::channel(32);

    let sub_client = client.clone();
    let sub_topic = command_topic.clone();
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("node connected to mqtt");
                    if let Err(e) = sub_client.try_subscribe(sub_topic.as_str(), QoS::AtLeastOnce) {
                        error!("subscribe failed: {e}");
                    }
                    if tx.send(NodeEvent::Connected).await.is_err() {
                        return;
                    }
                }
                Ok(Event::Incoming(Packet::Publish(p))) if p.topic == sub_topic => {
                    match parse_command(&p.payload) {
                        Ok(cmd) => {
                            if tx.send(NodeEvent::Command(cmd)).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => warn!("{e:#}"),
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error!("mqtt error: {e}. retrying...");
                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    let mut sim = ChamberSim::new(scenario, 2);
    let mut gas_alarm = false;
    let mut ticker = tokio::time::interval(Duration::from_secs(sample_every_s));
    info!(%scenario, controller = %controller_id, sample_every_s, "simulator started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                sim.step();
                let ts = now_unix_ms();
                let data = sim.sensor_data(ts);
                publish_json(&client, &topic(&controller_id, "sensorData"), &data).await;
                publish_json(&client, &topic(&controller_id, "nutrientSensors"), &sim.nutrient_data(ts)).await;
                let status = NutrientStatus {
                    dosing: sim.is_on(Device::NutrientPump),
                    watering: sim.is_on(Device::WaterPump),
                };
                publish_json(&client, &topic(&controller_id, "nutrientStatus"), &status).await;

                let gas = data.gas_level;
                if (gas > GAS_ALERT_LEVEL) != gas_alarm {
                    gas_alarm = !gas_alarm;
                    let alert = Alert {
                        severity: if gas_alarm { "high" } else { "info" },
                        message: if gas_alarm {
                            format!("gas level {gas:.0} above {GAS_ALERT_LEVEL:.0}")
                        } else {
                            format!("gas level back to {gas:.0}")
                        },
                    };
                    publish_json(&client, &topic(&controller_id, "alert"), &alert).await;
                }
            }
            event = rx.recv() => match event {
                Some(NodeEvent::Connected) => {
                    let link = LinkStatus { mqtt_connected: true };
                    publish_json(&client, &topic(&controller_id, "watchdogStatus"), &link).await;
                }
                Some(NodeEvent::Command(cmd)) => {
                    info!(rule = %cmd.rule_id, device = ?cmd.device, state = ?cmd.state, "command received");
                    let result = execute(&mut sim, cmd);
                    if let Some(e) = &result.error {
                        warn!("command failed: {e}");
                    }
                    debug!(devices = ?sim.devices(), "device states");
                    publish_json(&client, &topic(&controller_id, "actionResult"), &result).await;
                }
                None => return Ok(()),
            },
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
