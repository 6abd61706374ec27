use rumqttc::{AsyncClient, Event, EventLoop, Packet, QoS};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::rules::{Device, Switch};
use crate::snapshot::{AlertMsg, LinkReport, NutrientReadings, RawSnapshot};

// ---------------------------------------------------------------------------
// Topics
// ---------------------------------------------------------------------------
//
// Controller → hub:  grow/<controller_id>/<event>
// Hub → controller:  grow/<controller_id>/command

pub(crate) const TOPIC_ROOT: &str = "grow";

pub(crate) fn subscription(controller_id: &str) -> String {
    format!("{TOPIC_ROOT}/{controller_id}/+")
}

pub(crate) fn command_topic(controller_id: &str) -> String {
    format!("{TOPIC_ROOT}/{controller_id}/command")
}

/// Split "grow/<controller_id>/<event>" into its two variable segments.
pub(crate) fn split_topic(topic: &str) -> Option<(&str, &str)> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 3 && parts[0] == TOPIC_ROOT && !parts[1].is_empty() && !parts[2].is_empty()
    {
        Some((parts[1], parts[2]))
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Message types
// ---------------------------------------------------------------------------

/// Hub → controller command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct CommandMsg {
    pub(crate) rule_id: String,
    pub(crate) device: Device,
    pub(crate) state: Switch,
}

/// Controller → hub execution report for a [`CommandMsg`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub(crate) struct ActionResult {
    pub(crate) rule_id: String,
    #[serde(default)]
    pub(crate) device: Option<Device>,
    #[serde(default)]
    pub(crate) state: Option<Switch>,
    pub(crate) ok: bool,
    #[serde(default)]
    pub(crate) error: Option<String>,
}

/// A decoded controller event.  The pipeline treats each one as "apply
/// this snapshot" or "apply this status", independent of transport.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Inbound {
    SensorData(RawSnapshot),
    NutrientSensors(NutrientReadings),
    NutrientStatus(serde_json::Value),
    WatchdogStatus(LinkReport),
    Alert(AlertMsg),
    ActionResult(ActionResult),
}

/// Everything the event-loop task hands to the pipeline task.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum HubEvent {
    Inbound(Inbound),
    Broker { connected: bool },
    Malformed { topic: String, error: String },
}

/// Decode a payload for `event`.  `Ok(None)` for events this hub does not
/// consume.
pub(crate) fn decode(event: &str, payload: &[u8]) -> Result<Option<Inbound>, String> {
    fn json<T: for<'de> Deserialize<'de>>(payload: &[u8]) -> Result<T, String> {
        serde_json::from_slice(payload).map_err(|e| format!("bad json: {e}"))
    }

    Ok(Some(match event {
        "sensorData" => Inbound::SensorData(json(payload)?),
        "nutrientSensors" => Inbound::NutrientSensors(json(payload)?),
        "nutrientStatus" => Inbound::NutrientStatus(json(payload)?),
        "watchdogStatus" => Inbound::WatchdogStatus(json(payload)?),
        "alert" => Inbound::Alert(json(payload)?),
        "actionResult" => Inbound::ActionResult(json(payload)?),
        _ => return Ok(None),
    }))
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

/// Poll the broker connection forever, forwarding decoded events to the
/// pipeline in arrival order.  Returns when the pipeline side hangs up.
///
/// `topic` is (re)subscribed on every ConnAck since a clean session drops
/// subscriptions on reconnect.
pub(crate) async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    topic: String,
    tx: mpsc::Sender<HubEvent>,
) {
    loop {
        let forwarded = match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                let Some((_, event)) = split_topic(&p.topic) else {
                    debug!(topic = %p.topic, "unhandled topic");
                    continue;
                };
                match decode(event, &p.payload) {
                    Ok(Some(inbound)) => tx.send(HubEvent::Inbound(inbound)).await,
                    Ok(None) => {
                        debug!(topic = %p.topic, "ignoring event");
                        continue;
                    }
                    Err(e) => {
                        warn!(topic = %p.topic, "{e}");
                        tx.send(HubEvent::Malformed {
                            topic: p.topic.clone(),
                            error: e,
                        })
                        .await
                    }
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                // try_: this task is the one draining the request queue.
                match client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                    Ok(()) => info!("hub subscribed to {topic}"),
                    Err(e) => error!("failed to subscribe to {topic}: {e}"),
                }
                tx.send(HubEvent::Broker { connected: true }).await
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                info!("mqtt disconnected");
                tx.send(HubEvent::Broker { connected: false }).await
            }
            Ok(_) => continue,
            Err(e) => {
                error!("mqtt error: {e}. reconnecting...");
                let sent = tx.send(HubEvent::Broker { connected: false }).await;
                sleep(Duration::from_secs(2)).await;
                sent
            }
        };

        if forwarded.is_err() {
            info!("pipeline closed, stopping mqtt event loop");
            return;
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
