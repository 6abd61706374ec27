//! Turns triggered rule actions into controller commands.
//!
//! In `auto` mode each device command is published as JSON to
//! `grow/<controller_id>/command`; in `monitor` mode the same decision is
//! made and logged but nothing is sent.  Per cycle the first (highest
//! priority) action for a device wins, and a command equal to the last one
//! issued for that device is not repeated.  The controller confirms or
//! rejects asynchronously through `actionResult`.

use std::collections::{HashMap, HashSet};

use rumqttc::{AsyncClient, QoS};
use tracing::{error, info};

use crate::config::OperationMode;
use crate::mqtt::{command_topic, CommandMsg};
use crate::rules::{Action, Device, Switch, TriggeredAction};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Outcome {
    Sent,
    /// Monitor mode: decided, not sent.
    Logged,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Dispatched {
    pub(crate) command: CommandMsg,
    pub(crate) outcome: Outcome,
}

pub(crate) struct Executor {
    client: AsyncClient,
    topic: String,
    mode: OperationMode,
    /// Last state sent (or decided, in monitor mode) per device.
    commanded: HashMap<Device, Switch>,
    /// Rules whose notify actions fired on the previous cycle.
    notifying: HashSet<String>,
}

impl Executor {
    pub(crate) fn new(client: AsyncClient, controller_id: &str, mode: OperationMode) -> Self {
        Self {
            client,
            topic: command_topic(controller_id),
            mode,
            commanded: HashMap::new(),
            notifying: HashSet::new(),
        }
    }

    pub(crate) fn mode(&self) -> OperationMode {
        self.mode
    }

    /// Issue the device commands for one cycle.  `triggered` must already be
    /// in priority order.
    pub(crate) async fn dispatch(&mut self, triggered: &[TriggeredAction]) -> Vec<Dispatched> {
        let mut out = Vec::new();

        for command in plan(triggered, &self.commanded) {
            let outcome = match self.mode {
                OperationMode::Monitor => {
                    info!(
                        rule = %command.rule_id,
                        device = ?command.device,
                        state = ?command.state,
                        "executor: would send command (monitor mode)"
                    );
                    Outcome::Logged
                }
                OperationMode::Auto => self.send(&command).await,
            };
            if matches!(outcome, Outcome::Sent | Outcome::Logged) {
                self.commanded.insert(command.device, command.state);
            }
            out.push(Dispatched { command, outcome });
        }

        out
    }

    async fn send(&self, command: &CommandMsg) -> Outcome {
        let payload = match serde_json::to_vec(command) {
            Ok(p) => p,
            Err(e) => return Outcome::Failed(format!("encode: {e}")),
        };
        match self
            .client
            .publish(self.topic.as_str(), QoS::AtLeastOnce, false, payload)
            .await
        {
            Ok(()) => {
                info!(
                    rule = %command.rule_id,
                    device = ?command.device,
                    state = ?command.state,
                    "executor: command sent"
                );
                Outcome::Sent
            }
            Err(e) => {
                error!(device = ?command.device, "executor: failed to publish command: {e}");
                Outcome::Failed(e.to_string())
            }
        }
    }

    /// Notify actions from rules that were not notifying on the previous
    /// cycle, as `(rule_id, message)`.  A rule that stays satisfied does
    /// not repeat its notification.
    pub(crate) fn notifications(&mut self, triggered: &[TriggeredAction]) -> Vec<(String, String)> {
        let mut now = HashSet::new();
        let mut fresh = Vec::new();
        for t in triggered {
            if let Action::Notify { message } = &t.action {
                now.insert(t.rule_id.clone());
                if !self.notifying.contains(&t.rule_id) {
                    info!(rule = %t.rule_id, "notify: {message}");
                    fresh.push((t.rule_id.clone(), message.clone()));
                }
            }
        }
        self.notifying = now;
        fresh
    }

    /// The controller applied `state` to `device`.
    pub(crate) fn confirm(&mut self, device: Device, state: Switch) {
        self.commanded.insert(device, state);
    }

    /// The controller failed to apply the last command for `device`; allow
    /// the next cycle to send it again.
    pub(crate) fn forget(&mut self, device: Device) {
        self.commanded.remove(&device);
    }
}

/// Pick at most one command per device, skipping devices already in the
/// requested state.
pub(crate) fn plan(
    triggered: &[TriggeredAction],
    commanded: &HashMap<Device, Switch>,
) -> Vec<CommandMsg> {
    let mut claimed = HashSet::new();
    let mut out = Vec::new();
    for t in triggered {
        let Action::Device { device, state } = t.action else {
            continue;
        };
        // A lower-priority rule never overrides the winner, even when the
        // winner's command is suppressed as a repeat.
        if !claimed.insert(device) {
            continue;
        }
        if commanded.get(&device) == Some(&state) {
            continue;
        }
        out.push(CommandMsg {
            rule_id: t.rule_id.clone(),
            device,
            state,
        });
    }
    out
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_mqtt() -> (AsyncClient, rumqttc::EventLoop) {
        let opts = rumqttc::MqttOptions::new("test-exec", "127.0.0.1", 1883);
        AsyncClient::new(opts, 10)
    }

    fn device(rule: &str, priority: u8, device: Device, state: Switch) -> TriggeredAction {
        TriggeredAction {
            rule_id: rule.into(),
            rule_name: rule.into(),
            priority,
            action: Action::Device { device, state },
        }
    }

    fn notify(rule: &str, message: &str) -> TriggeredAction {
        TriggeredAction {
            rule_id: rule.into(),
            rule_name: rule.into(),
            priority: 10,
            action: Action::Notify {
                message: message.into(),
            },
        }
    }

    #[test]
    fn plan_first_action_per_device_wins() {
        let triggered = vec![
            device("hot", 80, Device::ExhaustFan, Switch::On),
            device("quiet", 20, Device::ExhaustFan, Switch::Off),
            device("dry", 20, Device::Humidifier, Switch::On),
        ];
        let cmds = plan(&triggered, &HashMap::new());
        assert_eq!(cmds.len(), 2);
        assert_eq!(cmds[0].rule_id, "hot");
        assert_eq!(cmds[0].state, Switch::On);
        assert_eq!(cmds[1].device, Device::Humidifier);
    }

    #[test]
    fn plan_skips_repeats() {
        let commanded = HashMap::from([(Device::ExhaustFan, Switch::On)]);
        let triggered = vec![device("hot", 80, Device::ExhaustFan, Switch::On)];
        assert!(plan(&triggered, &commanded).is_empty());
    }

    #[test]
    fn plan_suppressed_winner_still_claims_device() {
        let commanded = HashMap::from([(Device::Heater, Switch::Off)]);
        let triggered = vec![
            device("hot", 80, Device::Heater, Switch::Off),
            device("cold", 10, Device::Heater, Switch::On),
        ];
        assert!(plan(&triggered, &commanded).is_empty());
    }

    #[test]
    fn plan_ignores_notify() {
        assert!(plan(&[notify("n", "hello")], &HashMap::new()).is_empty());
    }

    #[tokio::test]
    async fn monitor_mode_logs_once() {
        let (client, _eventloop) = test_mqtt();
        let mut ex = Executor::new(client, "chamber-1", OperationMode::Monitor);
        let triggered = vec![device("hot", 80, Device::ExhaustFan, Switch::On)];

        let first = ex.dispatch(&triggered).await;
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].outcome, Outcome::Logged);
        assert!(ex.dispatch(&triggered).await.is_empty());
    }

    #[tokio::test]
    async fn auto_mode_publishes_and_dedupes() {
        let (client, _eventloop) = test_mqtt();
        let mut ex = Executor::new(client, "chamber-1", OperationMode::Auto);
        let on = vec![device("hot", 80, Device::ExhaustFan, Switch::On)];

        let sent = ex.dispatch(&on).await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].outcome, Outcome::Sent);
        assert!(ex.dispatch(&on).await.is_empty());

        let off = vec![device("cool", 50, Device::ExhaustFan, Switch::Off)];
        assert_eq!(ex.dispatch(&off).await.len(), 1);
    }

    #[tokio::test]
    async fn forget_allows_retry() {
        let (client, _eventloop) = test_mqtt();
        let mut ex = Executor::new(client, "chamber-1", OperationMode::Auto);
        let on = vec![device("hot", 80, Device::ExhaustFan, Switch::On)];

        ex.dispatch(&on).await;
        ex.forget(Device::ExhaustFan);
        assert_eq!(ex.dispatch(&on).await.len(), 1);
    }

    #[tokio::test]
    async fn confirmed_state_is_not_resent() {
        let (client, _eventloop) = test_mqtt();
        let mut ex = Executor::new(client, "chamber-1", OperationMode::Auto);
        ex.confirm(Device::Light, Switch::On);
        let on = vec![device("photoperiod", 50, Device::Light, Switch::On)];
        assert!(ex.dispatch(&on).await.is_empty());
    }

    #[tokio::test]
    async fn notifications_fire_on_rising_edge_only() {
        let (client, _eventloop) = test_mqtt();
        let mut ex = Executor::new(client, "chamber-1", OperationMode::Monitor);
        let t = vec![notify("tank", "reservoir low")];

        assert_eq!(
            ex.notifications(&t),
            vec![("tank".to_string(), "reservoir low".to_string())]
        );
        assert!(ex.notifications(&t).is_empty());
        assert!(ex.notifications(&[]).is_empty());
        assert_eq!(ex.notifications(&t).len(), 1);
    }
}
