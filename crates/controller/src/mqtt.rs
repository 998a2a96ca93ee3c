use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS};
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::arbiter::{Controller, Origin};
use crate::error::LinkError;
use crate::state::EventKind;
use crate::supervisor::{Link, MessageLink, Mode};

// ---------------------------------------------------------------------------
// Outbound notifications
// ---------------------------------------------------------------------------

/// Best-effort status notifications. Called with the controller lock held,
/// so implementations must not block.
pub trait StatePublisher: Send + Sync {
    fn publish_state(&self, zone: usize, on: bool) -> Result<(), LinkError>;
    fn publish_schedule_enabled(&self, zone: usize, enabled: bool) -> Result<(), LinkError>;
}

fn on_off(on: bool) -> &'static str {
    if on {
        "ON"
    } else {
        "OFF"
    }
}

// ---------------------------------------------------------------------------
// Topic layout
// ---------------------------------------------------------------------------

/// An inbound publish, reduced to what dispatch needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    Power { zone: usize, on: bool },
    ScheduleEnabled { zone: usize, enabled: bool },
}

/// Zone topics: `<command_base>/<zone>/power|schedule` inbound,
/// `<state_base>/<zone>/state|schedule` outbound.
#[derive(Debug, Clone)]
pub struct Topics {
    command_base: String,
    state_base: String,
    discovery_prefix: Option<String>,
    device_id: String,
}

impl Topics {
    pub fn new(
        command_base: impl Into<String>,
        state_base: impl Into<String>,
        discovery_prefix: Option<String>,
        device_id: impl Into<String>,
    ) -> Self {
        Self {
            command_base: command_base.into(),
            state_base: state_base.into(),
            discovery_prefix: discovery_prefix.filter(|p| !p.is_empty()),
            device_id: device_id.into(),
        }
    }

    pub fn subscriptions(&self) -> [String; 2] {
        [
            format!("{}/+/power", self.command_base),
            format!("{}/+/schedule", self.command_base),
        ]
    }

    pub fn state(&self, zone: usize) -> String {
        format!("{}/{zone}/state", self.state_base)
    }

    pub fn schedule(&self, zone: usize) -> String {
        format!("{}/{zone}/schedule", self.state_base)
    }

    pub fn power_command(&self, zone: usize) -> String {
        format!("{}/{zone}/power", self.command_base)
    }

    /// Home Assistant discovery topic for `zone`, if discovery is enabled.
    pub fn discovery(&self, zone: usize) -> Option<String> {
        self.discovery_prefix
            .as_ref()
            .map(|prefix| format!("{prefix}/switch/zone_{zone}/config"))
    }

    /// Discovery document for `zone`: a switch wired to the power topics.
    pub fn discovery_payload(&self, zone: usize) -> serde_json::Value {
        let unique = format!("{}_zone_{zone}", self.device_id);
        json!({
            "name": format!("Zone {}", zone + 1),
            "command_topic": self.power_command(zone),
            "state_topic": self.state(zone),
            "payload_on": "ON",
            "payload_off": "OFF",
            "unique_id": unique,
            "device": {
                "identifiers": [unique],
                "name": format!("Zone {}", zone + 1),
                "model": "Sprinkler Controller",
                "sw_version": env!("CARGO_PKG_VERSION"),
            },
            "platform": "mqtt",
        })
    }

    /// Classify an inbound publish. Zone range is checked by the controller.
    pub fn parse_inbound(&self, topic: &str, payload: &[u8]) -> Result<Inbound, String> {
        let rest = topic
            .strip_prefix(self.command_base.as_str())
            .and_then(|r| r.strip_prefix('/'))
            .ok_or_else(|| format!("unhandled topic '{topic}'"))?;

        let (zone, leaf) = rest
            .split_once('/')
            .ok_or_else(|| format!("unhandled topic '{topic}'"))?;
        let zone: usize = zone
            .parse()
            .map_err(|_| format!("bad zone index '{zone}' in topic '{topic}'"))?;

        match leaf {
            "power" => Ok(Inbound::Power {
                zone,
                on: parse_power(payload)?,
            }),
            "schedule" => Ok(Inbound::ScheduleEnabled {
                zone,
                enabled: parse_flag(payload)?,
            }),
            _ => Err(format!("unhandled topic '{topic}'")),
        }
    }
}

/// Parse an "ON"/"OFF" payload into a bool (case-insensitive, trims whitespace).
pub fn parse_power(payload: &[u8]) -> Result<bool, String> {
    let s = String::from_utf8_lossy(payload).trim().to_uppercase();
    match s.as_str() {
        "ON" => Ok(true),
        "OFF" => Ok(false),
        _ => Err(format!("unknown power command '{s}' (use ON/OFF)")),
    }
}

/// Schedule enable flag: ON/OFF, true/false or 1/0.
pub fn parse_flag(payload: &[u8]) -> Result<bool, String> {
    let s = String::from_utf8_lossy(payload).trim().to_uppercase();
    match s.as_str() {
        "ON" | "TRUE" | "1" => Ok(true),
        "OFF" | "FALSE" | "0" => Ok(false),
        _ => Err(format!("unknown schedule flag '{s}'")),
    }
}

/// Forward one inbound message into the controller. Malformed or rejected
/// commands are logged and recorded, never propagated.
pub async fn dispatch(controller: &Controller, topics: &Topics, msg: &Message) {
    let inbound = match topics.parse_inbound(&msg.topic, &msg.payload) {
        Ok(inbound) => inbound,
        Err(reason) => {
            warn!(topic = %msg.topic, "dropping inbound message: {reason}");
            controller
                .record(EventKind::Error, format!("inbound dropped: {reason}"))
                .await;
            return;
        }
    };
    debug!(?inbound, "remote command");

    let result = match inbound {
        Inbound::Power { zone, on } => controller
            .request_state(zone, on, Origin::Remote)
            .await
            .map(|_| ()),
        Inbound::ScheduleEnabled { zone, enabled } => {
            controller
                .set_schedule_enabled(zone, enabled, Origin::Remote)
                .await
        }
    };

    if let Err(e) = result {
        warn!(topic = %msg.topic, "remote command rejected: {e}");
        controller
            .record(EventKind::Error, format!("remote command rejected: {e}"))
            .await;
    }
}

// ---------------------------------------------------------------------------
// rumqttc plumbing
// ---------------------------------------------------------------------------

/// Request channel size: discovery, two subscriptions and a full republish
/// must fit without blocking.
pub fn channel_capacity(zones: usize) -> usize {
    8 + zones * 4
}

/// Publishes retained zone state while the mode is FULL; otherwise a no-op.
pub struct MqttPublisher {
    client: AsyncClient,
    topics: Topics,
    mode: watch::Receiver<Mode>,
}

impl MqttPublisher {
    pub fn new(client: AsyncClient, topics: Topics, mode: watch::Receiver<Mode>) -> Self {
        Self {
            client,
            topics,
            mode,
        }
    }

    fn send(&self, topic: String, payload: &'static str) -> Result<(), LinkError> {
        if !self.mode.borrow().messaging_active() {
            return Ok(());
        }
        self.client
            .try_publish(topic, QoS::AtLeastOnce, true, payload)
            .map_err(|e| LinkError::Messaging(e.to_string()))
    }
}

impl StatePublisher for MqttPublisher {
    fn publish_state(&self, zone: usize, on: bool) -> Result<(), LinkError> {
        self.send(self.topics.state(zone), on_off(on))
    }

    fn publish_schedule_enabled(&self, zone: usize, enabled: bool) -> Result<(), LinkError> {
        self.send(self.topics.schedule(zone), on_off(enabled))
    }
}

/// The broker connection as a ladder rung.
pub struct MqttLink {
    client: AsyncClient,
    eventloop: EventLoop,
    topics: Topics,
    zone_count: usize,
}

impl MqttLink {
    pub fn new(options: MqttOptions, topics: Topics, zone_count: usize) -> (Self, AsyncClient) {
        let (client, eventloop) = AsyncClient::new(options, channel_capacity(zone_count));
        let link = Self {
            client: client.clone(),
            eventloop,
            topics,
            zone_count,
        };
        (link, client)
    }

    fn announce(&self) -> Result<(), LinkError> {
        for topic in self.topics.subscriptions() {
            self.client
                .try_subscribe(topic, QoS::AtLeastOnce)
                .map_err(|e| LinkError::Messaging(e.to_string()))?;
        }
        for zone in 0..self.zone_count {
            let Some(topic) = self.topics.discovery(zone) else {
                break;
            };
            let payload = self.topics.discovery_payload(zone).to_string();
            self.client
                .try_publish(topic, QoS::AtLeastOnce, true, payload)
                .map_err(|e| LinkError::Messaging(e.to_string()))?;
        }
        Ok(())
    }
}

impl Link for MqttLink {
    async fn connect(&mut self) -> Result<(), LinkError> {
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code != ConnectReturnCode::Success {
                        return Err(LinkError::Messaging(format!(
                            "broker refused connection: {:?}",
                            ack.code
                        )));
                    }
                    break;
                }
                Ok(_) => {}
                Err(e) => return Err(LinkError::Messaging(e.to_string())),
            }
        }
        self.announce()?;
        info!(subscriptions = ?self.topics.subscriptions(), "mqtt connected");
        Ok(())
    }
}

impl MessageLink for MqttLink {
    async fn poll(&mut self) -> Result<Option<Message>, LinkError> {
        match self.eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => Ok(Some(Message {
                topic: p.topic.clone(),
                payload: p.payload.to_vec(),
            })),
            Ok(Event::Incoming(Packet::Disconnect)) => {
                Err(LinkError::Messaging("broker sent disconnect".into()))
            }
            Ok(_) => Ok(None),
            Err(e) => Err(LinkError::Messaging(e.to_string())),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
