/*!
Broker binding for agent connections.

```text
<prefix>/agents/<machine_id>/up        agent → kernel, protocol messages
<prefix>/agents/<machine_id>/presence  agent → kernel, "online" / "offline" (last will)
<prefix>/agents/<machine_id>/command   kernel → agent, see connections.rs
```

The listener only demultiplexes: each agent gets its own task fed by a
bounded channel, and that task runs the pipeline for its messages in order.
*/

use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bus::topics;
use crate::config::MqttConf;
use crate::connections::Presence;
use crate::models::{MachineId, MachineStatus};
use crate::protocol::parser::MAX_MESSAGE_BYTES;
use crate::protocol::{ConnectionContext, Pipeline};
use crate::state::Kernel;

pub fn create_mqtt_client(conf: &MqttConf) -> (AsyncClient, EventLoop) {
    let mut opts = MqttOptions::new(&conf.client_id, &conf.host, conf.port);
    opts.set_keep_alive(Duration::from_secs(conf.keep_alive_secs));
    // room for the topic and fixed header on top of the largest message
    let packet = MAX_MESSAGE_BYTES + 4096;
    opts.set_max_packet_size(packet, packet);
    AsyncClient::new(opts, 64)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentChannel {
    Up,
    Presence,
}

/// `<prefix>/agents/<id>/<channel>` → `(id, channel)`.
pub fn parse_agent_topic<'a>(prefix: &str, topic: &'a str) -> Option<(&'a str, AgentChannel)> {
    let rest = topic.strip_prefix(prefix)?.strip_prefix("/agents/")?;
    let (machine_id, channel) = rest.split_once('/')?;
    if machine_id.is_empty() {
        return None;
    }
    let channel = match channel {
        "up" => AgentChannel::Up,
        "presence" => AgentChannel::Presence,
        _ => return None,
    };
    Some((machine_id, channel))
}

/// Drains one agent's queue through the pipeline, in arrival order.
pub async fn run_connection(
    pipeline: Arc<Pipeline>,
    presence: Presence,
    ctx: ConnectionContext,
    mut inbox: mpsc::Receiver<Vec<u8>>,
) {
    debug!(machine_id = %ctx.machine_id, "connection task started");
    while let Some(raw) = inbox.recv().await {
        let outcome = pipeline.process(&ctx, &raw).await;
        // only signed traffic counts as a sign of life
        if outcome.is_authenticated() {
            presence.mark_seen(&ctx.machine_id);
        }
        debug!(machine_id = %ctx.machine_id, ?outcome, "message processed");
    }
    debug!(machine_id = %ctx.machine_id, "connection task finished");
}

/// Per-agent queues keyed by machine id.
pub struct ConnectionDemux {
    pipeline: Arc<Pipeline>,
    presence: Presence,
    depth: usize,
    inboxes: HashMap<MachineId, mpsc::Sender<Vec<u8>>>,
}

impl ConnectionDemux {
    pub fn new(pipeline: Arc<Pipeline>, presence: Presence, depth: usize) -> Self {
        Self { pipeline, presence, depth: depth.max(1), inboxes: HashMap::new() }
    }

    pub fn dispatch(&mut self, machine_id: &str, raw: Vec<u8>) {
        let mut raw = raw;
        // a closed inbox means its task ended; start a fresh one
        for _ in 0..2 {
            let inbox = self.inbox(machine_id);
            match inbox.try_send(raw) {
                Ok(()) => return,
                Err(TrySendError::Full(_)) => {
                    warn!(machine_id, "agent queue full, message dropped");
                    return;
                }
                Err(TrySendError::Closed(returned)) => {
                    self.inboxes.remove(machine_id);
                    raw = returned;
                }
            }
        }
    }

    /// Ends the agent's connection task once its queue is drained.
    pub fn disconnect(&mut self, machine_id: &str) -> bool {
        self.inboxes.remove(machine_id).is_some()
    }

    pub fn connections(&self) -> usize {
        self.inboxes.len()
    }

    fn inbox(&mut self, machine_id: &str) -> mpsc::Sender<Vec<u8>> {
        if let Some(inbox) = self.inboxes.get(machine_id) {
            return inbox.clone();
        }
        let (tx, rx) = mpsc::channel(self.depth);
        let ctx = ConnectionContext::new(machine_id);
        tokio::spawn(run_connection(self.pipeline.clone(), self.presence.clone(), ctx, rx));
        self.inboxes.insert(machine_id.to_string(), tx.clone());
        tx
    }
}

async fn subscribe(client: &AsyncClient, prefix: &str) -> Result<(), rumqttc::ClientError> {
    client.subscribe(format!("{prefix}/agents/+/up"), QoS::AtLeastOnce).await?;
    client.subscribe(format!("{prefix}/agents/+/presence"), QoS::AtLeastOnce).await
}

pub fn spawn_mqtt_listener(kernel: Arc<Kernel>, client: AsyncClient, mut eventloop: EventLoop) -> JoinHandle<()> {
    tokio::spawn(async move {
        let prefix = kernel.config.mqtt.topic_prefix.clone();
        let mut demux = ConnectionDemux::new(
            kernel.pipeline.clone(),
            kernel.presence.clone(),
            kernel.config.agents.queue_depth,
        );
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!(host = %kernel.config.mqtt.host, "connected to broker");
                    kernel.health.mark_mqtt_connected();
                    if let Err(e) = subscribe(&client, &prefix).await {
                        error!(error = %e, "agent topic subscription failed");
                    }
                }
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    let Some((machine_id, channel)) = parse_agent_topic(&prefix, &publish.topic) else {
                        continue;
                    };
                    match channel {
                        AgentChannel::Up => demux.dispatch(machine_id, publish.payload.to_vec()),
                        AgentChannel::Presence => on_presence(&kernel, &mut demux, machine_id, &publish.payload),
                    }
                }
                Ok(Event::Incoming(Incoming::Disconnect)) => kernel.health.mark_mqtt_disconnected(),
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "MQTT connection error");
                    kernel.health.increment_reconnects();
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    })
}

fn on_presence(kernel: &Kernel, demux: &mut ConnectionDemux, machine_id: &str, payload: &[u8]) {
    match payload {
        b"online" => {
            kernel.presence.mark_seen(machine_id);
            info!(machine_id, "agent online");
        }
        b"offline" => {
            kernel.presence.mark_gone(machine_id);
            demux.disconnect(machine_id);
            if let Some(record) = kernel.cache.set_status(machine_id, MachineStatus::Offline) {
                kernel.bus.publish(topics::MACHINES_UPDATED, record.as_ref());
            }
            info!(machine_id, "agent offline");
        }
        other => debug!(machine_id, payload = %String::from_utf8_lossy(other), "unrecognised presence payload"),
    }
}

/// Marks machines offline after `offline_after` of silence, every `every`.
pub fn spawn_liveness_sweep(kernel: Arc<Kernel>, every: Duration, offline_after: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            sweep_liveness(&kernel, offline_after).await;
        }
    })
}

pub async fn sweep_liveness(kernel: &Kernel, offline_after: Duration) -> Vec<MachineId> {
    let cutoff = OffsetDateTime::now_utc() - offline_after;
    let expired = kernel.presence.expire(cutoff);
    if !expired.is_empty() {
        debug!(count = expired.len(), "silent connections dropped from presence");
    }
    let marked = kernel.cache.mark_offline_stale(cutoff);
    for machine_id in &marked {
        let _writes = kernel.cache.lock_writes(machine_id).await;
        // decommissioned since it was marked
        let Some(record) = kernel.cache.get(machine_id) else {
            continue;
        };
        kernel.bus.publish(topics::MACHINES_UPDATED, record.as_ref());
        if let Err(e) = kernel.gateway.upsert_machine(&record).await {
            warn!(machine_id = %machine_id, error = %e, "offline status not persisted");
        }
    }
    marked
}

/// Fails executions that ran past the timeout, every `every`.
pub fn spawn_job_sweep(kernel: Arc<Kernel>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            let expired = kernel.jobs.expire_overdue(OffsetDateTime::now_utc()).await;
            if expired > 0 {
                info!(expired, "overdue executions failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_topics() {
        assert_eq!(parse_agent_topic("sentinel", "sentinel/agents/m1/up"), Some(("m1", AgentChannel::Up)));
        assert_eq!(
            parse_agent_topic("sentinel", "sentinel/agents/m-2/presence"),
            Some(("m-2", AgentChannel::Presence))
        );
        assert_eq!(parse_agent_topic("sentinel", "sentinel/agents/m1/command"), None);
        assert_eq!(parse_agent_topic("sentinel", "sentinel/agents//up"), None);
        assert_eq!(parse_agent_topic("sentinel", "other/agents/m1/up"), None);
        assert_eq!(parse_agent_topic("sentinel", "sentinel/agents/m1/up/extra"), None);
    }
}
