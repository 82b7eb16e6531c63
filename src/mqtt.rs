use crate::config::Config;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Decoded inbound publish handed to a subscription handler.
#[derive(Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
}

pub type MessageHandler = Arc<dyn Fn(&Message) + Send + Sync>;

/// Narrow gateway to the pub-sub broker. The standby service only talks to
/// the broker through this trait so tests can substitute an in-memory mock.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Establish the connection; resolves once the broker acknowledges it.
    async fn connect(&self) -> Result<()>;

    /// Register `handler` for `filter` and issue the subscribe. Handlers for
    /// a given subscription are invoked in delivery order.
    fn subscribe(&self, filter: &str, qos: QoS, handler: MessageHandler) -> Result<()>;

    fn publish(&self, topic: &str, qos: QoS, retained: bool, payload: Vec<u8>) -> Result<()>;

    /// Disconnect with a bounded grace period for in-flight requests.
    async fn disconnect(&self, grace: Duration) -> Result<()>;
}

type Subscription = (String, QoS, MessageHandler);

pub struct RumqttBroker {
    client: AsyncClient,
    eventloop: Mutex<Option<EventLoop>>,
    subscriptions: Arc<Mutex<Vec<Subscription>>>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl RumqttBroker {
    pub fn new(config: &Config) -> Self {
        let client_id = format!("standby-controller-{}", config.serial_number);
        let mut options = MqttOptions::new(client_id, config.mqtt_host.clone(), config.mqtt_port);
        options.set_clean_session(true);
        options.set_keep_alive(Duration::from_secs(30));

        let (client, eventloop) = AsyncClient::new(options, 64);
        Self {
            client,
            eventloop: Mutex::new(Some(eventloop)),
            subscriptions: Arc::new(Mutex::new(Vec::new())),
            poller: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Broker for RumqttBroker {
    async fn connect(&self) -> Result<()> {
        let taken = self.eventloop.lock().unwrap().take();
        let mut eventloop = taken.ok_or_else(|| anyhow!("broker already connected"))?;

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => break,
                Ok(_) => continue,
                Err(err) => return Err(err).context("connecting to MQTT broker"),
            }
        }
        tracing::info!("connected to MQTT broker");

        let client = self.client.clone();
        let subscriptions = self.subscriptions.clone();
        let handle = tokio::spawn(async move {
            dispatch_loop(eventloop, client, subscriptions).await;
        });
        *self.poller.lock().unwrap() = Some(handle);
        Ok(())
    }

    fn subscribe(&self, filter: &str, qos: QoS, handler: MessageHandler) -> Result<()> {
        self.subscriptions
            .lock()
            .unwrap()
            .push((filter.to_string(), qos, handler));
        self.client
            .try_subscribe(filter, qos)
            .with_context(|| format!("subscribing to {filter}"))?;
        Ok(())
    }

    fn publish(&self, topic: &str, qos: QoS, retained: bool, payload: Vec<u8>) -> Result<()> {
        self.client
            .try_publish(topic, qos, retained, payload)
            .with_context(|| format!("publishing to {topic}"))?;
        Ok(())
    }

    async fn disconnect(&self, grace: Duration) -> Result<()> {
        self.client
            .try_disconnect()
            .context("requesting broker disconnect")?;
        sleep(grace).await;

        let handle = self.poller.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.abort();
        }
        Ok(())
    }
}

/// Owns the event loop after the initial CONNACK: dispatches inbound
/// publishes to matching handlers, re-subscribes after a reconnect, and
/// loop-sleeps on connection errors while rumqttc re-establishes the session.
async fn dispatch_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    subscriptions: Arc<Mutex<Vec<Subscription>>>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                let message = Message {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                };
                let handlers: Vec<MessageHandler> = subscriptions
                    .lock()
                    .unwrap()
                    .iter()
                    .filter(|(filter, _, _)| topic_matches(filter, &message.topic))
                    .map(|(_, _, handler)| handler.clone())
                    .collect();
                for handler in handlers {
                    handler(&message);
                }
            }
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                tracing::info!("MQTT session re-established");
                let filters: Vec<(String, QoS)> = subscriptions
                    .lock()
                    .unwrap()
                    .iter()
                    .map(|(filter, qos, _)| (filter.clone(), *qos))
                    .collect();
                for (filter, qos) in filters {
                    if let Err(err) = client.try_subscribe(&filter, qos) {
                        tracing::warn!(error=%err, topic=%filter, "failed to re-subscribe");
                    }
                }
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(error=%err, "MQTT connection lost; retrying");
                sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// MQTT topic filter matching with `+` (single level) and a trailing `#`
/// (remaining levels).
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_parts = filter.split('/');
    let mut topic_parts = topic.split('/');

    loop {
        match (filter_parts.next(), topic_parts.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(expected), Some(actual)) if expected == actual => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_topics_match() {
        assert!(topic_matches(
            "cmd/site/handler/serial/cloud",
            "cmd/site/handler/serial/cloud"
        ));
        assert!(!topic_matches(
            "cmd/site/handler/serial/cloud",
            "cmd/site/handler/serial/standby"
        ));
    }

    #[test]
    fn single_level_wildcard_matches_one_level() {
        assert!(topic_matches("cmd/+/standby", "cmd/site/standby"));
        assert!(!topic_matches("cmd/+/standby", "cmd/site/extra/standby"));
    }

    #[test]
    fn trailing_hash_matches_remaining_levels() {
        assert!(topic_matches(
            "cmd/site/standby/serial/#",
            "cmd/site/standby/serial/plan"
        ));
        assert!(topic_matches(
            "cmd/site/standby/serial/#",
            "cmd/site/standby/serial/plan/v2"
        ));
        assert!(!topic_matches(
            "cmd/site/standby/serial/#",
            "cmd/site/other/serial/plan"
        ));
    }

    #[test]
    fn length_mismatch_does_not_match() {
        assert!(!topic_matches("cmd/site", "cmd/site/extra"));
        assert!(!topic_matches("cmd/site/extra", "cmd/site"));
    }
}
