use crate::config::Config;
use crate::mqtt::Broker;
use crate::plan::OptimisationInterval;
use anyhow::{bail, Context, Result};
use chrono::Utc;
use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

pub const METER_POWER_UNIT_WATT: i32 = 1;
pub const METER_POWER_UNIT_KILOWATT: i32 = 2;
pub const METER_POWER_UNIT_MEGAWATT: i32 = 3;

const ERROR_CATEGORY_STANDBY: &str = "Standby";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandPayload {
    pub action: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub category: String,
    pub message: String,
    pub timestamp: i64,
}

/// Builds and publishes outbound setpoint commands and structured error
/// events.
pub struct Publisher {
    broker: Arc<dyn Broker>,
    write_command_topic: String,
    error_topic: String,
    command_action: String,
}

impl Publisher {
    pub fn new(config: &Config, broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            write_command_topic: config.write_command_topic.clone(),
            error_topic: config.error_topic.clone(),
            command_action: config.command_action.clone(),
        }
    }

    pub fn publish_command(&self, interval: &OptimisationInterval) -> Result<()> {
        if self.write_command_topic.is_empty() || self.command_action.is_empty() {
            bail!(
                "no command topic ({}) or action ({}) configured",
                self.write_command_topic,
                self.command_action
            );
        }

        let payload = build_command_payload(&self.command_action, interval);
        let encoded = serde_json::to_vec(&payload).context("encoding command payload")?;
        self.broker
            .publish(&self.write_command_topic, QoS::AtLeastOnce, false, encoded)
    }

    /// Best-effort error reporting: logs locally, and publishes an
    /// [`ErrorPayload`] when an error topic is configured. Never fails.
    pub fn publish_error(&self, message: &str, cause: &dyn fmt::Display) {
        tracing::error!(error=%cause, "{message}");

        if self.error_topic.is_empty() {
            tracing::error!("no error topic configured");
            return;
        }

        let payload = ErrorPayload {
            category: ERROR_CATEGORY_STANDBY.to_string(),
            message: format!("Error {message}: {cause}"),
            timestamp: Utc::now().timestamp(),
        };
        let encoded = match serde_json::to_vec(&payload) {
            Ok(encoded) => encoded,
            Err(err) => {
                tracing::error!(error=%err, "encoding error payload");
                return;
            }
        };

        let topic = format!("{}/{}", self.error_topic, payload.category);
        if let Err(err) = self
            .broker
            .publish(&topic, QoS::AtLeastOnce, false, encoded)
        {
            tracing::warn!(error=%err, topic=%topic, "failed to publish error event");
        }
    }
}

/// Convert the interval's meter power to kilowatts and pair it with the
/// configured action. Unknown units publish a zero value rather than failing.
pub fn build_command_payload(action: &str, interval: &OptimisationInterval) -> CommandPayload {
    let meter_value = interval.meter_power.value as f64;
    let value = match interval.meter_power.unit {
        METER_POWER_UNIT_WATT => meter_value / 1000.0,
        METER_POWER_UNIT_KILOWATT => meter_value,
        METER_POWER_UNIT_MEGAWATT => meter_value * 1000.0,
        _ => 0.0,
    };

    CommandPayload {
        action: action.to_string(),
        value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::testing::MockBroker;
    use crate::plan::{OptimisationInterval, OptimisationValue};

    fn interval_with_meter(value: f32, unit: i32) -> OptimisationInterval {
        OptimisationInterval {
            meter_power: OptimisationValue { value, unit },
            ..Default::default()
        }
    }

    fn test_config() -> Config {
        Config {
            write_command_topic: "cmd/site/handler/serial/standby".to_string(),
            error_topic: "dt/site/error/serial".to_string(),
            command_action: "SETPOINT".to_string(),
            ..Config::for_tests()
        }
    }

    #[test]
    fn builds_command_payloads_in_kilowatts() {
        let cases = [
            (1234.0_f32, METER_POWER_UNIT_WATT, 1.234),
            (1234.0, METER_POWER_UNIT_KILOWATT, 1234.0),
            (1.234, METER_POWER_UNIT_MEGAWATT, 1234.0),
            (1234.0, 7, 0.0),
        ];

        for (value, unit, expected) in cases {
            let payload = build_command_payload("actionvalue", &interval_with_meter(value, unit));
            assert_eq!(payload.action, "actionvalue");
            assert!(
                (payload.value - expected).abs() < 0.0001,
                "unit {unit}: got {}",
                payload.value
            );
        }
    }

    #[test]
    fn publishes_command_on_configured_topic() {
        let broker = Arc::new(MockBroker::new());
        let publisher = Publisher::new(&test_config(), broker.clone());

        publisher
            .publish_command(&interval_with_meter(400.0, METER_POWER_UNIT_KILOWATT))
            .unwrap();

        let published = broker.published();
        assert_eq!(published.len(), 1);
        let (topic, qos, retained, payload) = &published[0];
        assert_eq!(topic, "cmd/site/handler/serial/standby");
        assert_eq!(*qos, QoS::AtLeastOnce);
        assert!(!retained);
        let decoded: CommandPayload = serde_json::from_slice(payload).unwrap();
        assert_eq!(decoded.action, "SETPOINT");
        assert_eq!(decoded.value, 400.0);
    }

    #[test]
    fn refuses_when_topic_or_action_missing() {
        let broker = Arc::new(MockBroker::new());

        let mut config = test_config();
        config.write_command_topic = String::new();
        let publisher = Publisher::new(&config, broker.clone());
        assert!(publisher
            .publish_command(&interval_with_meter(1.0, METER_POWER_UNIT_KILOWATT))
            .is_err());

        let mut config = test_config();
        config.command_action = String::new();
        let publisher = Publisher::new(&config, broker.clone());
        assert!(publisher
            .publish_command(&interval_with_meter(1.0, METER_POWER_UNIT_KILOWATT))
            .is_err());

        assert!(broker.published().is_empty());
    }

    #[test]
    fn publishes_error_events_on_category_topic() {
        let broker = Arc::new(MockBroker::new());
        let publisher = Publisher::new(&test_config(), broker.clone());

        let before = Utc::now().timestamp();
        publisher.publish_error("reading optimisation plan", &"boom");
        let after = Utc::now().timestamp();

        let published = broker.published_on("dt/site/error/serial/Standby");
        assert_eq!(published.len(), 1);
        let decoded: ErrorPayload = serde_json::from_slice(&published[0]).unwrap();
        assert_eq!(decoded.category, "Standby");
        assert_eq!(decoded.message, "Error reading optimisation plan: boom");
        assert!(decoded.timestamp >= before && decoded.timestamp <= after);
    }

    #[test]
    fn error_publishing_is_best_effort() {
        let broker = Arc::new(MockBroker::failing_publish());
        let publisher = Publisher::new(&test_config(), broker);

        // Must not panic or surface anything.
        publisher.publish_error("publishing current command", &"queue full");
    }

    #[test]
    fn error_without_topic_only_logs() {
        let broker = Arc::new(MockBroker::new());
        let mut config = test_config();
        config.error_topic = String::new();
        let publisher = Publisher::new(&config, broker.clone());

        publisher.publish_error("getting current command", &"nope");
        assert!(broker.published().is_empty());
    }
}
