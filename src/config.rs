use anyhow::{anyhow, bail, Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone)]
pub struct Config {
    pub site_name: String,
    pub serial_number: String,
    pub logging_level: String,

    pub broker_url: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub write_command_topic: String,
    pub read_command_topic: String,
    pub standby_topic: String,
    pub error_topic: String,
    pub command_action: String,

    pub backup_file: PathBuf,
    pub check_interval_secs: u64,
    pub outage_threshold_secs: u64,
    pub outage_log_file: PathBuf,
}

/// Optional per-key overrides read from the YAML file at
/// `CONFIGURATION_PATH`. Values present in the file win over the
/// env-provided base.
#[derive(Debug, Default, Deserialize)]
pub struct FileOverrides {
    #[serde(default)]
    logging: LoggingOverrides,
    #[serde(default)]
    mqtt: MqttOverrides,
    #[serde(default)]
    standby: StandbyOverrides,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingOverrides {
    level: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct MqttOverrides {
    broker_url: Option<String>,
    write_command_topic: Option<String>,
    read_command_topic: Option<String>,
    standby_topic: Option<String>,
    error_topic: Option<String>,
    command_action: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StandbyOverrides {
    backup_file: Option<String>,
    check_interval_seconds: Option<u64>,
    outage_threshold_seconds: Option<u64>,
    outage_log_file: Option<String>,
}

impl FileOverrides {
    fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading configuration file {}", path.display()))?;
        let parsed = serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing configuration file {}", path.display()))?;
        Ok(Some(parsed))
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let site_name = env_string("SITE_NAME", None)?;
        let serial_number = env_string("SERIAL_NUMBER", None)?;

        let configuration_path = env_string("CONFIGURATION_PATH", Some("config.yaml".to_string()))?;
        let overrides =
            FileOverrides::load(Path::new(&configuration_path))?.unwrap_or_default();

        let logging_level = overrides
            .logging
            .level
            .map(Ok)
            .unwrap_or_else(|| env_string("LOGGING_LEVEL", Some("info".to_string())))?;

        let broker_url = overrides
            .mqtt
            .broker_url
            .map(Ok)
            .unwrap_or_else(|| {
                env_string("MQTT_BROKER_URL", Some("tcp://localhost:1883/".to_string()))
            })?;
        let (mqtt_host, mqtt_port) = parse_broker_url(&broker_url)?;

        let write_command_topic = overrides.mqtt.write_command_topic.map(Ok).unwrap_or_else(|| {
            env_string(
                "MQTT_WRITE_COMMAND_TOPIC",
                Some("cmd/${SITE_NAME}/handler/${SERIAL_NUMBER}/standby".to_string()),
            )
        })?;
        let read_command_topic = overrides.mqtt.read_command_topic.map(Ok).unwrap_or_else(|| {
            env_string(
                "MQTT_READ_COMMAND_TOPIC",
                Some("cmd/${SITE_NAME}/handler/${SERIAL_NUMBER}/cloud".to_string()),
            )
        })?;
        let standby_topic = overrides.mqtt.standby_topic.map(Ok).unwrap_or_else(|| {
            env_string(
                "MQTT_STANDBY_TOPIC",
                Some("cmd/${SITE_NAME}/standby/${SERIAL_NUMBER}/#".to_string()),
            )
        })?;
        let error_topic = overrides.mqtt.error_topic.map(Ok).unwrap_or_else(|| {
            env_string(
                "MQTT_ERROR_TOPIC",
                Some("dt/${SITE_NAME}/error/${SERIAL_NUMBER}".to_string()),
            )
        })?;
        let command_action = overrides.mqtt.command_action.map(Ok).unwrap_or_else(|| {
            env_string("MQTT_COMMAND_ACTION", Some("SETPOINT".to_string()))
        })?;

        let backup_file = overrides.standby.backup_file.map(Ok).unwrap_or_else(|| {
            env_string("STANDBY_BACKUP_FILE", Some("plan.json".to_string()))
        })?;
        let check_interval_secs = match overrides.standby.check_interval_seconds {
            Some(value) => value,
            None => env_u64("STANDBY_CHECK_INTERVAL_SECONDS", Some(60))?,
        };
        let outage_threshold_secs = match overrides.standby.outage_threshold_seconds {
            Some(value) => value,
            None => env_u64("STANDBY_OUTAGE_THRESHOLD_SECONDS", Some(180))?,
        };
        let outage_log_file = match overrides.standby.outage_log_file {
            Some(value) => value,
            None => env_string("STANDBY_OUTAGE_LOG_FILE", Some(String::new()))?,
        };

        if check_interval_secs == 0 {
            bail!("standby.check_interval_seconds must be positive");
        }
        if outage_log_file.is_empty() {
            bail!("standby.outage_log_file is required");
        }

        Ok(Self {
            write_command_topic: interpolate_topic(&write_command_topic, &site_name, &serial_number),
            read_command_topic: interpolate_topic(&read_command_topic, &site_name, &serial_number),
            standby_topic: interpolate_topic(&standby_topic, &site_name, &serial_number),
            error_topic: interpolate_topic(&error_topic, &site_name, &serial_number),
            site_name,
            serial_number,
            logging_level,
            broker_url,
            mqtt_host,
            mqtt_port,
            command_action,
            backup_file: PathBuf::from(backup_file),
            check_interval_secs,
            outage_threshold_secs,
            outage_log_file: PathBuf::from(outage_log_file),
        })
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn outage_threshold(&self) -> Duration {
        Duration::from_secs(self.outage_threshold_secs)
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self {
            site_name: "site".to_string(),
            serial_number: "serial".to_string(),
            logging_level: "debug".to_string(),
            broker_url: "tcp://localhost:1883/".to_string(),
            mqtt_host: "localhost".to_string(),
            mqtt_port: 1883,
            write_command_topic: "cmd/site/handler/serial/standby".to_string(),
            read_command_topic: "cmd/site/handler/serial/cloud".to_string(),
            standby_topic: "cmd/site/standby/serial/plan".to_string(),
            error_topic: "dt/site/error/serial".to_string(),
            command_action: "SETPOINT".to_string(),
            backup_file: PathBuf::from("plan.json"),
            check_interval_secs: 1,
            outage_threshold_secs: 2,
            outage_log_file: PathBuf::from("outage.log"),
        }
    }
}

/// Literal `${SITE_NAME}` / `${SERIAL_NUMBER}` substitution in topic strings.
fn interpolate_topic(topic: &str, site_name: &str, serial_number: &str) -> String {
    topic
        .replace("${SITE_NAME}", site_name)
        .replace("${SERIAL_NUMBER}", serial_number)
}

fn parse_broker_url(broker_url: &str) -> Result<(String, u16)> {
    let url = Url::parse(broker_url).with_context(|| format!("invalid broker URL {broker_url}"))?;
    let host = url
        .host_str()
        .ok_or_else(|| anyhow!("broker URL {broker_url} missing host"))?
        .to_string();
    let port = url.port().unwrap_or(1883);
    Ok((host, port))
}

fn env_string(key: &str, default: Option<String>) -> Result<String> {
    match env::var(key) {
        Ok(value) => Ok(value.trim().to_string()),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_u64(key: &str, default: Option<u64>) -> Result<u64> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .with_context(|| format!("invalid {key}")),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}
