use crate::clock::CommandClock;
use crate::config::Config;
use crate::mqtt::{Broker, Message, MessageHandler};
use crate::outage_log::OutageLog;
use crate::plan::{OptimisationPlan, PlanError, PlanStore};
use crate::publisher::Publisher;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rumqttc::QoS;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

const DISCONNECT_GRACE: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Standby,
    Command,
}

/// The outage-detection and replay state machine.
///
/// Consumes plan and command messages from the broker, persists the latest
/// plan, and runs a periodic liveness check: when no cloud command has been
/// seen for longer than the outage threshold it enters command mode and
/// replays the stored plan, publishing the setpoint for whichever interval
/// covers the current wall-clock time. When commands resume it stands down.
pub struct StandbyService {
    cfg: Config,
    broker: Arc<dyn Broker>,
    plan_store: Arc<PlanStore>,
    clock: Arc<CommandClock>,
    publisher: Arc<Publisher>,
    outage_log: Arc<OutageLog>,
    mode: Mutex<Mode>,
    checker: Mutex<Option<JoinHandle<()>>>,
}

impl StandbyService {
    pub fn new(
        cfg: Config,
        broker: Arc<dyn Broker>,
        plan_store: Arc<PlanStore>,
        clock: Arc<CommandClock>,
        publisher: Arc<Publisher>,
        outage_log: Arc<OutageLog>,
    ) -> Self {
        Self {
            cfg,
            broker,
            plan_store,
            clock,
            publisher,
            outage_log,
            mode: Mutex::new(Mode::Standby),
            checker: Mutex::new(None),
        }
    }

    pub async fn start(self: Arc<Self>) -> Result<()> {
        self.broker
            .connect()
            .await
            .context("connecting to broker")?;

        let svc = Arc::clone(&self);
        self.subscribe_to_topic(
            &self.cfg.standby_topic,
            Arc::new(move |msg| svc.handle_plan_message(msg)),
        );
        let svc = Arc::clone(&self);
        self.subscribe_to_topic(
            &self.cfg.read_command_topic,
            Arc::new(move |msg| svc.handle_command_message(msg)),
        );

        let svc = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(svc.cfg.check_interval());
            loop {
                ticker.tick().await;
                svc.check_state(Utc::now());
            }
        });
        *self.checker.lock().unwrap() = Some(handle);

        self.outage_log.append("Service started", &[]);
        Ok(())
    }

    pub async fn stop(&self) {
        if let Err(err) = self.broker.disconnect(DISCONNECT_GRACE).await {
            tracing::warn!(error=%err, "disconnecting from broker");
        }
        let handle = self.checker.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.abort();
        }
        self.outage_log.append("Service stopped", &[]);
    }

    // A failed subscribe is tolerated at startup; the broker's reconnect
    // path retries the subscription.
    fn subscribe_to_topic(&self, topic: &str, handler: MessageHandler) {
        match self.broker.subscribe(topic, QoS::AtLeastOnce, handler) {
            Ok(()) => tracing::debug!(topic=%topic, "subscribed to topic"),
            Err(err) => {
                tracing::warn!(error=%err, topic=%topic, "failed to subscribe; reconnect will retry")
            }
        }
    }

    /// Any message on the read-command topic signifies cloud liveness; the
    /// payload itself is not parsed.
    pub fn handle_command_message(&self, msg: &Message) {
        tracing::debug!(topic=%msg.topic, "received cloud command");
        self.clock.set(Utc::now());
    }

    pub fn handle_plan_message(&self, msg: &Message) {
        tracing::debug!(topic=%msg.topic, bytes = msg.payload.len(), "received optimisation plan");

        let plan = match serde_json::from_slice::<OptimisationPlan>(&msg.payload) {
            Ok(plan) if plan.is_empty() => {
                self.publisher
                    .publish_error("reading optimisation plan", &PlanError::Empty);
                return;
            }
            Ok(plan) => plan,
            Err(err) => {
                self.publisher
                    .publish_error("reading optimisation plan", &PlanError::Decode(err));
                return;
            }
        };

        if let Err(err) = self.plan_store.write(&plan) {
            self.publisher
                .publish_error("writing optimisation plan", &err);
        }
    }

    /// One liveness check at wall-clock `now`. Runs on every tick of the
    /// checker task, and is called directly by tests.
    pub fn check_state(&self, now: DateTime<Utc>) {
        let since_last = (now - self.clock.get()).to_std().unwrap_or(Duration::ZERO);

        if since_last < self.cfg.outage_threshold() {
            let mut mode = self.mode.lock().unwrap();
            if *mode == Mode::Command {
                *mode = Mode::Standby;
                drop(mode);
                self.outage_log.append(
                    "Resumed standby mode",
                    &[("timeSinceLastCmd", format!("{since_last:?}"))],
                );
            }
            return;
        }

        {
            let mut mode = self.mode.lock().unwrap();
            if *mode == Mode::Standby {
                *mode = Mode::Command;
                drop(mode);
                self.outage_log.append(
                    "Entered command mode",
                    &[("timeSinceLastCmd", format!("{since_last:?}"))],
                );
            }
        }

        self.replay_current_interval(now);
    }

    fn replay_current_interval(&self, now: DateTime<Utc>) {
        let interval = match self.plan_store.current_interval(now) {
            Ok(interval) => interval,
            Err(err) => {
                self.outage_log.append("No command available", &[]);
                self.publisher.publish_error("getting current command", &err);
                return;
            }
        };

        if let Err(err) = self.publisher.publish_command(&interval) {
            self.publisher
                .publish_error("publishing current command", &err);
        }
        // The attempt is journaled even when the publish errored.
        self.outage_log.append(
            "Published command",
            &[
                (
                    "intervalStart",
                    interval.interval.start_time.seconds.to_string(),
                ),
                (
                    "intervalEnd",
                    interval.interval.end_time.seconds.to_string(),
                ),
                ("meterPower", interval.meter_power.value.to_string()),
            ],
        );
    }

    pub fn in_standby_mode(&self) -> bool {
        *self.mode.lock().unwrap() == Mode::Standby
    }

    pub fn in_command_mode(&self) -> bool {
        *self.mode.lock().unwrap() == Mode::Command
    }
}
