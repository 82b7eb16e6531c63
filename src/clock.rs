use chrono::{DateTime, Utc};
use std::sync::Mutex;

/// Latch holding the timestamp of the most recently observed cloud command.
///
/// Seeded with "now" at construction so a freshly started process does not
/// report an outage before the first command has had a chance to arrive.
pub struct CommandClock {
    latest: Mutex<DateTime<Utc>>,
}

impl CommandClock {
    pub fn new() -> Self {
        Self {
            latest: Mutex::new(Utc::now()),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.latest.lock().unwrap() = at;
    }

    pub fn get(&self) -> DateTime<Utc> {
        *self.latest.lock().unwrap()
    }
}

impl Default for CommandClock {
    fn default() -> Self {
        Self::new()
    }
}
