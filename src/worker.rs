use crate::standby::StandbyService;
use anyhow::{Context, Result};
use std::sync::Arc;

/// Thin lifecycle wrapper around the standby service; owns start/stop for the
/// process entry point.
pub struct Worker {
    standby: Arc<StandbyService>,
}

impl Worker {
    pub fn new(standby: Arc<StandbyService>) -> Self {
        Self { standby }
    }

    pub async fn start(&self) -> Result<()> {
        self.standby
            .clone()
            .start()
            .await
            .context("running standby service")
    }

    pub async fn stop(&self) {
        self.standby.stop().await;
    }
}
