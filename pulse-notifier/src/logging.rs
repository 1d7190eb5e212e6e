use crate::{AlertChannel, Notification};
use async_trait::async_trait;
use pulse_core::{Result, Severity};
use tracing::{error, info, warn};

/// Writes alerts to the process log.
#[derive(Debug, Clone)]
pub struct LogChannel {
    enabled: bool,
}

impl LogChannel {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }
}

#[async_trait]
impl AlertChannel for LogChannel {
    async fn send(&self, notification: &Notification) -> Result<()> {
        match notification.severity {
            Severity::Critical => error!(
                alert_id = %notification.id,
                "ALERT {}: {}", notification.title, notification.message
            ),
            Severity::High | Severity::Medium => warn!(
                alert_id = %notification.id,
                "ALERT {}: {}", notification.title, notification.message
            ),
            Severity::Low => info!(
                alert_id = %notification.id,
                "ALERT {}: {}", notification.title, notification.message
            ),
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }
}
