//! Notification sinks
//!
//! This module provides:
//! - [`Notifier`] - sink receiving one message per comparison
//! - [`SlackNotifier`] - posts to a Slack incoming webhook
//! - [`LogNotifier`] - emits messages as log events only

mod slack;

use async_trait::async_trait;
use tracing::info;

pub use slack::SlackNotifier;

/// Notification errors
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    /// Transport failure
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The sink answered with a non-success status
    #[error("notification rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
}

/// Sink for comparison messages
#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    async fn send(&self, message: &str) -> Result<(), NotifyError>;
}

/// Notifier writing messages to the log
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, message: &str) -> Result<(), NotifyError> {
        info!(notification = %message, "Comparison notification");
        Ok(())
    }
}
