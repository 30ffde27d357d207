//! Rollout notifications.
//!
//! Fire-and-forget delivery of rollout lifecycle events to a webhook.
//!
//! ```no_run
//! use notify::{Notifier, NotifyEvent};
//!
//! # async fn example() {
//! let notifier = Notifier::from_url(Some("https://hooks.example.com/rollout".to_string()));
//! notifier.notify(NotifyEvent::RunStarted {
//!     run_id: "3f2c9a1e".to_string(),
//!     environment: "staging".to_string(),
//!     component: "infrastructure".to_string(),
//!     target_version: Some("1.29.0".to_string()),
//!     dry_run: false,
//!     timestamp: chrono::Utc::now(),
//! });
//! # }
//! ```
//!
//! Set `NOTIFY_DISABLED=true` to turn every channel off.

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod channels;
pub mod error;
pub mod events;

pub use channels::webhook::WebhookChannel;
pub use channels::NotifyChannel;
pub use error::ChannelError;
pub use events::{NotifyEvent, Severity};

use std::sync::Arc;
use tracing::{debug, error, info};

/// Environment variable to disable all notifications.
const ENV_NOTIFY_DISABLED: &str = "NOTIFY_DISABLED";

/// Central notification dispatcher.
pub struct Notifier {
    channels: Vec<Arc<dyn NotifyChannel>>,
    disabled: bool,
}

impl Notifier {
    /// Notifier for an optional webhook URL.
    #[must_use]
    pub fn from_url(webhook_url: Option<String>) -> Self {
        let disabled = std::env::var(ENV_NOTIFY_DISABLED)
            .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
            .unwrap_or(false);
        if disabled {
            info!("Notifications disabled via NOTIFY_DISABLED");
            return Self::disabled();
        }

        let webhook = WebhookChannel::from_url(webhook_url);
        if webhook.enabled() {
            info!("Webhook notifications enabled");
            Self::with_channels(vec![Arc::new(webhook)])
        } else {
            debug!("No notification webhook configured");
            Self::with_channels(vec![])
        }
    }

    /// Create a notifier with specific channels.
    #[must_use]
    pub fn with_channels(channels: Vec<Arc<dyn NotifyChannel>>) -> Self {
        Self {
            channels,
            disabled: false,
        }
    }

    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            channels: vec![],
            disabled: true,
        }
    }

    #[must_use]
    pub fn has_channels(&self) -> bool {
        !self.disabled && !self.channels.is_empty()
    }

    /// Send to all enabled channels without waiting.
    ///
    /// Errors are logged, never returned.
    pub fn notify(&self, event: NotifyEvent) {
        if !self.has_channels() {
            debug!("No active channels, skipping event");
            return;
        }

        let event = Arc::new(event);
        for channel in &self.channels {
            let channel = Arc::clone(channel);
            let event = Arc::clone(&event);

            tokio::spawn(async move {
                let channel_name = channel.name();
                if !channel.enabled() {
                    return;
                }
                match channel.send(&event).await {
                    Ok(()) => debug!(channel = channel_name, "Notification sent"),
                    Err(e) => error!(
                        channel = channel_name,
                        error = %e,
                        "Failed to send notification"
                    ),
                }
            });
        }
    }

    /// Send and wait for every channel.
    ///
    /// Used for the final event of a process, which would otherwise exit
    /// before a spawned send completes.
    pub async fn notify_and_wait(&self, event: NotifyEvent) -> Vec<(String, Result<(), ChannelError>)> {
        if !self.has_channels() {
            return vec![];
        }

        let mut results = vec![];
        for channel in &self.channels {
            let result = channel.send(&event).await;
            if let Err(e) = &result {
                error!(channel = channel.name(), error = %e, "Failed to send notification");
            }
            results.push((channel.name().to_string(), result));
        }
        results
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::disabled()
    }
}
