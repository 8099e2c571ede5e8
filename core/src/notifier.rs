//! Outbound notification boundary.
//!
//! The engine decides WHETHER an alert may notify and supplies the
//! template key and variables. Rendering and delivery belong to the
//! implementation behind `Notifier`.

use crate::config::NotificationChannel;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub struct NotificationRequest {
    pub channel: NotificationChannel,
    /// Client id; the notifier resolves the contact address.
    pub recipient: String,
    pub template_key: String,
    pub variables: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sent {
    pub message_id: String,
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("Notification failed: {reason}")]
pub struct NotifyFailed {
    pub reason: String,
}

pub trait Notifier {
    fn send(&self, request: &NotificationRequest) -> Result<Sent, NotifyFailed>;
}

/// Writes every request to the log and reports it as sent.
/// Used by the runner when no transport is wired.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn send(&self, request: &NotificationRequest) -> Result<Sent, NotifyFailed> {
        log::info!(
            "notify {} via {}: {} {:?}",
            request.recipient,
            request.channel.as_str(),
            request.template_key,
            request.variables
        );
        Ok(Sent {
            message_id: crate::types::new_id("msg"),
        })
    }
}
