//! Alert and display delivery.
//!
//! The engine is delivery-agnostic: anything that can push a message to
//! a numbered channel implements [`Notifier`], and anything that can
//! re-render a numbered display implements [`DisplayRefresher`]. Sinks
//! that the collaborator reports as gone or forbidden are disabled with
//! an audit notice to the surviving audit channels.

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

use crate::db::{Status, StatusAlert, StatusDisplay, StatusQuery, Store};
use crate::query::JobError;

/// An error reported by a delivery collaborator.
#[derive(Error, Debug, Clone)]
pub enum DeliveryError {
    #[error("Channel or message no longer exists")]
    NotFound,
    #[error("Missing permission to deliver")]
    Forbidden,
    #[error("Delivery was rate limited")]
    RateLimited,
    #[error("Upstream service error: {0}")]
    Upstream(String),
    #[error("{0}")]
    Other(String),
}

impl DeliveryError {
    /// The sink itself is broken and should be disabled.
    pub fn disables_sink(&self) -> bool {
        matches!(self, DeliveryError::NotFound | DeliveryError::Forbidden)
    }

    /// The delivery channel as a whole is unavailable; retrying other
    /// sinks this cycle would only make it worse.
    pub fn is_outage(&self) -> bool {
        matches!(self, DeliveryError::RateLimited | DeliveryError::Upstream(_))
    }
}

/// A notification emitted by the engine.
#[derive(Debug, Clone)]
pub enum AlertEvent {
    QueryDisabled {
        label: String,
        kind: &'static str,
        address: String,
        reason: String,
    },
    DisplayDisabled {
        label: String,
        message_id: i64,
        reason: String,
    },
    AlertDisabled {
        label: String,
        channel_id: i64,
        reason: String,
    },
    DowntimeStarted {
        label: String,
        address: String,
    },
    DowntimeEnded {
        label: String,
        address: String,
    },
}

impl AlertEvent {
    /// Audit events go to audit sinks; downtime transitions go to
    /// downtime sinks.
    pub fn is_audit(&self) -> bool {
        !matches!(
            self,
            AlertEvent::DowntimeStarted { .. } | AlertEvent::DowntimeEnded { .. }
        )
    }
}

impl fmt::Display for AlertEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertEvent::QueryDisabled {
                label,
                kind,
                address,
                reason,
            } => write!(
                f,
                "{} query for {} ({}) was disabled: {}",
                kind, label, address, reason
            ),
            AlertEvent::DisplayDisabled {
                label,
                message_id,
                reason,
            } => write!(
                f,
                "Status display {} for {} was disabled: {}",
                message_id, label, reason
            ),
            AlertEvent::AlertDisabled {
                label,
                channel_id,
                reason,
            } => write!(
                f,
                "Alert channel {} for {} was disabled: {}",
                channel_id, label, reason
            ),
            AlertEvent::DowntimeStarted { label, address } => {
                write!(f, "{} ({}) appears to be down", label, address)
            }
            AlertEvent::DowntimeEnded { label, address } => {
                write!(f, "{} ({}) is back online", label, address)
            }
        }
    }
}

/// Pushes alert events to a numbered channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, channel_id: i64, event: &AlertEvent) -> Result<(), DeliveryError>;
}

/// Re-renders a numbered status display.
#[async_trait]
pub trait DisplayRefresher: Send + Sync {
    async fn refresh(&self, message_id: i64) -> Result<(), DeliveryError>;
}

/// Notifier that writes events to the log. Used when no external
/// delivery collaborator is wired up.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn deliver(&self, channel_id: i64, event: &AlertEvent) -> Result<(), DeliveryError> {
        tracing::info!("Alert for channel {}: {}", channel_id, event);
        Ok(())
    }
}

/// Display refresher that only logs.
pub struct LogDisplayRefresher;

#[async_trait]
impl DisplayRefresher for LogDisplayRefresher {
    async fn refresh(&self, message_id: i64) -> Result<(), DeliveryError> {
        tracing::debug!("Refreshing display {}", message_id);
        Ok(())
    }
}

/// Disable a query configuration and notify audit sinks.
pub async fn disable_query<N>(
    store: &Store,
    notifier: &N,
    status: &Status,
    query: &StatusQuery,
    reason: &str,
) -> Result<(), JobError>
where
    N: Notifier + ?Sized,
{
    tracing::warn!(
        "Disabling query #{} ({}): {}",
        query.status_query_id,
        query.address(),
        reason
    );
    store.disable_query(query.status_query_id, chrono::Utc::now())?;
    let event = AlertEvent::QueryDisabled {
        label: status.label.clone(),
        kind: query.kind.label(),
        address: query.address(),
        reason: reason.to_string(),
    };
    send_event(store, notifier, status, &event).await
}

/// Disable a display sink and notify audit sinks.
pub async fn disable_display<N>(
    store: &Store,
    notifier: &N,
    status: &Status,
    display: &StatusDisplay,
    reason: &str,
) -> Result<(), JobError>
where
    N: Notifier + ?Sized,
{
    let message_id = display.message_id;
    tracing::warn!("Disabling display {}: {}", message_id, reason);
    store.disable_display(message_id, chrono::Utc::now())?;
    let event = AlertEvent::DisplayDisabled {
        label: status.label.clone(),
        message_id: display.message_id,
        reason: reason.to_string(),
    };
    send_event(store, notifier, status, &event).await
}

pub async fn send_downtime_started<N>(
    store: &Store,
    notifier: &N,
    status: &Status,
) -> Result<(), JobError>
where
    N: Notifier + ?Sized,
{
    let event = AlertEvent::DowntimeStarted {
        label: status.label.clone(),
        address: status.address.clone().unwrap_or_default(),
    };
    tracing::info!("{}", event);
    send_event(store, notifier, status, &event).await
}

pub async fn send_downtime_ended<N>(
    store: &Store,
    notifier: &N,
    status: &Status,
) -> Result<(), JobError>
where
    N: Notifier + ?Sized,
{
    let event = AlertEvent::DowntimeEnded {
        label: status.label.clone(),
        address: status.address.clone().unwrap_or_default(),
    };
    tracing::info!("{}", event);
    send_event(store, notifier, status, &event).await
}

/// Deliver an event to every matching enabled sink.
///
/// Broken sinks are disabled as they are found; an outage aborts after
/// the remaining sinks have been attempted.
async fn send_event<N>(
    store: &Store,
    notifier: &N,
    status: &Status,
    event: &AlertEvent,
) -> Result<(), JobError>
where
    N: Notifier + ?Sized,
{
    let sinks = store.get_alert_sinks(status.status_id, event.is_audit())?;
    let mut outage = None;
    for sink in sinks {
        match notifier.deliver(sink.channel_id, event).await {
            Ok(()) => {}
            Err(e) if e.disables_sink() => {
                disable_alert(store, notifier, status, &sink, &e.to_string()).await?;
            }
            Err(e) if e.is_outage() => {
                if outage.is_none() {
                    outage = Some(e);
                }
            }
            Err(e) => {
                tracing::warn!("Failed to deliver to channel {}: {}", sink.channel_id, e);
            }
        }
    }
    match outage {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

/// Disable an alert sink and tell the surviving audit sinks about it.
///
/// The notice is delivered directly rather than through [`send_event`],
/// so a cascade of broken sinks cannot recurse.
async fn disable_alert<N>(
    store: &Store,
    notifier: &N,
    status: &Status,
    sink: &StatusAlert,
    reason: &str,
) -> Result<(), JobError>
where
    N: Notifier + ?Sized,
{
    tracing::warn!("Disabling alert channel {}: {}", sink.channel_id, reason);
    store.disable_alert(sink.status_alert_id, chrono::Utc::now())?;
    let event = AlertEvent::AlertDisabled {
        label: status.label.clone(),
        channel_id: sink.channel_id,
        reason: reason.to_string(),
    };
    for other in store.get_alert_sinks(status.status_id, true)? {
        match notifier.deliver(other.channel_id, &event).await {
            Ok(()) => {}
            Err(e) if e.is_outage() => return Err(e.into()),
            Err(e) => {
                tracing::warn!("Failed to deliver to channel {}: {}", other.channel_id, e);
            }
        }
    }
    Ok(())
}

/// Test notifier that records deliveries and can fail on demand.
#[cfg(test)]
#[derive(Default)]
pub struct RecordingNotifier {
    events: std::sync::Mutex<Vec<(i64, AlertEvent)>>,
    channel_failures: std::sync::Mutex<std::collections::HashMap<i64, DeliveryError>>,
    fail_all: Option<DeliveryError>,
}

#[cfg(test)]
impl RecordingNotifier {
    pub fn failing_with(error: DeliveryError) -> Self {
        Self {
            fail_all: Some(error),
            ..Default::default()
        }
    }

    pub fn fail_channel(&self, channel_id: i64, error: DeliveryError) {
        self.channel_failures
            .lock()
            .unwrap()
            .insert(channel_id, error);
    }

    pub fn events(&self) -> Vec<AlertEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(_, event)| event.clone())
            .collect()
    }

    pub fn channel_events(&self, channel_id: i64) -> Vec<AlertEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| *id == channel_id)
            .map(|(_, event)| event.clone())
            .collect()
    }
}

#[cfg(test)]
#[async_trait]
impl Notifier for RecordingNotifier {
    async fn deliver(&self, channel_id: i64, event: &AlertEvent) -> Result<(), DeliveryError> {
        if let Some(e) = &self.fail_all {
            return Err(e.clone());
        }
        if let Some(e) = self.channel_failures.lock().unwrap().get(&channel_id) {
            return Err(e.clone());
        }
        self.events
            .lock()
            .unwrap()
            .push((channel_id, event.clone()));
        Ok(())
    }
}
