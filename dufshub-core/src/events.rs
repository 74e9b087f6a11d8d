//! In-process publish/subscribe bus decoupling the supervisor from its front-ends.
//!
//! Every event goes through one broadcast channel, so all subscribers observe the
//! same total order; per-topic order is publish order. Delivery is in-memory only.

use crate::config::ServiceId;
use crate::error::ErrorKind;
use crate::models::{LogLine, ServiceState, TunnelState};
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const BUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    State,
    Tunnel,
    Log,
    Collection,
    Config,
    Notice,
}

impl Topic {
    pub fn name(self) -> &'static str {
        match self {
            Topic::State => "service.state_changed",
            Topic::Tunnel => "service.tunnel_changed",
            Topic::Log => "service.log",
            Topic::Collection => "service.collection",
            Topic::Config => "config.saved",
            Topic::Notice => "app.notice",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    StateChanged {
        service_id: ServiceId,
        from: ServiceState,
        to: ServiceState,
        at: DateTime<Utc>,
    },
    TunnelChanged {
        service_id: ServiceId,
        from: TunnelState,
        to: TunnelState,
        public_url: Option<String>,
        at: DateTime<Utc>,
    },
    LogLine {
        service_id: ServiceId,
        line: LogLine,
    },
    ServiceAdded {
        service_id: ServiceId,
    },
    ServiceEdited {
        service_id: ServiceId,
    },
    ServiceRemoved {
        service_id: ServiceId,
    },
    ConfigSaved {
        at: DateTime<Utc>,
    },
    /// Non-fatal failure the user should hear about (e.g. unsaved changes).
    Notice {
        service_id: Option<ServiceId>,
        kind: ErrorKind,
        message: String,
    },
}

impl Event {
    pub fn topic(&self) -> Topic {
        match self {
            Event::StateChanged { .. } => Topic::State,
            Event::TunnelChanged { .. } => Topic::Tunnel,
            Event::LogLine { .. } => Topic::Log,
            Event::ServiceAdded { .. } | Event::ServiceEdited { .. } | Event::ServiceRemoved { .. } => {
                Topic::Collection
            }
            Event::ConfigSaved { .. } => Topic::Config,
            Event::Notice { .. } => Topic::Notice,
        }
    }

    pub fn service_id(&self) -> Option<&ServiceId> {
        match self {
            Event::StateChanged { service_id, .. }
            | Event::TunnelChanged { service_id, .. }
            | Event::LogLine { service_id, .. }
            | Event::ServiceAdded { service_id }
            | Event::ServiceEdited { service_id }
            | Event::ServiceRemoved { service_id } => Some(service_id),
            Event::Notice { service_id, .. } => service_id.as_ref(),
            Event::ConfigSaved { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Publishing with no subscribers is not an error.
    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    /// Register a callback for one topic. Must be called inside a tokio runtime.
    ///
    /// The receiver is attached before this returns, so no event published
    /// afterwards is missed. Dropping the [`Subscription`] unsubscribes.
    pub fn subscribe<F>(&self, topic: Topic, mut callback: F) -> Subscription
    where
        F: FnMut(Event) + Send + 'static,
    {
        let mut rx = self.tx.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) if event.topic() == topic => callback(event),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(topic = topic.name(), dropped = n, "event subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Subscription { handle }
    }

    /// All events as an async stream, for consumers that drive their own loop.
    pub fn stream(&self) -> BoxStream<'static, Event> {
        let mut rx = self.tx.subscribe();
        let stream = async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(dropped = n, "event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };
        Box::pin(stream)
    }
}

/// Handle for a callback subscription; unsubscribes on drop.
#[derive(Debug)]
pub struct Subscription {
    handle: JoinHandle<()>,
}

impl Subscription {
    pub fn cancel(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
