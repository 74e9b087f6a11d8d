//! Lifecycle state machines for services and their tunnels.
//!
//! A [`StateMachine`] is the only writer of its state. Illegal transitions are
//! rejected rather than reordered, and every accepted transition is published
//! on the [`EventBus`].

use crate::config::ServiceId;
use crate::error::{Result, ServiceError};
use crate::events::{Event, EventBus};
use crate::models::{ServiceState, TunnelState};
use chrono::Utc;
use std::fmt::{Debug, Display};
use std::time::Duration;
use tokio::sync::watch;

pub trait Lifecycle: Copy + Eq + Default + Debug + Display + Send + Sync + 'static {
    fn can_transition_to(self, next: Self) -> bool;

    /// Event announcing `from -> to`; `detail` carries optional context such as a URL.
    fn event(service_id: &ServiceId, from: Self, to: Self, detail: Option<String>) -> Event;
}

impl Lifecycle for ServiceState {
    fn can_transition_to(self, next: Self) -> bool {
        use ServiceState::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Error)
                | (Running, Stopping)
                | (Running, Error)
                | (Stopping, Stopped)
                | (Error, Starting)
                | (Error, Stopped)
        )
    }

    fn event(service_id: &ServiceId, from: Self, to: Self, _detail: Option<String>) -> Event {
        Event::StateChanged {
            service_id: service_id.clone(),
            from,
            to,
            at: Utc::now(),
        }
    }
}

impl Lifecycle for TunnelState {
    fn can_transition_to(self, next: Self) -> bool {
        use TunnelState::*;
        matches!(
            (self, next),
            (Inactive, Connecting)
                | (Connecting, Active)
                | (Connecting, Error)
                | (Connecting, Inactive)
                | (Active, Inactive)
                | (Active, Error)
                | (Error, Inactive)
                | (Error, Connecting)
        )
    }

    fn event(service_id: &ServiceId, from: Self, to: Self, detail: Option<String>) -> Event {
        Event::TunnelChanged {
            service_id: service_id.clone(),
            from,
            to,
            public_url: detail,
            at: Utc::now(),
        }
    }
}

#[derive(Debug)]
pub struct StateMachine<S: Lifecycle> {
    service_id: ServiceId,
    state: watch::Sender<S>,
    bus: EventBus,
}

impl<S: Lifecycle> StateMachine<S> {
    pub fn new(service_id: ServiceId, bus: EventBus) -> Self {
        let (state, _) = watch::channel(S::default());
        Self {
            service_id,
            state,
            bus,
        }
    }

    pub fn current(&self) -> S {
        *self.state.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<S> {
        self.state.subscribe()
    }

    /// Move to `to` if legal from the current state; returns the previous state.
    pub(crate) fn transition(&self, to: S) -> Result<S> {
        self.transition_with(to, None)
    }

    pub(crate) fn transition_with(&self, to: S, detail: Option<String>) -> Result<S> {
        let mut from = S::default();
        let accepted = self.state.send_if_modified(|current| {
            from = *current;
            if current.can_transition_to(to) {
                *current = to;
                true
            } else {
                false
            }
        });
        if !accepted {
            return Err(ServiceError::InvalidState(format!(
                "{} cannot go from {from} to {to}",
                self.service_id
            )));
        }
        tracing::debug!(service_id = %self.service_id, %from, %to, "state transition");
        self.bus.publish(S::event(&self.service_id, from, to, detail));
        Ok(from)
    }

    /// Transition only when the current state is exactly `expected`.
    pub(crate) fn transition_from(&self, expected: S, to: S) -> bool {
        self.transition_from_with(expected, to, None)
    }

    pub(crate) fn transition_from_with(&self, expected: S, to: S, detail: Option<String>) -> bool {
        let accepted = self.state.send_if_modified(|current| {
            if *current == expected && current.can_transition_to(to) {
                *current = to;
                true
            } else {
                false
            }
        });
        if accepted {
            tracing::debug!(service_id = %self.service_id, from = %expected, %to, "state transition");
            self.bus.publish(S::event(&self.service_id, expected, to, detail));
        }
        accepted
    }

    /// Wait until the state satisfies `pred`, or give up after `timeout`.
    pub async fn wait_for<F>(&self, timeout: Duration, pred: F) -> Option<S>
    where
        F: Fn(S) -> bool,
    {
        let mut rx = self.state.subscribe();
        let reached = match tokio::time::timeout(timeout, rx.wait_for(|s| pred(*s))).await {
            Ok(Ok(state)) => Some(*state),
            _ => None,
        };
        reached
    }
}
