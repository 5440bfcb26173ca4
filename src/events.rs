//! Lifecycle event bus
//!
//! The core never calls a consumer directly. Order and position lifecycle
//! transitions are published as immutable snapshots over a broadcast
//! channel; notification bots, dashboards, and analytics subscribe and
//! keep up or lose the oldest events (they never block the engine).

use crate::order::Order;
use crate::position::Position;
use serde::Serialize;
use tokio::sync::broadcast;

/// Immutable lifecycle event carrying a full snapshot at emission time
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    OrderCreated { order: Order },
    OrderSubmitted { order: Order },
    OrderConfirmed { order: Order },
    OrderFailed { order: Order },
    PositionOpened { position: Position },
    PositionUpdated { position: Position },
    PositionClosed { position: Position },
}

impl Event {
    /// Event name as published to subscribers' logs
    pub fn name(&self) -> &'static str {
        match self {
            Event::OrderCreated { .. } => "order:created",
            Event::OrderSubmitted { .. } => "order:submitted",
            Event::OrderConfirmed { .. } => "order:confirmed",
            Event::OrderFailed { .. } => "order:failed",
            Event::PositionOpened { .. } => "position:opened",
            Event::PositionUpdated { .. } => "position:updated",
            Event::PositionClosed { .. } => "position:closed",
        }
    }
}

/// Cloneable publish/subscribe handle
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event. Fire-and-forget: no subscribers is not an error.
    pub fn publish(&self, event: Event) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
