//! Event bus for workflow observation
//!
//! The scheduler publishes typed events over a Tokio broadcast channel.
//! Observers (CLI streaming, tests) subscribe; publishing with no receivers
//! is not an error.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::registry::{NodeKind, Route};
use crate::state::{Slot, Verdict};

/// Channel capacity for broadcast
const CHANNEL_CAPACITY: usize = 256;

/// Every value `WorkflowEvent::event_type` can return
pub const EVENT_TYPES: [&str; 7] = [
    "run_started",
    "node_started",
    "node_completed",
    "node_failed",
    "patch_merged",
    "gate_decision",
    "run_completed",
];

/// All workflow events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// A run began
    RunStarted {
        run_id: String,
        nodes: usize,
        timestamp: DateTime<Utc>,
    },

    /// A node was dispatched to the worker pool
    NodeStarted {
        node: String,
        kind: NodeKind,
        iteration: u32,
        timestamp: DateTime<Utc>,
    },

    /// A node returned a patch
    NodeCompleted {
        node: String,
        kind: NodeKind,
        iteration: u32,
        elapsed_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A node errored, timed out or panicked
    NodeFailed {
        node: String,
        kind: NodeKind,
        iteration: u32,
        failure: String,
        message: String,
        timestamp: DateTime<Utc>,
    },

    /// A patch was merged into the state store
    PatchMerged {
        node: String,
        slots: Vec<Slot>,
        merges: u64,
        timestamp: DateTime<Utc>,
    },

    /// A router chose a route
    GateDecision {
        node: String,
        route: Route,
        iteration: u32,
        timestamp: DateTime<Utc>,
    },

    /// A run reached its terminal state
    RunCompleted {
        run_id: String,
        verdict: Verdict,
        score: f64,
        steps: usize,
        timestamp: DateTime<Utc>,
    },
}

impl WorkflowEvent {
    /// Get the event type as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run_started",
            Self::NodeStarted { .. } => "node_started",
            Self::NodeCompleted { .. } => "node_completed",
            Self::NodeFailed { .. } => "node_failed",
            Self::PatchMerged { .. } => "patch_merged",
            Self::GateDecision { .. } => "gate_decision",
            Self::RunCompleted { .. } => "run_completed",
        }
    }

    /// Node the event concerns, if any
    pub fn node(&self) -> Option<&str> {
        match self {
            Self::NodeStarted { node, .. }
            | Self::NodeCompleted { node, .. }
            | Self::NodeFailed { node, .. }
            | Self::PatchMerged { node, .. }
            | Self::GateDecision { node, .. } => Some(node),
            Self::RunStarted { .. } | Self::RunCompleted { .. } => None,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::RunStarted { timestamp, .. }
            | Self::NodeStarted { timestamp, .. }
            | Self::NodeCompleted { timestamp, .. }
            | Self::NodeFailed { timestamp, .. }
            | Self::PatchMerged { timestamp, .. }
            | Self::GateDecision { timestamp, .. }
            | Self::RunCompleted { timestamp, .. } => *timestamp,
        }
    }
}

/// Shared reference to EventBus
pub type SharedEventBus = Arc<EventBus>;

/// Broadcast event bus
pub struct EventBus {
    sender: broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Create a shared reference to this event bus
    pub fn shared(self) -> SharedEventBus {
        Arc::new(self)
    }

    /// Publish an event to all subscribers
    pub fn publish(&self, event: WorkflowEvent) {
        let event_type = event.event_type();
        // No receivers is OK
        if let Ok(count) = self.sender.send(event) {
            debug!(event_type, receivers = count, "Event published");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Event filter for selective subscription
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Filter by node id
    pub node: Option<String>,
    /// Filter by event types
    pub event_types: Option<Vec<String>>,
}

impl EventFilter {
    /// Create a new empty filter (matches all events)
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(mut self, node: &str) -> Self {
        self.node = Some(node.to_string());
        self
    }

    pub fn types(mut self, event_types: Vec<&str>) -> Self {
        self.event_types = Some(event_types.into_iter().map(String::from).collect());
        self
    }

    /// Parse `node=<id>,type=<event_type>,...`; `type` may repeat
    pub fn parse(raw: &str) -> Result<Self, String> {
        let mut filter = Self::new();
        for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| format!("expected key=value, got '{part}'"))?;
            let value = value.trim();
            match key.trim() {
                "node" => filter.node = Some(value.to_string()),
                "type" => {
                    if !EVENT_TYPES.contains(&value) {
                        return Err(format!(
                            "unknown event type '{value}' (expected one of: {})",
                            EVENT_TYPES.join(", ")
                        ));
                    }
                    filter
                        .event_types
                        .get_or_insert_with(Vec::new)
                        .push(value.to_string());
                }
                other => return Err(format!("unknown filter key '{other}'")),
            }
        }
        Ok(filter)
    }

    pub fn matches(&self, event: &WorkflowEvent) -> bool {
        if let Some(ref node) = self.node {
            if event.node() != Some(node.as_str()) {
                return false;
            }
        }

        if let Some(ref types) = self.event_types {
            if !types.iter().any(|t| t == event.event_type()) {
                return false;
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(node: &str) -> WorkflowEvent {
        WorkflowEvent::NodeStarted {
            node: node.to_string(),
            kind: NodeKind::Detective,
            iteration: 0,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        bus.publish(started("source_tree"));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_receives() {
        let bus = EventBus::new().shared();
        let mut rx = bus.subscribe();
        bus.publish(started("document"));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type(), "node_started");
        assert_eq!(event.node(), Some("document"));
    }

    #[test]
    fn test_event_serialization_tagged() {
        let json = serde_json::to_value(started("history")).unwrap();
        assert_eq!(json["type"], "node_started");
        assert_eq!(json["kind"], "detective");
    }

    #[test]
    fn test_filter() {
        let filter = EventFilter::new().node("document").types(vec!["node_started"]);
        assert!(filter.matches(&started("document")));
        assert!(!filter.matches(&started("history")));

        let completed = WorkflowEvent::RunCompleted {
            run_id: "r".into(),
            verdict: Verdict::Void,
            score: 0.0,
            steps: 0,
            timestamp: Utc::now(),
        };
        assert!(!EventFilter::new().node("document").matches(&completed));
        assert!(EventFilter::new().matches(&completed));
    }

    #[test]
    fn test_filter_parse() {
        let filter = EventFilter::parse("node=document, type=node_started,type=node_failed").unwrap();
        assert_eq!(filter.node.as_deref(), Some("document"));
        assert_eq!(
            filter.event_types,
            Some(vec!["node_started".to_string(), "node_failed".to_string()])
        );
        assert!(filter.matches(&started("document")));
        assert!(!filter.matches(&started("history")));

        let all = EventFilter::parse("").unwrap();
        assert!(all.node.is_none() && all.event_types.is_none());

        assert!(EventFilter::parse("type=node_exploded").is_err());
        assert!(EventFilter::parse("colour=red").is_err());
        assert!(EventFilter::parse("document").is_err());
    }

    #[test]
    fn test_event_types_cover_every_variant() {
        let completed = WorkflowEvent::RunCompleted {
            run_id: "r".into(),
            verdict: Verdict::Void,
            score: 0.0,
            steps: 0,
            timestamp: Utc::now(),
        };
        for event in [started("n"), completed] {
            assert!(EVENT_TYPES.contains(&event.event_type()));
        }
    }
}
