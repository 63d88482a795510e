use serde::{Deserialize, Serialize};

/// Notifications emitted by a [`crate::TraceTree`] to its subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TraceTreeEvent {
    /// Fetched spans pushed the trace bounds outward. Carries the new
    /// `[start, duration]` in milliseconds.
    TimelineChange { start: f64, duration: f64 },
}

impl TraceTreeEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TraceTreeEvent::TimelineChange { .. } => "trace timeline change",
        }
    }
}
