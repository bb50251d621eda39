use std::{collections::HashSet, time::Duration};

use axum::response::sse::{Event, KeepAlive};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::{wrappers::BroadcastStream, Stream, StreamExt};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Ingress,
    Reconcile,
    Notify,
    Storage,
}

impl StageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StageKind::Ingress => "ingress",
            StageKind::Reconcile => "reconcile",
            StageKind::Notify => "notify",
            StageKind::Storage => "storage",
        }
    }
}

#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub struct StageMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracking: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StageMetadata {
    fn is_empty(&self) -> bool {
        self.event_type.is_none()
            && self.tracking.is_none()
            && self.size_bytes.is_none()
            && self.latency_ms.is_none()
            && self.message.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StagePayload {
    pub redacted: bool,
    pub payload: Value,
}

impl Default for StagePayload {
    fn default() -> Self {
        Self {
            redacted: false,
            payload: Value::Null,
        }
    }
}

impl StagePayload {
    pub fn plain(payload: Value) -> Self {
        Self {
            redacted: false,
            payload,
        }
    }
}

/// Observation emitted by a processing stage for the debug tap.
#[derive(Debug, Clone, Serialize)]
pub struct StageEvent {
    pub ts: chrono::DateTime<chrono::Utc>,
    pub stage: StageKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(default, skip_serializing_if = "StageMetadata::is_empty")]
    pub meta: StageMetadata,
    pub r#in: StagePayload,
    pub out: StagePayload,
}

impl StageEvent {
    pub fn new(ts: chrono::DateTime<chrono::Utc>, stage: StageKind) -> Self {
        Self {
            ts,
            stage,
            order_id: None,
            meta: StageMetadata::default(),
            r#in: StagePayload::default(),
            out: StagePayload::default(),
        }
    }

    pub fn event_name(&self) -> &'static str {
        self.stage.as_str()
    }

    pub fn into_sse_event(self) -> Result<Event, serde_json::Error> {
        let event = Event::default().event(self.event_name());
        let data = serde_json::to_string(&self)?;
        Ok(event.data(data))
    }

    #[cfg(test)]
    pub fn mock(message: &str) -> Self {
        let mut event = Self::new(chrono::Utc::now(), StageKind::Storage);
        event.meta.message = Some(message.to_string());
        event.out = StagePayload::plain(serde_json::json!({ "message": message }));
        event
    }
}

#[derive(Clone)]
pub struct TapHub {
    sender: broadcast::Sender<StageEvent>,
}

impl TapHub {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(128);
        Self { sender }
    }

    /// Publishes an event. Having no subscribers is the normal case.
    pub fn publish(&self, event: StageEvent) {
        if self.sender.send(event).is_err() {
            debug!(stage = "tap", "no tap subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StageEvent> {
        self.sender.subscribe()
    }
}

#[derive(Debug, Clone, Default)]
pub struct TapFilter {
    stages: Option<HashSet<StageKind>>,
}

impl TapFilter {
    pub fn from_stages(stages: Option<HashSet<StageKind>>) -> Self {
        Self { stages }
    }

    pub fn matches(&self, event: &StageEvent) -> bool {
        match &self.stages {
            Some(stages) => stages.contains(&event.stage),
            None => true,
        }
    }
}

pub fn tap_stream(
    hub: TapHub,
    filter: TapFilter,
) -> impl Stream<Item = Result<Event, serde_json::Error>> + Send + 'static {
    BroadcastStream::new(hub.subscribe()).filter_map(move |result| match result {
        Ok(event) if filter.matches(&event) => Some(event.into_sse_event()),
        Ok(_) => None,
        Err(_) => None,
    })
}

pub fn tap_keep_alive() -> KeepAlive {
    KeepAlive::new()
        .interval(Duration::from_secs(20))
        .text("heartbeat")
}

pub fn parse_stage_list(value: Option<String>) -> Result<Option<HashSet<StageKind>>, String> {
    let Some(raw) = value else {
        return Ok(None);
    };
    let mut set = HashSet::new();
    for item in raw.split(',').filter(|s| !s.is_empty()) {
        let stage = match item.trim().to_lowercase().as_str() {
            "ingress" => StageKind::Ingress,
            "reconcile" => StageKind::Reconcile,
            "notify" => StageKind::Notify,
            "storage" => StageKind::Storage,
            other => {
                return Err(format!("unknown stage '{other}'"));
            }
        };
        set.insert(stage);
    }

    if set.is_empty() {
        Ok(None)
    } else {
        Ok(Some(set))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_stage_lists() {
        assert!(parse_stage_list(None).expect("none").is_none());
        assert!(parse_stage_list(Some(",".into())).expect("empty").is_none());

        let stages = parse_stage_list(Some("Ingress, reconcile".into()))
            .expect("parse")
            .expect("stages");
        assert!(stages.contains(&StageKind::Ingress));
        assert!(stages.contains(&StageKind::Reconcile));
        assert_eq!(stages.len(), 2);

        let err = parse_stage_list(Some("policy".into())).expect_err("unknown stage");
        assert!(err.contains("policy"));
    }

    #[test]
    fn filter_matches_selected_stages() {
        let filter = TapFilter::from_stages(Some(HashSet::from([StageKind::Notify])));
        assert!(filter.matches(&StageEvent::new(chrono::Utc::now(), StageKind::Notify)));
        assert!(!filter.matches(&StageEvent::new(chrono::Utc::now(), StageKind::Ingress)));
        assert!(TapFilter::default().matches(&StageEvent::mock("x")));
    }

    #[test]
    fn serializes_without_empty_metadata() {
        let event = StageEvent::new(chrono::Utc::now(), StageKind::Reconcile);
        let value = serde_json::to_value(&event).expect("serialize");
        assert!(value.get("meta").is_none());
        assert!(value.get("order_id").is_none());
        assert_eq!(value["stage"], "reconcile");
    }
}
