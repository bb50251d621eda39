use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// Label used when a delivery omits its `type` field.
pub const UNKNOWN_EVENT_TYPE: &str = "unknown";

/// Errors that can occur while parsing a carrier webhook delivery.
#[derive(Debug, Error)]
pub enum NormalizerError {
    #[error("failed to parse payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("payload must be a JSON object")]
    NotAnObject,
}

/// One actionable status change extracted from a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParcelUpdate {
    pub tracking: String,
    pub status: String,
    pub reason: Option<String>,
}

/// Result of normalizing a delivery batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedBatch {
    pub event_type: String,
    pub updates: Vec<ParcelUpdate>,
    /// Events that carried no tracking number or no status.
    pub skipped: usize,
}

impl NormalizedBatch {
    /// Total number of events present in the delivery.
    pub fn event_count(&self) -> usize {
        self.updates.len() + self.skipped
    }
}

/// Parses Yalidine webhook bodies into [`NormalizedBatch`] values.
pub struct Normalizer;

impl Normalizer {
    /// Parses the raw request body.
    pub fn normalize_bytes(body: &[u8]) -> Result<NormalizedBatch, NormalizerError> {
        let value: Value = serde_json::from_slice(body)?;
        Self::normalize(&value)
    }

    /// Converts an already decoded payload.
    ///
    /// Events are kept in delivery order. An event is actionable when both
    /// `data.tracking` and `data.status` are present and non-blank; events that
    /// do not have that shape count as skipped instead of failing the batch.
    pub fn normalize(payload: &Value) -> Result<NormalizedBatch, NormalizerError> {
        if !payload.is_object() {
            return Err(NormalizerError::NotAnObject);
        }
        let delivery: DeliveryPayload = serde_json::from_value(payload.clone())?;

        let mut updates = Vec::with_capacity(delivery.events.len());
        let mut skipped = 0;
        for event in delivery.events {
            let Ok(EventPayload { data: Some(data) }) = serde_json::from_value(event) else {
                skipped += 1;
                continue;
            };
            match (non_blank(data.tracking), non_blank(data.status)) {
                (Some(tracking), Some(status)) => updates.push(ParcelUpdate {
                    tracking,
                    status,
                    reason: non_blank(data.reason),
                }),
                _ => skipped += 1,
            }
        }

        Ok(NormalizedBatch {
            event_type: non_blank(delivery.event_type)
                .unwrap_or_else(|| UNKNOWN_EVENT_TYPE.to_string()),
            updates,
            skipped,
        })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|raw| raw.trim().to_string())
        .filter(|trimmed| !trimmed.is_empty())
}

#[derive(Debug, Deserialize)]
struct DeliveryPayload {
    #[serde(rename = "type", default)]
    event_type: Option<String>,
    #[serde(default)]
    events: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct EventPayload {
    #[serde(default)]
    data: Option<EventData>,
}

#[derive(Debug, Deserialize)]
struct EventData {
    #[serde(default)]
    tracking: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}
