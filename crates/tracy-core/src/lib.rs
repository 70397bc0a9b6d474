use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod extract;

pub use extract::{PayloadExtractor, TagExtractor, TagKind, TagMetadata};

/// Raw text and method recorded for requests that were never captured on the wire.
pub const GENERATED_SENTINEL: &str = "GENERATED";

/// A request as it arrives from a transport, before the store assigns identifiers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewRequest {
    pub raw_request: String,
    pub request_url: String,
    pub request_method: String,
    pub tracers: Vec<NewTracer>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewTracer {
    pub tracer_string: String,
}

impl NewRequest {
    /// Builds the synthetic request used for tracers produced client-side.
    pub fn generated(tracer_string: impl Into<String>, request_url: impl Into<String>) -> Self {
        Self {
            raw_request: GENERATED_SENTINEL.to_string(),
            request_url: request_url.into(),
            request_method: GENERATED_SENTINEL.to_string(),
            tracers: vec![NewTracer {
                tracer_string: tracer_string.into(),
            }],
        }
    }

    pub fn tracer_strings(&self) -> impl Iterator<Item = &str> {
        self.tracers.iter().map(|tracer| tracer.tracer_string.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Request {
    pub id: i64,
    pub raw_request: String,
    pub request_url: String,
    pub request_method: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub tracers: Vec<Tracer>,
}

impl Request {
    pub fn is_generated(&self) -> bool {
        self.raw_request == GENERATED_SENTINEL && self.request_method == GENERATED_SENTINEL
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tracer {
    pub id: i64,
    pub request_id: i64,
    pub tracer_string: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<TracerEvent>,
}

/// One sighting of a tracer string in later traffic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TracerEvent {
    pub id: i64,
    pub tracer_id: i64,
    pub event_type: String,
    pub location: String,
    pub data: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dom_context: Option<DomContext>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DomContext {
    pub id: i64,
    pub tracer_event_id: i64,
    pub node_type: String,
    pub location_type: String,
    pub snippet: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewTracerEvent {
    pub event_type: String,
    pub location: String,
    pub data: String,
    #[serde(default)]
    pub dom_context: Option<NewDomContext>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewDomContext {
    pub node_type: String,
    pub location_type: String,
    pub snippet: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 16, 9, 30, 0)
            .single()
            .expect("valid timestamp")
    }

    #[test]
    fn generated_request_uses_sentinels_and_single_tracer() {
        let request = NewRequest::generated("abc123", "http://x/");

        assert_eq!(request.raw_request, GENERATED_SENTINEL);
        assert_eq!(request.request_method, GENERATED_SENTINEL);
        assert_eq!(request.request_url, "http://x/");
        assert_eq!(request.tracer_strings().collect::<Vec<_>>(), vec!["abc123"]);
    }

    #[test]
    fn new_request_rejects_missing_fields() {
        let missing_method = r#"{"raw_request":"GET / HTTP/1.1","request_url":"http://x/","tracers":[]}"#;
        assert!(serde_json::from_str::<NewRequest>(missing_method).is_err());

        let bad_tracer = r#"{"raw_request":"r","request_url":"u","request_method":"GET","tracers":[{"tracer_string":7}]}"#;
        assert!(serde_json::from_str::<NewRequest>(bad_tracer).is_err());
    }

    #[test]
    fn tracer_json_omits_empty_events() {
        let tracer = Tracer {
            id: 3,
            request_id: 1,
            tracer_string: "t1".to_string(),
            events: Vec::new(),
        };
        let value = serde_json::to_value(&tracer).expect("serialize tracer");
        assert_eq!(
            value,
            serde_json::json!({"id": 3, "request_id": 1, "tracer_string": "t1"})
        );
    }

    #[test]
    fn tracer_json_carries_events_with_dom_context() {
        let tracer = Tracer {
            id: 3,
            request_id: 1,
            tracer_string: "t1".to_string(),
            events: vec![TracerEvent {
                id: 9,
                tracer_id: 3,
                event_type: "response".to_string(),
                location: "http://x/search".to_string(),
                data: "<b>t1</b>".to_string(),
                created_at: ts(),
                dom_context: Some(DomContext {
                    id: 4,
                    tracer_event_id: 9,
                    node_type: "b".to_string(),
                    location_type: "text".to_string(),
                    snippet: "<b>t1</b>".to_string(),
                }),
            }],
        };

        let value = serde_json::to_value(&tracer).expect("serialize tracer");
        assert_eq!(value["events"][0]["dom_context"]["node_type"], "b");
        let back: Tracer = serde_json::from_value(value).expect("deserialize tracer");
        assert_eq!(back, tracer);
    }

    #[test]
    fn request_detects_generated_origin() {
        let request = Request {
            id: 1,
            raw_request: GENERATED_SENTINEL.to_string(),
            request_url: "http://x/".to_string(),
            request_method: GENERATED_SENTINEL.to_string(),
            created_at: ts(),
            tracers: Vec::new(),
        };
        assert!(request.is_generated());
    }
}
