use crate::error::TracerError;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{trace, warn};
use tracy_core::{NewRequest, NewTracerEvent, PayloadExtractor};
use tracy_storage::{ConstraintKind, StorageError, TracerStore};

pub struct TracerService {
    store: Arc<dyn TracerStore>,
    extractor: Arc<dyn PayloadExtractor>,
}

impl TracerService {
    pub fn new(store: Arc<dyn TracerStore>, extractor: Arc<dyn PayloadExtractor>) -> Self {
        Self { store, extractor }
    }

    /// Stores a request and all of its tracers as one unit and returns the
    /// stored request as JSON.
    pub fn add_tracer(&self, request: NewRequest) -> Result<Vec<u8>, TracerError> {
        trace!(
            event = "tracer_add",
            url = %request.request_url,
            method = %request.request_method,
            tracers = request.tracers.len()
        );
        let result = validate_request(&request).and_then(|_| {
            let stored = self
                .store
                .insert_request(&request)
                .map_err(translate_request_error)?;
            trace!(
                event = "tracer_added",
                request_id = stored.id,
                generated = stored.is_generated()
            );
            encode(&stored)
        });
        logged("tracer_add", result)
    }

    pub fn get_tracer(&self, tracer_id: i64) -> Result<Vec<u8>, TracerError> {
        trace!(event = "tracer_get", tracer_id);
        let result = self
            .store
            .tracer(tracer_id)
            .map_err(TracerError::from)
            .and_then(|tracer| {
                let tracer = tracer.ok_or(TracerError::NotFound {
                    entity: "tracer",
                    id: tracer_id,
                })?;
                encode(&tracer)
            });
        logged("tracer_get", result)
    }

    pub fn get_tracers(&self) -> Result<Vec<u8>, TracerError> {
        trace!(event = "tracer_list");
        let result = self
            .store
            .tracers()
            .map_err(TracerError::from)
            .and_then(|tracers| {
                trace!(event = "tracer_listed", count = tracers.len());
                encode(&tracers)
            });
        logged("tracer_list", result)
    }

    /// Registers a tracer that was produced client-side, before any request
    /// carrying it could be captured. The stored request is synthetic.
    pub fn generate_tracer(&self, tracer_string: &str, url: &str) -> Result<Vec<u8>, TracerError> {
        trace!(event = "tracer_generate", tracer = tracer_string, url);
        if tracer_string.trim().is_empty() {
            return logged(
                "tracer_generate",
                Err(TracerError::Validation("tracer_string is required".to_string())),
            );
        }
        if url.trim().is_empty() {
            return logged(
                "tracer_generate",
                Err(TracerError::Validation("url is required".to_string())),
            );
        }

        let (metadata, payload) = self.extractor.extract_payload(tracer_string);
        if payload.is_none() {
            return logged(
                "tracer_generate",
                Err(TracerError::Validation(format!(
                    "no tracer payload in tag {:?}",
                    metadata.tag
                ))),
            );
        }

        self.add_tracer(NewRequest::generated(tracer_string, url))
    }

    /// Appends one sighting of a tracer, with its DOM context when known.
    pub fn add_event(&self, tracer_id: i64, event: NewTracerEvent) -> Result<Vec<u8>, TracerError> {
        trace!(event = "tracer_event_add", tracer_id, kind = %event.event_type);
        let result = validate_event(&event).and_then(|_| {
            let stored = self
                .store
                .insert_event(tracer_id, &event)
                .map_err(|err| match err.constraint() {
                    Some(ConstraintKind::ForeignKey) => TracerError::NotFound {
                        entity: "tracer",
                        id: tracer_id,
                    },
                    Some(ConstraintKind::NotNull | ConstraintKind::Check) => {
                        TracerError::Validation(err.to_string())
                    }
                    _ => TracerError::Store(err),
                })?;
            encode(&stored)
        });
        logged("tracer_event_add", result)
    }

    pub fn get_events(&self, tracer_id: i64) -> Result<Vec<u8>, TracerError> {
        trace!(event = "tracer_event_list", tracer_id);
        let result = self
            .store
            .events_for_tracer(tracer_id)
            .map_err(TracerError::from)
            .and_then(|events| {
                let events = events.ok_or(TracerError::NotFound {
                    entity: "tracer",
                    id: tracer_id,
                })?;
                encode(&events)
            });
        logged("tracer_event_list", result)
    }

    pub fn get_request(&self, request_id: i64) -> Result<Vec<u8>, TracerError> {
        trace!(event = "request_get", request_id);
        let result = self
            .store
            .request(request_id)
            .map_err(TracerError::from)
            .and_then(|request| {
                let request = request.ok_or(TracerError::NotFound {
                    entity: "request",
                    id: request_id,
                })?;
                encode(&request)
            });
        logged("request_get", result)
    }
}

fn validate_request(request: &NewRequest) -> Result<(), TracerError> {
    for (field, value) in [
        ("raw_request", &request.raw_request),
        ("request_url", &request.request_url),
        ("request_method", &request.request_method),
    ] {
        if value.trim().is_empty() {
            return Err(TracerError::Validation(format!("{field} is required")));
        }
    }
    if request.tracers.is_empty() {
        return Err(TracerError::Validation(
            "request must carry at least one tracer".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for tracer_string in request.tracer_strings() {
        if tracer_string.trim().is_empty() {
            return Err(TracerError::Validation(
                "tracer_string is required".to_string(),
            ));
        }
        if !seen.insert(tracer_string) {
            return Err(TracerError::Conflict(tracer_string.to_string()));
        }
    }
    Ok(())
}

fn validate_event(event: &NewTracerEvent) -> Result<(), TracerError> {
    if event.event_type.trim().is_empty() {
        return Err(TracerError::Validation("event_type is required".to_string()));
    }
    if event.location.trim().is_empty() {
        return Err(TracerError::Validation("location is required".to_string()));
    }
    Ok(())
}

fn translate_request_error(err: StorageError) -> TracerError {
    if let StorageError::DuplicateTracer { tracer_string, .. } = err {
        return TracerError::Conflict(tracer_string);
    }
    match err.constraint() {
        Some(ConstraintKind::Unique) => TracerError::Conflict(err.to_string()),
        Some(ConstraintKind::NotNull | ConstraintKind::Check) => {
            TracerError::Validation(err.to_string())
        }
        _ => TracerError::Store(err),
    }
}

fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, TracerError> {
    serde_json::to_vec(value).map_err(|err| TracerError::Serialization(err.to_string()))
}

fn logged<T>(operation: &'static str, result: Result<T, TracerError>) -> Result<T, TracerError> {
    if let Err(err) = &result {
        warn!(event = "tracer_op_failed", operation, code = err.code(), error = %err);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use tempfile::NamedTempFile;
    use tracy_core::{
        NewDomContext, NewTracer, Request, TagExtractor, TagKind, TagMetadata, Tracer,
        TracerEvent, GENERATED_SENTINEL,
    };
    use tracy_storage::TracerDb;

    struct FixedExtractor {
        payload: Option<Vec<u8>>,
    }

    impl PayloadExtractor for FixedExtractor {
        fn extract_payload(&self, tag: &str) -> (TagMetadata, Option<Vec<u8>>) {
            (
                TagMetadata {
                    tag: tag.to_string(),
                    kind: TagKind::Plain,
                },
                self.payload.clone(),
            )
        }
    }

    struct UnavailableStore;

    impl TracerStore for UnavailableStore {
        fn insert_request(&self, _request: &NewRequest) -> Result<Request, StorageError> {
            Err(StorageError::Closed)
        }

        fn request(&self, _request_id: i64) -> Result<Option<Request>, StorageError> {
            Err(StorageError::Closed)
        }

        fn tracer(&self, _tracer_id: i64) -> Result<Option<Tracer>, StorageError> {
            Err(StorageError::Closed)
        }

        fn tracers(&self) -> Result<Vec<Tracer>, StorageError> {
            Err(StorageError::Closed)
        }

        fn insert_event(
            &self,
            _tracer_id: i64,
            _event: &NewTracerEvent,
        ) -> Result<TracerEvent, StorageError> {
            Err(StorageError::Closed)
        }

        fn events_for_tracer(
            &self,
            _tracer_id: i64,
        ) -> Result<Option<Vec<TracerEvent>>, StorageError> {
            Err(StorageError::Closed)
        }
    }

    fn service() -> TracerService {
        let store = TracerDb::open_in_memory().expect("open db");
        TracerService::new(Arc::new(store), Arc::new(TagExtractor::new()))
    }

    fn service_with_payload(payload: Option<&str>) -> TracerService {
        let store = TracerDb::open_in_memory().expect("open db");
        TracerService::new(
            Arc::new(store),
            Arc::new(FixedExtractor {
                payload: payload.map(|value| value.as_bytes().to_vec()),
            }),
        )
    }

    fn request_with(tracer_strings: &[&str]) -> NewRequest {
        NewRequest {
            raw_request: "POST /login HTTP/1.1\r\nHost: x\r\n\r\nuser=zz".to_string(),
            request_url: "http://x/login".to_string(),
            request_method: "POST".to_string(),
            tracers: tracer_strings
                .iter()
                .map(|value| NewTracer {
                    tracer_string: value.to_string(),
                })
                .collect(),
        }
    }

    fn tracers_of(svc: &TracerService) -> Vec<Tracer> {
        serde_json::from_slice(&svc.get_tracers().expect("get tracers")).expect("decode tracers")
    }

    #[test]
    fn add_then_get_returns_the_same_tracer_strings() {
        let svc = service();
        let input = request_with(&["alpha1", "beta22"]);
        let stored: Request =
            serde_json::from_slice(&svc.add_tracer(input.clone()).expect("add")).expect("decode");

        assert!(stored.id > 0);
        assert_eq!(stored.request_url, input.request_url);
        for (tracer, expected) in stored.tracers.iter().zip(input.tracer_strings()) {
            let fetched: Tracer =
                serde_json::from_slice(&svc.get_tracer(tracer.id).expect("get")).expect("decode");
            assert_eq!(fetched.tracer_string, expected);
            assert_eq!(fetched.request_id, stored.id);
        }
    }

    #[test]
    fn shared_tracer_string_conflicts_and_writes_nothing() {
        let svc = service();
        svc.add_tracer(request_with(&["shared1"])).expect("first add");

        let err = svc
            .add_tracer(request_with(&["other22", "shared1"]))
            .expect_err("second add must conflict");
        assert!(matches!(&err, TracerError::Conflict(value) if value == "shared1"));
        assert_eq!(err.to_string(), "tracer string already stored: shared1");

        let strings: Vec<String> = tracers_of(&svc)
            .into_iter()
            .map(|tracer| tracer.tracer_string)
            .collect();
        assert_eq!(strings, vec!["shared1".to_string()]);
        assert!(matches!(
            svc.get_request(2),
            Err(TracerError::NotFound { entity: "request", id: 2 })
        ));
    }

    #[test]
    fn duplicate_strings_within_one_request_conflict() {
        let svc = service();
        let err = svc
            .add_tracer(request_with(&["twice1", "twice1"]))
            .expect_err("duplicate in request");
        assert!(matches!(err, TracerError::Conflict(value) if value == "twice1"));
        assert!(tracers_of(&svc).is_empty());
    }

    #[test]
    fn empty_fields_are_validation_errors() {
        let svc = service();

        let mut no_url = request_with(&["t1"]);
        no_url.request_url = "  ".to_string();
        assert!(matches!(
            svc.add_tracer(no_url),
            Err(TracerError::Validation(_))
        ));

        let blank_tracer = request_with(&[""]);
        assert!(matches!(
            svc.add_tracer(blank_tracer),
            Err(TracerError::Validation(_))
        ));

        let no_tracers = request_with(&[]);
        assert!(matches!(
            svc.add_tracer(no_tracers),
            Err(TracerError::Validation(_))
        ));
    }

    #[test]
    fn missing_tracer_is_not_found() {
        let svc = service();
        assert!(matches!(
            svc.get_tracer(404),
            Err(TracerError::NotFound { entity: "tracer", id: 404 })
        ));
    }

    #[test]
    fn get_tracers_returns_every_stored_string() {
        let svc = service();
        svc.add_tracer(request_with(&["t1"])).expect("add t1");
        svc.add_tracer(request_with(&["t2"])).expect("add t2");

        let strings: BTreeSet<String> = tracers_of(&svc)
            .into_iter()
            .map(|tracer| tracer.tracer_string)
            .collect();
        assert_eq!(
            strings,
            BTreeSet::from(["t1".to_string(), "t2".to_string()])
        );
    }

    #[test]
    fn generate_tracer_builds_synthetic_request() {
        let svc = service_with_payload(Some("abc123"));
        let body = svc
            .generate_tracer("abc123", "http://x/")
            .expect("generate");
        let stored: Request = serde_json::from_slice(&body).expect("decode");

        assert_eq!(stored.raw_request, GENERATED_SENTINEL);
        assert_eq!(stored.request_method, GENERATED_SENTINEL);
        assert_eq!(stored.request_url, "http://x/");
        assert_eq!(stored.tracers.len(), 1);
        assert_eq!(stored.tracers[0].tracer_string, "abc123");
        assert!(stored.is_generated());

        let captured: Request =
            serde_json::from_slice(&svc.add_tracer(request_with(&["capture1"])).expect("add"))
                .expect("decode");
        assert!(!captured.is_generated());
    }

    #[test]
    fn generate_tracer_rejects_empty_inputs_without_writing() {
        let svc = service_with_payload(Some("abc123"));
        assert!(matches!(
            svc.generate_tracer("", "http://x/"),
            Err(TracerError::Validation(_))
        ));
        assert!(matches!(
            svc.generate_tracer("abc123", ""),
            Err(TracerError::Validation(_))
        ));
        assert!(tracers_of(&svc).is_empty());
    }

    #[test]
    fn generate_tracer_requires_an_extracted_payload() {
        let svc = service_with_payload(None);
        assert!(matches!(
            svc.generate_tracer("abc123", "http://x/"),
            Err(TracerError::Validation(_))
        ));
        assert!(tracers_of(&svc).is_empty());
    }

    #[test]
    fn events_are_appended_and_listed() {
        let svc = service();
        let stored: Request =
            serde_json::from_slice(&svc.add_tracer(request_with(&["reflect1"])).expect("add"))
                .expect("decode");
        let tracer_id = stored.tracers[0].id;

        let event = NewTracerEvent {
            event_type: "response".to_string(),
            location: "http://x/profile".to_string(),
            data: "<input value=\"reflect1\">".to_string(),
            dom_context: Some(NewDomContext {
                node_type: "input".to_string(),
                location_type: "attribute".to_string(),
                snippet: "value=\"reflect1\"".to_string(),
            }),
        };
        let added: TracerEvent =
            serde_json::from_slice(&svc.add_event(tracer_id, event).expect("add event"))
                .expect("decode");
        assert_eq!(added.tracer_id, tracer_id);

        let events: Vec<TracerEvent> =
            serde_json::from_slice(&svc.get_events(tracer_id).expect("events")).expect("decode");
        assert_eq!(events, vec![added.clone()]);

        let tracer: Tracer =
            serde_json::from_slice(&svc.get_tracer(tracer_id).expect("get")).expect("decode");
        assert_eq!(tracer.events, vec![added]);
    }

    #[test]
    fn events_for_unknown_tracer_are_not_found() {
        let svc = service();
        let event = NewTracerEvent {
            event_type: "response".to_string(),
            location: "http://x/".to_string(),
            data: String::new(),
            dom_context: None,
        };
        assert!(matches!(
            svc.add_event(9, event),
            Err(TracerError::NotFound { entity: "tracer", id: 9 })
        ));
        assert!(matches!(
            svc.get_events(9),
            Err(TracerError::NotFound { entity: "tracer", id: 9 })
        ));
    }

    #[test]
    fn store_failures_pass_through() {
        let svc = TracerService::new(Arc::new(UnavailableStore), Arc::new(TagExtractor::new()));
        assert!(matches!(
            svc.get_tracers(),
            Err(TracerError::Store(StorageError::Closed))
        ));
        assert!(matches!(
            svc.add_tracer(request_with(&["t1"])),
            Err(TracerError::Store(StorageError::Closed))
        ));
    }

    #[test]
    fn concurrent_adds_persist_every_request() {
        const WRITERS: usize = 16;
        let file = NamedTempFile::new().expect("temp file");
        let store = TracerDb::open(file.path()).expect("open db");
        let svc = Arc::new(TracerService::new(
            Arc::new(store),
            Arc::new(TagExtractor::new()),
        ));

        let handles: Vec<_> = (0..WRITERS)
            .map(|idx| {
                let svc = Arc::clone(&svc);
                std::thread::spawn(move || {
                    let tracer = format!("concurrent{idx:02}");
                    svc.add_tracer(request_with(&[tracer.as_str()]))
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("writer thread").expect("add tracer");
        }

        let tracers = tracers_of(&svc);
        assert_eq!(tracers.len(), WRITERS);
        let ids: BTreeSet<i64> = tracers.iter().map(|tracer| tracer.id).collect();
        let request_ids: BTreeSet<i64> = tracers.iter().map(|tracer| tracer.request_id).collect();
        assert_eq!(ids.len(), WRITERS);
        assert_eq!(request_ids.len(), WRITERS);
    }
}
