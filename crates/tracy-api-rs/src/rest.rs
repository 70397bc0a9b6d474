use crate::{dispatch, ws};
use axum::{
    extract::{
        rejection::{FormRejection, JsonRejection},
        Path, State,
    },
    http::{header, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Form, Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tracy_core::{NewRequest, NewTracerEvent};
use tracy_tracer::{ErrorEnvelope, TracerError, TracerService};

#[derive(Debug, Deserialize)]
struct GenerateForm {
    #[serde(default)]
    tracer_string: String,
    #[serde(default)]
    url: String,
}

pub fn router(service: Arc<TracerService>) -> Router {
    Router::new()
        .route("/tracers", get(get_tracers).post(add_tracers))
        .route(
            "/tracers/generate",
            get(generate_tracer).post(generate_tracer),
        )
        .route("/tracers/:tracer_id", get(get_tracer))
        .route("/tracers/:tracer_id/events", get(get_events).post(add_event))
        .route("/requests/:request_id", get(get_request))
        .route(
            "/ws",
            get(ws::ws_handler).route_layer(middleware::from_fn(ws::loopback_only)),
        )
        .route("/health", get(|| async { "ok" }))
        .with_state(service)
}

async fn add_tracers(
    State(service): State<Arc<TracerService>>,
    body: Result<Json<NewRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(value) => value,
        Err(err) => return decode_failure(err.body_text()),
    };
    respond(dispatch::call(&service, move |svc| svc.add_tracer(request)).await)
}

async fn get_tracers(State(service): State<Arc<TracerService>>) -> Response {
    respond(dispatch::call(&service, |svc| svc.get_tracers()).await)
}

async fn get_tracer(
    State(service): State<Arc<TracerService>>,
    Path(tracer_id): Path<String>,
) -> Response {
    let tracer_id = match parse_id(&tracer_id) {
        Ok(value) => value,
        Err(response) => return response,
    };
    respond(dispatch::call(&service, move |svc| svc.get_tracer(tracer_id)).await)
}

async fn generate_tracer(
    State(service): State<Arc<TracerService>>,
    form: Result<Form<GenerateForm>, FormRejection>,
) -> Response {
    let Form(form) = match form {
        Ok(value) => value,
        Err(err) => return decode_failure(err.body_text()),
    };
    respond(
        dispatch::call(&service, move |svc| {
            svc.generate_tracer(&form.tracer_string, &form.url)
        })
        .await,
    )
}

async fn add_event(
    State(service): State<Arc<TracerService>>,
    Path(tracer_id): Path<String>,
    body: Result<Json<NewTracerEvent>, JsonRejection>,
) -> Response {
    let tracer_id = match parse_id(&tracer_id) {
        Ok(value) => value,
        Err(response) => return response,
    };
    let Json(event) = match body {
        Ok(value) => value,
        Err(err) => return decode_failure(err.body_text()),
    };
    respond(dispatch::call(&service, move |svc| svc.add_event(tracer_id, event)).await)
}

async fn get_events(
    State(service): State<Arc<TracerService>>,
    Path(tracer_id): Path<String>,
) -> Response {
    let tracer_id = match parse_id(&tracer_id) {
        Ok(value) => value,
        Err(response) => return response,
    };
    respond(dispatch::call(&service, move |svc| svc.get_events(tracer_id)).await)
}

async fn get_request(
    State(service): State<Arc<TracerService>>,
    Path(request_id): Path<String>,
) -> Response {
    let request_id = match parse_id(&request_id) {
        Ok(value) => value,
        Err(response) => return response,
    };
    respond(dispatch::call(&service, move |svc| svc.get_request(request_id)).await)
}

fn parse_id(raw: &str) -> Result<i64, Response> {
    raw.parse::<i64>()
        .map_err(|err| decode_failure(format!("invalid id {raw:?}: {err}")))
}

fn decode_failure(message: String) -> Response {
    let envelope = dispatch::reject(&TracerError::Decode(message));
    json_response(StatusCode::INTERNAL_SERVER_ERROR, envelope.to_json())
}

fn respond(result: Result<Vec<u8>, ErrorEnvelope>) -> Response {
    match result {
        Ok(body) => json_response(StatusCode::OK, body),
        Err(envelope) => json_response(StatusCode::INTERNAL_SERVER_ERROR, envelope.to_json()),
    }
}

fn json_response(status: StatusCode, body: Vec<u8>) -> Response {
    (status, [(header::CONTENT_TYPE, "application/json")], body).into_response()
}
