#![allow(clippy::missing_errors_doc)]

//! HTTP adapter for the counter service: router, response envelope, error
//! classification, and per-process telemetry.

pub mod service;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tally_core::{
    validate_deltas, validate_keys, validate_site_page, validate_triple, Counter, CounterDelta,
    CounterError,
};
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use crate::service::CounterService;

#[derive(Clone)]
pub struct AppState {
    service: Arc<Mutex<CounterService>>,
    operation_timeout: Duration,
    telemetry: Arc<ServiceTelemetry>,
}

/// Uniform response envelope; `code` always matches the HTTP status.
#[derive(Debug, Clone, Serialize)]
pub struct ApiResponse<T>
where
    T: Serialize,
{
    pub code: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

#[derive(Debug, Clone)]
pub struct ApiFailure {
    status: StatusCode,
    message: String,
}

#[derive(Debug, Default)]
struct ServiceTelemetry {
    requests_total: AtomicU64,
    requests_success_total: AtomicU64,
    requests_failure_total: AtomicU64,
    timeout_total: AtomicU64,
    invalid_body_total: AtomicU64,
    validation_error_total: AtomicU64,
    not_found_total: AtomicU64,
    conflict_total: AtomicU64,
    storage_error_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceTelemetrySnapshot {
    requests_total: u64,
    requests_success_total: u64,
    requests_failure_total: u64,
    timeout_total: u64,
    invalid_body_total: u64,
    validation_error_total: u64,
    not_found_total: u64,
    conflict_total: u64,
    storage_error_total: u64,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: i64,
    timeout_ms: u64,
    telemetry: ServiceTelemetrySnapshot,
}

#[derive(Debug, Clone, Deserialize)]
struct GetCounterParams {
    siteid: String,
    url: String,
    key: String,
}

#[derive(Debug, Clone, Deserialize)]
struct UpsertCounterRequest {
    siteid: String,
    url: String,
    key: String,
    num: i64,
}

#[derive(Debug, Clone, Deserialize)]
struct IncrementCounterRequest {
    siteid: String,
    url: String,
    key: String,
    increment: i64,
}

#[derive(Debug, Clone, Deserialize)]
struct BatchGetRequest {
    siteid: String,
    url: String,
    keys: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct BatchIncrementRequest {
    siteid: String,
    url: String,
    counters: Vec<CounterDelta>,
}

/// One entry of a batch response, in request order.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
struct KeyCount {
    key: String,
    num: i64,
}

impl From<&Counter> for KeyCount {
    fn from(counter: &Counter) -> Self {
        Self { key: counter.key.clone(), num: counter.num }
    }
}

impl IntoResponse for ApiFailure {
    fn into_response(self) -> Response {
        let payload = ApiResponse::<()> {
            code: self.status.as_u16(),
            message: self.message,
            data: None,
        };
        (self.status, Json(payload)).into_response()
    }
}

impl AppState {
    #[must_use]
    pub fn new(service: CounterService, operation_timeout: Duration) -> Self {
        Self {
            service: Arc::new(Mutex::new(service)),
            operation_timeout,
            telemetry: Arc::new(ServiceTelemetry::default()),
        }
    }

    fn failure(status: StatusCode, message: impl Into<String>) -> ApiFailure {
        ApiFailure { status, message: message.into() }
    }

    fn invalid_body(&self, detail: &str) -> ApiFailure {
        self.telemetry.record_failure("invalid_body", false);
        Self::failure(StatusCode::BAD_REQUEST, format!("invalid request body: {detail}"))
    }

    fn validation(&self, err: &CounterError) -> ApiFailure {
        self.telemetry.record_failure("validation_error", false);
        Self::failure(StatusCode::BAD_REQUEST, err.to_string())
    }

    fn not_found(&self) -> ApiFailure {
        self.telemetry.record_failure("not_found", false);
        Self::failure(StatusCode::NOT_FOUND, "counter not found")
    }

    fn classify(err: &CounterError) -> ApiFailure {
        match err {
            CounterError::Validation(_) => Self::failure(StatusCode::BAD_REQUEST, err.to_string()),
            CounterError::Conflict(_) => Self::failure(StatusCode::CONFLICT, err.to_string()),
            CounterError::Storage(_) => {
                Self::failure(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
        }
    }

    fn failure_kind(err: &CounterError) -> &'static str {
        match err {
            CounterError::Validation(_) => "validation_error",
            CounterError::Conflict(_) => "conflict",
            CounterError::Storage(_) => "storage_error",
        }
    }

    /// Runs a store-backed operation on the blocking pool under the
    /// per-operation timeout. The service handle is a mutex, so operations
    /// on one store serialize here rather than inside sqlite.
    async fn run_service<T, F>(&self, operation_label: &'static str, op: F) -> Result<T, ApiFailure>
    where
        T: Send + 'static,
        F: FnOnce(&mut CounterService) -> Result<T, CounterError> + Send + 'static,
    {
        self.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
        let service = Arc::clone(&self.service);
        let handle = tokio::task::spawn_blocking(move || {
            let mut guard = match service.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            op(&mut guard)
        });

        let join_result = tokio::time::timeout(self.operation_timeout, handle)
            .await
            .map_err(|_| {
                self.telemetry.record_failure("timeout", true);
                Self::failure(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!(
                        "{operation_label} timed out after {} ms",
                        self.operation_timeout.as_millis()
                    ),
                )
            })?;

        let op_result = join_result.map_err(|err| {
            self.telemetry.record_failure("storage_error", false);
            Self::failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("{operation_label} join failure: {err}"),
            )
        })?;

        match op_result {
            Ok(value) => {
                self.telemetry.requests_success_total.fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(err) => {
                warn!(operation = operation_label, error = %err, "counter operation failed");
                self.telemetry.record_failure(Self::failure_kind(&err), false);
                Err(Self::classify(&err))
            }
        }
    }
}

impl ServiceTelemetry {
    fn record_failure(&self, kind: &str, timeout: bool) {
        self.requests_failure_total.fetch_add(1, Ordering::Relaxed);
        if timeout {
            self.timeout_total.fetch_add(1, Ordering::Relaxed);
        }
        match kind {
            "invalid_body" => {
                self.invalid_body_total.fetch_add(1, Ordering::Relaxed);
            }
            "validation_error" => {
                self.validation_error_total.fetch_add(1, Ordering::Relaxed);
            }
            "not_found" => {
                self.not_found_total.fetch_add(1, Ordering::Relaxed);
            }
            "conflict" => {
                self.conflict_total.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.storage_error_total.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn snapshot(&self) -> ServiceTelemetrySnapshot {
        ServiceTelemetrySnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_success_total: self.requests_success_total.load(Ordering::Relaxed),
            requests_failure_total: self.requests_failure_total.load(Ordering::Relaxed),
            timeout_total: self.timeout_total.load(Ordering::Relaxed),
            invalid_body_total: self.invalid_body_total.load(Ordering::Relaxed),
            validation_error_total: self.validation_error_total.load(Ordering::Relaxed),
            not_found_total: self.not_found_total.load(Ordering::Relaxed),
            conflict_total: self.conflict_total.load(Ordering::Relaxed),
            storage_error_total: self.storage_error_total.load(Ordering::Relaxed),
        }
    }
}

fn ok<T>(data: T) -> Json<ApiResponse<T>>
where
    T: Serialize,
{
    Json(ApiResponse { code: 200, message: "ok".to_string(), data: Some(data) })
}

/// Projects a batch result map into a list ordered by the first occurrence
/// of each key in the request; repeated keys appear once.
fn order_by_request(
    keys: impl IntoIterator<Item = String>,
    counters: &std::collections::BTreeMap<String, Counter>,
) -> Vec<KeyCount> {
    let mut ordered = Vec::new();
    let mut seen = std::collections::BTreeSet::new();
    for key in keys {
        if !seen.insert(key.clone()) {
            continue;
        }
        if let Some(counter) = counters.get(&key) {
            ordered.push(KeyCount::from(counter));
        }
    }
    ordered
}

#[must_use]
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/api/health", get(health))
        .route("/api/count", get(get_counter).post(upsert_counter))
        .route("/api/increment", post(increment_counter))
        .route("/api/count/batch", post(batch_get_counters))
        .route("/api/increment/batch", post(batch_increment_counters))
        .layer(cors)
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<ApiResponse<HealthResponse>> {
    let timeout_ms = u64::try_from(state.operation_timeout.as_millis()).unwrap_or(u64::MAX);
    ok(HealthResponse {
        status: "healthy",
        timestamp: tally_core::now_utc().unix_timestamp(),
        timeout_ms,
        telemetry: state.telemetry.snapshot(),
    })
}

async fn get_counter(
    State(state): State<AppState>,
    params: Result<Query<GetCounterParams>, QueryRejection>,
) -> Result<Json<ApiResponse<KeyCount>>, ApiFailure> {
    let Query(params) = params.map_err(|rejection| state.invalid_body(&rejection.body_text()))?;
    validate_triple(&params.siteid, &params.url, &params.key)
        .map_err(|err| state.validation(&err))?;

    let found = state
        .run_service("get_counter", move |service| {
            service.get_counter(&params.siteid, &params.url, &params.key)
        })
        .await?;

    match found {
        Some(counter) => Ok(ok(KeyCount::from(&counter))),
        None => Err(state.not_found()),
    }
}

async fn upsert_counter(
    State(state): State<AppState>,
    payload: Result<Json<UpsertCounterRequest>, JsonRejection>,
) -> Result<Json<ApiResponse<KeyCount>>, ApiFailure> {
    let Json(request) = payload.map_err(|rejection| state.invalid_body(&rejection.body_text()))?;
    validate_triple(&request.siteid, &request.url, &request.key)
        .map_err(|err| state.validation(&err))?;

    let counter = state
        .run_service("upsert_counter", move |service| {
            service.upsert_counter(&request.siteid, &request.url, &request.key, request.num)
        })
        .await?;

    Ok(ok(KeyCount::from(&counter)))
}

async fn increment_counter(
    State(state): State<AppState>,
    payload: Result<Json<IncrementCounterRequest>, JsonRejection>,
) -> Result<Json<ApiResponse<KeyCount>>, ApiFailure> {
    let Json(request) = payload.map_err(|rejection| state.invalid_body(&rejection.body_text()))?;
    validate_triple(&request.siteid, &request.url, &request.key)
        .map_err(|err| state.validation(&err))?;

    let counter = state
        .run_service("increment_counter", move |service| {
            service.increment_counter(
                &request.siteid,
                &request.url,
                &request.key,
                request.increment,
            )
        })
        .await?;

    Ok(ok(KeyCount::from(&counter)))
}

async fn batch_get_counters(
    State(state): State<AppState>,
    payload: Result<Json<BatchGetRequest>, JsonRejection>,
) -> Result<Json<ApiResponse<Vec<KeyCount>>>, ApiFailure> {
    let Json(request) = payload.map_err(|rejection| state.invalid_body(&rejection.body_text()))?;
    validate_site_page(&request.siteid, &request.url).map_err(|err| state.validation(&err))?;
    validate_keys(&request.keys).map_err(|err| state.validation(&err))?;

    let request_keys = request.keys.clone();
    let counters = state
        .run_service("batch_get_counters", move |service| {
            service.batch_get_counters(&request.siteid, &request.url, &request.keys)
        })
        .await?;

    Ok(ok(order_by_request(request_keys, &counters)))
}

async fn batch_increment_counters(
    State(state): State<AppState>,
    payload: Result<Json<BatchIncrementRequest>, JsonRejection>,
) -> Result<Json<ApiResponse<Vec<KeyCount>>>, ApiFailure> {
    let Json(request) = payload.map_err(|rejection| state.invalid_body(&rejection.body_text()))?;
    validate_site_page(&request.siteid, &request.url).map_err(|err| state.validation(&err))?;
    validate_deltas(&request.counters).map_err(|err| state.validation(&err))?;

    let request_keys: Vec<String> =
        request.counters.iter().map(|delta| delta.key.clone()).collect();
    let counters = state
        .run_service("batch_increment_counters", move |service| {
            service.batch_increment_counters(&request.siteid, &request.url, &request.counters)
        })
        .await?;

    Ok(ok(order_by_request(request_keys, &counters)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use http::Request;
    use tally_store_sqlite::SqliteCounterStore;
    use tower::ServiceExt;

    fn test_state(timeout_ms: u64) -> AppState {
        let store = match SqliteCounterStore::open_in_memory() {
            Ok(store) => store,
            Err(err) => panic!("failed to open test store: {err}"),
        };
        if let Err(err) = store.migrate() {
            panic!("failed to migrate test store: {err}");
        }
        AppState::new(CounterService::new(store), Duration::from_millis(timeout_ms))
    }

    fn test_router() -> Router {
        app(test_state(2500))
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .method("GET")
            .body(Body::empty())
            .unwrap_or_else(|err| panic!("failed to build request: {err}"))
    }

    fn post_json(uri: &str, payload: &serde_json::Value) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .method("POST")
            .header("content-type", "application/json")
            .body(Body::from(payload.to_string()))
            .unwrap_or_else(|err| panic!("failed to build request: {err}"))
    }

    async fn send(router: Router, request: Request<Body>) -> Response {
        match router.oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}; body={body}"),
        }
    }

    fn data_entries(value: &serde_json::Value) -> Vec<(String, i64)> {
        value
            .get("data")
            .and_then(serde_json::Value::as_array)
            .unwrap_or_else(|| panic!("missing data array in response: {value}"))
            .iter()
            .map(|entry| {
                let key = entry
                    .get("key")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or_else(|| panic!("missing key in entry: {entry}"));
                let num = entry
                    .get("num")
                    .and_then(serde_json::Value::as_i64)
                    .unwrap_or_else(|| panic!("missing num in entry: {entry}"));
                (key.to_string(), num)
            })
            .collect()
    }

    #[tokio::test]
    async fn health_endpoint_reports_healthy() {
        let response = send(test_router(), get_request("/api/health")).await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(value.get("code").and_then(serde_json::Value::as_u64), Some(200));
        assert_eq!(
            value
                .get("data")
                .and_then(|data| data.get("status"))
                .and_then(serde_json::Value::as_str),
            Some("healthy")
        );
        assert!(
            value
                .get("data")
                .and_then(|data| data.get("telemetry"))
                .and_then(|telemetry| telemetry.get("requests_total"))
                .is_some(),
            "missing telemetry in health payload: {value}"
        );
    }

    #[tokio::test]
    async fn missing_counter_returns_not_found_envelope() {
        let response = send(
            test_router(),
            get_request("/api/count?siteid=s1&url=/page&key=views"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let value = response_json(response).await;
        assert_eq!(value.get("code").and_then(serde_json::Value::as_u64), Some(404));
        assert_eq!(
            value.get("message").and_then(serde_json::Value::as_str),
            Some("counter not found")
        );
        assert!(value.get("data").is_none(), "error envelope must omit data: {value}");
    }

    #[tokio::test]
    async fn upsert_then_get_round_trips() {
        let router = test_router();

        let payload = serde_json::json!({
            "siteid": "s1", "url": "/page", "key": "views", "num": 7
        });
        let upsert = send(router.clone(), post_json("/api/count", &payload)).await;
        assert_eq!(upsert.status(), StatusCode::OK);

        let overwrite = serde_json::json!({
            "siteid": "s1", "url": "/page", "key": "views", "num": 3
        });
        let second = send(router.clone(), post_json("/api/count", &overwrite)).await;
        assert_eq!(second.status(), StatusCode::OK);

        let read = send(router, get_request("/api/count?siteid=s1&url=/page&key=views")).await;
        assert_eq!(read.status(), StatusCode::OK);
        let value = response_json(read).await;
        assert_eq!(
            value.get("data").and_then(|data| data.get("num")).and_then(serde_json::Value::as_i64),
            Some(3)
        );
    }

    #[tokio::test]
    async fn increment_endpoint_accumulates() {
        let router = test_router();

        let first = serde_json::json!({
            "siteid": "s1", "url": "/page", "key": "likes", "increment": 5
        });
        let response = send(router.clone(), post_json("/api/increment", &first)).await;
        assert_eq!(response.status(), StatusCode::OK);

        let second = serde_json::json!({
            "siteid": "s1", "url": "/page", "key": "likes", "increment": -2
        });
        let response = send(router, post_json("/api/increment", &second)).await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(
            value.get("data").and_then(|data| data.get("num")).and_then(serde_json::Value::as_i64),
            Some(3)
        );
    }

    #[tokio::test]
    async fn batch_get_preserves_request_order_and_fills_zeros() {
        let router = test_router();

        let seed = serde_json::json!({
            "siteid": "s1", "url": "/page", "key": "b", "num": 5
        });
        let seeded = send(router.clone(), post_json("/api/count", &seed)).await;
        assert_eq!(seeded.status(), StatusCode::OK);

        let payload = serde_json::json!({
            "siteid": "s1", "url": "/page", "keys": ["c", "b", "a", "b"]
        });
        let response = send(router, post_json("/api/count/batch", &payload)).await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        let entries = data_entries(&value);
        assert_eq!(
            entries,
            vec![
                ("c".to_string(), 0),
                ("b".to_string(), 5),
                ("a".to_string(), 0),
            ]
        );
    }

    #[tokio::test]
    async fn batch_increment_applies_in_order_and_reports_final_values() {
        let router = test_router();

        let payload = serde_json::json!({
            "siteid": "s1",
            "url": "/page",
            "counters": [
                {"key": "a", "increment": 5},
                {"key": "k", "increment": 1},
                {"key": "k", "increment": 2}
            ]
        });
        let response = send(router.clone(), post_json("/api/increment/batch", &payload)).await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        let entries = data_entries(&value);
        assert_eq!(entries, vec![("a".to_string(), 5), ("k".to_string(), 3)]);

        let read = send(router, get_request("/api/count?siteid=s1&url=/page&key=k")).await;
        let read_value = response_json(read).await;
        assert_eq!(
            read_value
                .get("data")
                .and_then(|data| data.get("num"))
                .and_then(serde_json::Value::as_i64),
            Some(3)
        );
    }

    #[tokio::test]
    async fn batch_increment_failure_rolls_back_and_maps_to_bad_request() {
        let router = test_router();

        let seed = serde_json::json!({
            "siteid": "s1", "url": "/page", "key": "b", "num": i64::MAX
        });
        let seeded = send(router.clone(), post_json("/api/count", &seed)).await;
        assert_eq!(seeded.status(), StatusCode::OK);

        let payload = serde_json::json!({
            "siteid": "s1",
            "url": "/page",
            "counters": [
                {"key": "a", "increment": 1},
                {"key": "b", "increment": 1}
            ]
        });
        let response = send(router.clone(), post_json("/api/increment/batch", &payload)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        // The write to "a" must have been rolled back with the batch.
        let read = send(router, get_request("/api/count?siteid=s1&url=/page&key=a")).await;
        assert_eq!(read.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn empty_site_id_is_rejected_before_the_store_is_touched() {
        let payload = serde_json::json!({
            "siteid": "", "url": "/page", "key": "views", "num": 1
        });
        let response = send(test_router(), post_json("/api/count", &payload)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let value = response_json(response).await;
        assert_eq!(value.get("code").and_then(serde_json::Value::as_u64), Some(400));
    }

    #[tokio::test]
    async fn malformed_json_returns_bad_request_envelope() {
        let request = Request::builder()
            .uri("/api/increment/batch")
            .method("POST")
            .header("content-type", "application/json")
            .body(Body::from("{".to_string()))
            .unwrap_or_else(|err| panic!("failed to build request: {err}"));

        let response = send(test_router(), request).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let value = response_json(response).await;
        assert_eq!(value.get("code").and_then(serde_json::Value::as_u64), Some(400));
        assert!(
            value
                .get("message")
                .and_then(serde_json::Value::as_str)
                .is_some_and(|message| message.starts_with("invalid request body")),
            "unexpected message: {value}"
        );
    }

    #[tokio::test]
    async fn telemetry_counters_track_success_and_failure() {
        let state = test_state(2500);
        let router = app(state.clone());

        let seed = serde_json::json!({
            "siteid": "s1", "url": "/page", "key": "views", "num": 1
        });
        let seeded = send(router.clone(), post_json("/api/count", &seed)).await;
        assert_eq!(seeded.status(), StatusCode::OK);

        let missing = send(router, get_request("/api/count?siteid=s1&url=/page&key=gone")).await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let snapshot = state.telemetry.snapshot();
        assert_eq!(snapshot.requests_total, 2);
        assert_eq!(snapshot.requests_success_total, 2);
        assert_eq!(snapshot.not_found_total, 1);
        assert_eq!(snapshot.requests_failure_total, 1);
    }
}
