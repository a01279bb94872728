use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use churn_feedback_core::{
    normalize_label, parse_customer_id, require_object, required_field, FeatureVector,
    FeedbackController, FeedbackError, FeedbackPolicy, PredictionClient, PredictionWrite,
    RecordStore, RetrainMode, DEFAULT_RETRAIN_THRESHOLD,
};
use churn_feedback_provider::{
    HttpPredictionClient, ProcessRetrainInvoker, RetrainCommand, RetrainStats,
    DEFAULT_PREDICTION_TIMEOUT_MS,
};
use churn_feedback_store_sqlite::{SqliteChurnStore, BUSY_TIMEOUT_MS};
use clap::Parser;
use serde::Serialize;
use serde_json::{json, Value};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Clone)]
struct ServiceState {
    store: Arc<SqliteChurnStore>,
    controller: FeedbackController,
    prediction: Arc<dyn PredictionClient>,
    retrain: Option<ProcessRetrainInvoker>,
    operation_timeout: Duration,
    prediction_timeout: Duration,
    telemetry: Arc<ServiceTelemetry>,
}

#[derive(Debug, Clone)]
struct ServiceFailure {
    status: StatusCode,
    code: &'static str,
    message: String,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError<'a> {
    error: &'a str,
    code: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    timeout_ms: u64,
    prediction_timeout_ms: u64,
    policy: FeedbackPolicy,
    telemetry: ServiceTelemetrySnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    retrain: Option<RetrainStats>,
}

#[derive(Debug, Default)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetry {
    requests_total: AtomicU64,
    requests_success_total: AtomicU64,
    requests_failure_total: AtomicU64,
    timeout_total: AtomicU64,
    invalid_json_total: AtomicU64,
    validation_error_total: AtomicU64,
    customer_not_found_total: AtomicU64,
    upstream_error_total: AtomicU64,
    persistence_error_total: AtomicU64,
    schema_unavailable_total: AtomicU64,
    other_error_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetrySnapshot {
    requests_total: u64,
    requests_success_total: u64,
    requests_failure_total: u64,
    timeout_total: u64,
    invalid_json_total: u64,
    validation_error_total: u64,
    customer_not_found_total: u64,
    upstream_error_total: u64,
    persistence_error_total: u64,
    schema_unavailable_total: u64,
    other_error_total: u64,
}

#[derive(Debug, Parser)]
#[command(name = "churn-feedback-service")]
#[command(about = "HTTP service for churn prediction feedback and retraining triggers")]
struct Args {
    #[arg(long, env = "CHURN_DB", default_value = "./churn_feedback.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "CHURN_BIND", default_value = "127.0.0.1:5000")]
    bind: SocketAddr,
    /// Must exceed the SQLite busy timeout so a lock wait cannot outlive its request.
    #[arg(long, env = "CHURN_OPERATION_TIMEOUT_MS", default_value_t = 7500)]
    operation_timeout_ms: u64,
    /// Skip schema migration at startup; `/ready` reports 503 until migrated.
    #[arg(long, env = "CHURN_NO_MIGRATE")]
    no_migrate: bool,
    #[arg(
        long,
        env = "CHURN_PREDICTION_URL",
        default_value = "http://127.0.0.1:5001/predict"
    )]
    prediction_url: String,
    #[arg(
        long,
        env = "CHURN_PREDICTION_TIMEOUT_MS",
        default_value_t = DEFAULT_PREDICTION_TIMEOUT_MS
    )]
    prediction_timeout_ms: u64,
    #[arg(long, env = "CHURN_RETRAIN_THRESHOLD", default_value_t = DEFAULT_RETRAIN_THRESHOLD)]
    retrain_threshold: u64,
    #[arg(
        long,
        env = "CHURN_RETRAIN_MODE",
        default_value = "continuous",
        value_parser = parse_retrain_mode
    )]
    retrain_mode: RetrainMode,
    #[arg(long, env = "CHURN_RETRAIN_PROGRAM", default_value = "python")]
    retrain_program: String,
    #[arg(
        long = "retrain-arg",
        env = "CHURN_RETRAIN_ARGS",
        value_delimiter = ',',
        default_value = "retrain_with_rl.py"
    )]
    retrain_args: Vec<String>,
    #[arg(long, env = "CHURN_RETRAIN_WORKDIR")]
    retrain_workdir: Option<PathBuf>,
}

fn parse_retrain_mode(value: &str) -> Result<RetrainMode, String> {
    RetrainMode::parse(value)
        .ok_or_else(|| format!("unknown retrain mode '{value}' (expected continuous|disabled)"))
}

impl IntoResponse for ServiceFailure {
    fn into_response(self) -> Response {
        let payload = ServiceError {
            error: &self.message,
            code: self.code,
        };
        (self.status, Json(payload)).into_response()
    }
}

impl ServiceState {
    fn failure(
        status: StatusCode,
        code: &'static str,
        message: impl Into<String>,
    ) -> ServiceFailure {
        ServiceFailure {
            status,
            code,
            message: message.into(),
        }
    }

    fn invalid_json_with_telemetry(&self, rejection: &JsonRejection) -> ServiceFailure {
        self.telemetry.record_failure("invalid_json", false);
        Self::failure(rejection.status(), "invalid_json", rejection.body_text())
    }

    fn classify_feedback_error(
        err: &FeedbackError,
        operation_label: &'static str,
    ) -> ServiceFailure {
        match err {
            FeedbackError::Validation(message) => {
                Self::failure(StatusCode::BAD_REQUEST, "validation_error", message.clone())
            }
            FeedbackError::NotFound(_) => {
                Self::failure(StatusCode::NOT_FOUND, "customer_not_found", "customer not found")
            }
            FeedbackError::Upstream(cause) => {
                tracing::warn!(
                    operation = operation_label,
                    %cause,
                    "prediction service call failed"
                );
                Self::failure(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "upstream_unavailable",
                    "prediction service unavailable",
                )
            }
            FeedbackError::Persistence(cause) => {
                tracing::error!(operation = operation_label, %cause, "store operation failed");
                Self::failure(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "persistence_error",
                    "internal storage error",
                )
            }
            FeedbackError::Configuration(cause) => {
                tracing::error!(operation = operation_label, %cause, "service misconfigured");
                Self::failure(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal server error",
                )
            }
        }
    }

    async fn run_blocking<T, F>(
        &self,
        operation_label: &'static str,
        op: F,
    ) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, FeedbackError> + Send + 'static,
    {
        self.run_blocking_within(self.operation_timeout, operation_label, op)
            .await
    }

    async fn run_blocking_within<T, F>(
        &self,
        timeout: Duration,
        operation_label: &'static str,
        op: F,
    ) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, FeedbackError> + Send + 'static,
    {
        self.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
        let handle = tokio::task::spawn_blocking(op);
        let join_result = tokio::time::timeout(timeout, handle).await.map_err(|_| {
            self.telemetry.record_failure("timeout", true);
            tracing::warn!(
                operation = operation_label,
                timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                "operation timed out"
            );
            Self::failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "timeout",
                format!("{operation_label} timed out after {} ms", timeout.as_millis()),
            )
        })?;

        let op_result = join_result.map_err(|err| {
            self.telemetry.record_failure("internal_error", false);
            tracing::error!(operation = operation_label, error = %err, "blocking task failed");
            Self::failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                format!("{operation_label} join failure"),
            )
        })?;

        match op_result {
            Ok(value) => {
                self.telemetry
                    .requests_success_total
                    .fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(err) => {
                let failure = Self::classify_feedback_error(&err, operation_label);
                self.telemetry.record_failure(failure.code, false);
                Err(failure)
            }
        }
    }

    fn body(&self, payload: Result<Json<Value>, JsonRejection>) -> Result<Value, ServiceFailure> {
        payload
            .map(|Json(value)| value)
            .map_err(|rejection| self.invalid_json_with_telemetry(&rejection))
    }
}

impl ServiceTelemetry {
    fn record_failure(&self, code: &str, timeout: bool) {
        self.requests_failure_total.fetch_add(1, Ordering::Relaxed);
        if timeout {
            self.timeout_total.fetch_add(1, Ordering::Relaxed);
        }
        match code {
            "timeout" => {}
            "invalid_json" => {
                self.invalid_json_total.fetch_add(1, Ordering::Relaxed);
            }
            "validation_error" => {
                self.validation_error_total.fetch_add(1, Ordering::Relaxed);
            }
            "customer_not_found" | "no_customer_data" => {
                self.customer_not_found_total.fetch_add(1, Ordering::Relaxed);
            }
            "upstream_unavailable" => {
                self.upstream_error_total.fetch_add(1, Ordering::Relaxed);
            }
            "persistence_error" => {
                self.persistence_error_total.fetch_add(1, Ordering::Relaxed);
            }
            "schema_unavailable" => {
                self.schema_unavailable_total.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.other_error_total.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn snapshot(&self) -> ServiceTelemetrySnapshot {
        ServiceTelemetrySnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_success_total: self.requests_success_total.load(Ordering::Relaxed),
            requests_failure_total: self.requests_failure_total.load(Ordering::Relaxed),
            timeout_total: self.timeout_total.load(Ordering::Relaxed),
            invalid_json_total: self.invalid_json_total.load(Ordering::Relaxed),
            validation_error_total: self.validation_error_total.load(Ordering::Relaxed),
            customer_not_found_total: self.customer_not_found_total.load(Ordering::Relaxed),
            upstream_error_total: self.upstream_error_total.load(Ordering::Relaxed),
            persistence_error_total: self.persistence_error_total.load(Ordering::Relaxed),
            schema_unavailable_total: self.schema_unavailable_total.load(Ordering::Relaxed),
            other_error_total: self.other_error_total.load(Ordering::Relaxed),
        }
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/save-churn-data", post(save_churn_data))
        .route("/predict", post(predict))
        .route("/check-customer", post(check_customer))
        .route("/record-actual-churn", post(record_actual_churn))
        .route("/wrong-prediction-count", get(wrong_prediction_count))
        .route("/latest-churn-data", get(latest_churn_data))
        .with_state(state)
}

fn validate_timeouts(args: &Args) -> Result<()> {
    if args.operation_timeout_ms <= BUSY_TIMEOUT_MS {
        bail!(
            "operation timeout ({} ms) must exceed the sqlite busy timeout ({BUSY_TIMEOUT_MS} ms)",
            args.operation_timeout_ms
        );
    }
    Ok(())
}

fn build_state(args: &Args) -> Result<ServiceState> {
    validate_timeouts(args)?;
    let store = Arc::new(SqliteChurnStore::open(&args.db)?);
    if args.no_migrate {
        tracing::warn!("schema migration skipped at startup");
    } else {
        store.migrate()?;
    }

    let retrain = ProcessRetrainInvoker::new(RetrainCommand {
        program: args.retrain_program.clone(),
        args: args.retrain_args.clone(),
        workdir: args.retrain_workdir.clone(),
    });
    let policy = FeedbackPolicy {
        retrain_threshold: args.retrain_threshold,
        retrain_mode: args.retrain_mode,
    };
    let controller = FeedbackController::new(
        store.clone(),
        store.clone(),
        Arc::new(retrain.clone()),
        policy,
    )?;

    let prediction_timeout = Duration::from_millis(args.prediction_timeout_ms);
    let prediction = HttpPredictionClient::new(&args.prediction_url, prediction_timeout)?;

    Ok(ServiceState {
        store,
        controller,
        prediction: Arc::new(prediction),
        retrain: Some(retrain),
        operation_timeout: Duration::from_millis(args.operation_timeout_ms),
        prediction_timeout,
        telemetry: Arc::new(ServiceTelemetry::default()),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "churn_feedback=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let state = build_state(&args)?;
    tracing::info!(
        bind = %args.bind,
        db = %args.db.display(),
        prediction_url = %args.prediction_url,
        retrain_threshold = args.retrain_threshold,
        retrain_mode = args.retrain_mode.as_str(),
        "churn feedback service starting"
    );

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timeout_ms: u64::try_from(state.operation_timeout.as_millis()).unwrap_or(u64::MAX),
        prediction_timeout_ms: u64::try_from(state.prediction_timeout.as_millis())
            .unwrap_or(u64::MAX),
        policy: state.controller.policy().clone(),
        telemetry: state.telemetry.snapshot(),
        retrain: state.retrain.as_ref().map(ProcessRetrainInvoker::stats),
    })
}

async fn ready(State(state): State<ServiceState>) -> Result<Json<Value>, ServiceFailure> {
    let store = state.store.clone();
    let (migrated, schema_version) = state
        .run_blocking("schema_status", move || {
            let schema_error = |err: anyhow::Error| FeedbackError::Persistence(format!("{err:#}"));
            let migrated = store.is_migrated().map_err(schema_error)?;
            let version = store.schema_version().map_err(schema_error)?;
            Ok((migrated, version))
        })
        .await?;

    if migrated {
        return Ok(Json(json!({
            "status": "ready",
            "schema_version": schema_version,
        })));
    }

    state.telemetry.record_failure("schema_unavailable", false);
    Err(ServiceState::failure(
        StatusCode::SERVICE_UNAVAILABLE,
        "schema_unavailable",
        "database schema is not ready; run `churnctl db migrate` before serving traffic",
    ))
}

async fn save_churn_data(
    State(state): State<ServiceState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>, ServiceFailure> {
    let body = state.body(payload)?;
    let store = state.store.clone();
    state
        .run_blocking("save_churn_data", move || {
            let features = FeatureVector::from_json(&body)?;
            let object = require_object(&body)?;
            let customer_id = parse_customer_id(required_field(object, "customer_id")?)?;
            store.save_features(customer_id, &features)
        })
        .await?;
    Ok(Json(json!({ "message": "Data Saved Successfully!" })))
}

async fn predict(
    State(state): State<ServiceState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>, ServiceFailure> {
    let body = state.body(payload)?;
    let store = state.store.clone();
    let prediction = state.prediction.clone();
    let raw = state
        .run_blocking_within(
            state.prediction_timeout + state.operation_timeout,
            "predict",
            move || {
                let features = FeatureVector::from_json(&body)?;
                let customer_id = require_object(&body)?
                    .get("customer_id")
                    .filter(|value| !value.is_null())
                    .map(parse_customer_id)
                    .transpose()?;

                let response = prediction.predict(&body)?;
                if let Some(customer_id) = customer_id {
                    store.upsert_prediction(&PredictionWrite {
                        customer_id,
                        features,
                        predicted_output: response.prediction,
                        coupons: response.coupons,
                        cashback: response.cashback,
                    })?;
                    tracing::debug!(
                        customer_id,
                        prediction = %response.prediction,
                        "prediction persisted"
                    );
                }
                Ok(response.raw)
            },
        )
        .await?;
    Ok(Json(raw))
}

async fn check_customer(
    State(state): State<ServiceState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>, ServiceFailure> {
    let body = state.body(payload)?;
    let store = state.store.clone();
    let exists = state
        .run_blocking("check_customer", move || {
            let object = require_object(&body)?;
            let customer_id = parse_customer_id(required_field(object, "customer_id")?)?;
            store.exists(customer_id)
        })
        .await?;
    Ok(Json(json!({ "exists": exists })))
}

async fn record_actual_churn(
    State(state): State<ServiceState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>, ServiceFailure> {
    let body = state.body(payload)?;
    let controller = state.controller.clone();
    let outcome = state
        .run_blocking("record_actual_churn", move || {
            let object = require_object(&body)?;
            let customer_id = parse_customer_id(required_field(object, "customer_id")?)?;
            let actual_output =
                normalize_label("actual_output", required_field(object, "actual_output")?)?;
            controller.record_outcome(customer_id, actual_output)
        })
        .await?;

    Ok(Json(json!({
        "message": outcome.message,
        "wrongCount": outcome.wrong_count,
        "status": outcome.status,
    })))
}

async fn wrong_prediction_count(
    State(state): State<ServiceState>,
) -> Result<Json<Value>, ServiceFailure> {
    let controller = state.controller.clone();
    let count = state
        .run_blocking("wrong_prediction_count", move || {
            controller.wrong_prediction_count()
        })
        .await?;
    Ok(Json(json!({ "wrongCount": count })))
}

async fn latest_churn_data(
    State(state): State<ServiceState>,
) -> Result<Json<Value>, ServiceFailure> {
    let store = state.store.clone();
    let latest = state
        .run_blocking("latest_churn_data", move || store.latest())
        .await?;

    let Some(record) = latest else {
        state.telemetry.record_failure("no_customer_data", false);
        return Err(ServiceState::failure(
            StatusCode::NOT_FOUND,
            "no_customer_data",
            "No customer data found",
        ));
    };

    let value = serde_json::to_value(&record).map_err(|err| {
        state.telemetry.record_failure("internal_error", false);
        tracing::error!(error = %err, "failed to serialize churn record");
        ServiceState::failure(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "internal server error",
        )
    })?;
    Ok(Json(value))
}
