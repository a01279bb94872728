//! Domain model and seams for churn prediction feedback.
//!
//! The crate owns the record/ledger contracts, the [`FeedbackController`]
//! state machine that reconciles ground truth against stored predictions,
//! and the traits through which storage, retraining and the external
//! prediction service are injected.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

pub mod controller;
pub mod memory;

pub use controller::{FeedbackController, FeedbackOutcome, FeedbackStatus};

pub type CustomerId = i64;

pub const DEFAULT_RETRAIN_THRESHOLD: u64 = 5;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum FeedbackError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("customer not found: {0}")]
    NotFound(CustomerId),
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Binary churn label as persisted for both predicted and actual outputs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "i64", into = "i64")]
pub struct ChurnLabel(u8);

impl ChurnLabel {
    pub const ZERO: Self = Self(0);
    pub const ONE: Self = Self(1);

    #[must_use]
    pub fn as_i64(self) -> i64 {
        i64::from(self.0)
    }
}

impl TryFrom<i64> for ChurnLabel {
    type Error = FeedbackError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::ZERO),
            1 => Ok(Self::ONE),
            other => Err(FeedbackError::Validation(format!(
                "churn label MUST be 0 or 1, got {other}"
            ))),
        }
    }
}

impl From<ChurnLabel> for i64 {
    fn from(value: ChurnLabel) -> Self {
        value.as_i64()
    }
}

impl Display for ChurnLabel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub const FEATURE_FIELDS: [&str; 13] = [
    "tenure",
    "cityTier",
    "warehouseToHome",
    "gender",
    "hoursSpentOnApp",
    "devicesRegistered",
    "preferredOrderCategory",
    "satisfactionScore",
    "maritalStatus",
    "numberOfAddresses",
    "complaints",
    "orderAmountHike",
    "daysSinceLastOrder",
];

/// Customer attributes at prediction time. Opaque beyond storage and
/// snapshotting.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FeatureVector {
    pub tenure: f64,
    pub city_tier: f64,
    pub warehouse_to_home: f64,
    pub gender: f64,
    pub hours_spent_on_app: f64,
    pub devices_registered: f64,
    pub preferred_order_category: f64,
    pub satisfaction_score: f64,
    pub marital_status: f64,
    pub number_of_addresses: f64,
    pub complaints: f64,
    pub order_amount_hike: f64,
    pub days_since_last_order: f64,
}

impl FeatureVector {
    #[must_use]
    pub fn from_array(values: [f64; 13]) -> Self {
        let [
            tenure,
            city_tier,
            warehouse_to_home,
            gender,
            hours_spent_on_app,
            devices_registered,
            preferred_order_category,
            satisfaction_score,
            marital_status,
            number_of_addresses,
            complaints,
            order_amount_hike,
            days_since_last_order,
        ] = values;
        Self {
            tenure,
            city_tier,
            warehouse_to_home,
            gender,
            hours_spent_on_app,
            devices_registered,
            preferred_order_category,
            satisfaction_score,
            marital_status,
            number_of_addresses,
            complaints,
            order_amount_hike,
            days_since_last_order,
        }
    }

    /// Values in [`FEATURE_FIELDS`] order.
    #[must_use]
    pub fn as_array(&self) -> [f64; 13] {
        [
            self.tenure,
            self.city_tier,
            self.warehouse_to_home,
            self.gender,
            self.hours_spent_on_app,
            self.devices_registered,
            self.preferred_order_category,
            self.satisfaction_score,
            self.marital_status,
            self.number_of_addresses,
            self.complaints,
            self.order_amount_hike,
            self.days_since_last_order,
        ]
    }

    /// Extracts the feature vector from a flat JSON object such as a form
    /// submission. Numeric strings are accepted; unrelated keys are ignored.
    ///
    /// # Errors
    /// Returns [`FeedbackError::Validation`] listing every missing field, or
    /// naming the first field that is not a finite number.
    pub fn from_json(value: &Value) -> Result<Self, FeedbackError> {
        let object = require_object(value)?;

        let missing = FEATURE_FIELDS
            .iter()
            .copied()
            .filter(|name| object.get(*name).filter(|value| !value.is_null()).is_none())
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            return Err(FeedbackError::Validation(format!(
                "Missing fields: {}",
                missing.join(", ")
            )));
        }

        let mut values = [0.0_f64; 13];
        for (slot, name) in values.iter_mut().zip(FEATURE_FIELDS) {
            let raw = object.get(name).unwrap_or(&Value::Null);
            *slot = lenient_number(name, raw)?;
        }

        Ok(Self::from_array(values))
    }

    /// # Errors
    /// Returns [`FeedbackError::Validation`] when any value is NaN or infinite.
    pub fn validate(&self) -> Result<(), FeedbackError> {
        for (name, value) in FEATURE_FIELDS.iter().zip(self.as_array()) {
            if !value.is_finite() {
                return Err(FeedbackError::Validation(format!(
                    "{name} MUST be a finite number"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChurnRecord {
    pub customer_id: CustomerId,
    #[serde(flatten)]
    pub features: FeatureVector,
    pub predicted_output: Option<ChurnLabel>,
    pub actual_output: Option<ChurnLabel>,
    pub coupons: Option<f64>,
    pub cashback: Option<f64>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub actual_recorded_at: Option<OffsetDateTime>,
}

/// Prediction-side fields written by `RecordStore::upsert_prediction`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PredictionWrite {
    pub customer_id: CustomerId,
    pub features: FeatureVector,
    pub predicted_output: ChurnLabel,
    pub coupons: Option<f64>,
    pub cashback: Option<f64>,
}

impl PredictionWrite {
    /// # Errors
    /// Returns [`FeedbackError::Validation`] for non-finite features or
    /// incentive values.
    pub fn validate(&self) -> Result<(), FeedbackError> {
        self.features.validate()?;
        for (name, value) in [("coupons", self.coupons), ("cashback", self.cashback)] {
            if value.is_some_and(|inner| !inner.is_finite()) {
                return Err(FeedbackError::Validation(format!(
                    "{name} MUST be a finite number"
                )));
            }
        }
        Ok(())
    }
}

/// Result of the conditional write-once update on `actual_output`.
#[derive(Debug, Clone, PartialEq)]
pub struct OutcomeCommit {
    pub applied: bool,
    pub record: ChurnRecord,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MispredictionEntry {
    pub entry_id: Ulid,
    pub customer_id: CustomerId,
    #[serde(flatten)]
    pub features: FeatureVector,
    pub predicted_output: ChurnLabel,
    pub actual_output: ChurnLabel,
    pub coupons: Option<f64>,
    pub cashback: Option<f64>,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

impl MispredictionEntry {
    /// Snapshots a record whose committed outcome disagrees with its
    /// prediction. Returns `None` when the record is not a misprediction.
    #[must_use]
    pub fn snapshot(record: &ChurnRecord, recorded_at: OffsetDateTime) -> Option<Self> {
        let predicted_output = record.predicted_output?;
        let actual_output = record.actual_output?;
        if predicted_output == actual_output {
            return None;
        }

        Some(Self {
            entry_id: Ulid::new(),
            customer_id: record.customer_id,
            features: record.features,
            predicted_output,
            actual_output,
            coupons: record.coupons,
            cashback: record.cashback,
            recorded_at,
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetrainMode {
    /// Every mismatch at or above the threshold triggers retraining. The
    /// ledger is never reset.
    #[default]
    Continuous,
    Disabled,
}

impl RetrainMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Continuous => "continuous",
            Self::Disabled => "disabled",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "continuous" => Some(Self::Continuous),
            "disabled" => Some(Self::Disabled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeedbackPolicy {
    pub retrain_threshold: u64,
    #[serde(default)]
    pub retrain_mode: RetrainMode,
}

impl Default for FeedbackPolicy {
    fn default() -> Self {
        Self {
            retrain_threshold: DEFAULT_RETRAIN_THRESHOLD,
            retrain_mode: RetrainMode::Continuous,
        }
    }
}

impl FeedbackPolicy {
    /// # Errors
    /// Returns [`FeedbackError::Configuration`] when the threshold is zero.
    pub fn validate(&self) -> Result<(), FeedbackError> {
        if self.retrain_threshold == 0 {
            return Err(FeedbackError::Configuration(
                "retrain_threshold MUST be >= 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Decodes and validates a policy from JSON.
    ///
    /// # Errors
    /// Returns [`FeedbackError::Configuration`] when decoding fails or the
    /// decoded policy is invalid.
    pub fn from_json(value: &Value) -> Result<Self, FeedbackError> {
        let policy: Self = serde_json::from_value(value.clone()).map_err(|err| {
            FeedbackError::Configuration(format!("invalid feedback policy JSON payload: {err}"))
        })?;
        policy.validate()?;
        Ok(policy)
    }

    #[must_use]
    pub fn should_retrain(&self, wrong_count: u64) -> bool {
        self.retrain_mode == RetrainMode::Continuous && wrong_count >= self.retrain_threshold
    }
}

pub trait RecordStore: Send + Sync {
    /// Creates the record or overwrites its prediction-side fields. Never
    /// touches `actual_output`.
    ///
    /// # Errors
    /// Returns [`FeedbackError::Validation`] or [`FeedbackError::Persistence`].
    fn upsert_prediction(&self, write: &PredictionWrite) -> Result<ChurnRecord, FeedbackError>;

    /// Creates the record or replaces only its feature vector.
    ///
    /// # Errors
    /// Returns [`FeedbackError::Validation`] or [`FeedbackError::Persistence`].
    fn save_features(
        &self,
        customer_id: CustomerId,
        features: &FeatureVector,
    ) -> Result<ChurnRecord, FeedbackError>;

    /// # Errors
    /// Returns [`FeedbackError::Persistence`] when the store is unavailable.
    fn exists(&self, customer_id: CustomerId) -> Result<bool, FeedbackError>;

    /// # Errors
    /// Returns [`FeedbackError::NotFound`] when no record exists.
    fn get(&self, customer_id: CustomerId) -> Result<ChurnRecord, FeedbackError>;

    /// Sets `actual_output` only if it is currently unset. Concurrent callers
    /// for one customer observe exactly one `applied = true`.
    ///
    /// # Errors
    /// Returns [`FeedbackError::NotFound`] when no record exists.
    fn record_actual_output(
        &self,
        customer_id: CustomerId,
        actual_output: ChurnLabel,
    ) -> Result<OutcomeCommit, FeedbackError>;

    /// # Errors
    /// Returns [`FeedbackError::Persistence`] when the store is unavailable.
    fn latest(&self) -> Result<Option<ChurnRecord>, FeedbackError>;
}

pub trait MispredictionLedger: Send + Sync {
    /// Inserts the entry unless one already exists for its customer.
    /// Returns whether this call inserted.
    ///
    /// # Errors
    /// Returns [`FeedbackError::Persistence`] when the insert fails.
    fn append_if_absent(&self, entry: &MispredictionEntry) -> Result<bool, FeedbackError>;

    /// # Errors
    /// Returns [`FeedbackError::Persistence`] when the store is unavailable.
    fn count(&self) -> Result<u64, FeedbackError>;

    /// Entries in insertion order.
    ///
    /// # Errors
    /// Returns [`FeedbackError::Persistence`] when the store is unavailable.
    fn entries(&self, limit: Option<usize>) -> Result<Vec<MispredictionEntry>, FeedbackError>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TriggerDisposition {
    Started,
    AlreadyRunning,
    NotConfigured,
    SpawnFailed,
}

impl TriggerDisposition {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::AlreadyRunning => "already_running",
            Self::NotConfigured => "not_configured",
            Self::SpawnFailed => "spawn_failed",
        }
    }
}

/// Fire-and-forget trigger for the external retraining job. Implementations
/// return immediately and never report job failures to the caller.
pub trait RetrainInvoker: Send + Sync {
    fn trigger(&self) -> TriggerDisposition;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRetrainInvoker;

impl RetrainInvoker for NoopRetrainInvoker {
    fn trigger(&self) -> TriggerDisposition {
        tracing::debug!("retraining requested but no retraining job is configured");
        TriggerDisposition::NotConfigured
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PredictionResponse {
    pub prediction: ChurnLabel,
    pub coupons: Option<f64>,
    pub cashback: Option<f64>,
    /// Body as returned by the prediction service, passed through to callers.
    pub raw: Value,
}

impl PredictionResponse {
    /// # Errors
    /// Returns [`FeedbackError::Upstream`] when the body lacks a valid
    /// `prediction` or carries non-numeric incentives.
    pub fn from_json(raw: Value) -> Result<Self, FeedbackError> {
        let object = raw.as_object().ok_or_else(|| {
            FeedbackError::Upstream("prediction response MUST be a JSON object".to_string())
        })?;

        let prediction = object
            .get("prediction")
            .filter(|value| !value.is_null())
            .ok_or_else(|| {
                FeedbackError::Upstream("prediction response is missing prediction".to_string())
            })
            .and_then(|value| {
                normalize_label("prediction", value)
                    .map_err(|err| FeedbackError::Upstream(err.to_string()))
            })?;

        let mut incentives = [None, None];
        for (slot, name) in incentives.iter_mut().zip(["coupons", "cashback"]) {
            *slot = match object.get(name) {
                None | Some(Value::Null) => None,
                Some(value) => Some(
                    lenient_number(name, value)
                        .map_err(|err| FeedbackError::Upstream(err.to_string()))?,
                ),
            };
        }
        let [coupons, cashback] = incentives;

        Ok(Self {
            prediction,
            coupons,
            cashback,
            raw,
        })
    }
}

/// Seam to the external prediction service.
pub trait PredictionClient: Send + Sync {
    /// # Errors
    /// Returns [`FeedbackError::Upstream`] when the service is unreachable
    /// or answers with an unusable body.
    fn predict(&self, payload: &Value) -> Result<PredictionResponse, FeedbackError>;
}

/// # Errors
/// Returns [`FeedbackError::Validation`] when `value` is not a JSON object.
pub fn require_object(value: &Value) -> Result<&Map<String, Value>, FeedbackError> {
    value.as_object().ok_or_else(|| {
        FeedbackError::Validation("request body MUST be a JSON object".to_string())
    })
}

/// # Errors
/// Returns [`FeedbackError::Validation`] when the field is absent or null.
pub fn required_field<'a>(
    object: &'a Map<String, Value>,
    name: &str,
) -> Result<&'a Value, FeedbackError> {
    object
        .get(name)
        .filter(|value| !value.is_null())
        .ok_or_else(|| FeedbackError::Validation(format!("{name} MUST be provided")))
}

/// Accepts JSON numbers and numeric strings, as submitted by HTML forms.
///
/// # Errors
/// Returns [`FeedbackError::Validation`] when the value is not a finite
/// number.
pub fn lenient_number(field: &str, value: &Value) -> Result<f64, FeedbackError> {
    let parsed = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(raw) => raw.trim().parse::<f64>().ok(),
        _ => None,
    };

    match parsed {
        Some(number) if number.is_finite() => Ok(number),
        _ => Err(FeedbackError::Validation(format!(
            "{field} MUST be a number, got {value}"
        ))),
    }
}

/// Normalizes an inbound output (`0`, `1`, `1.0`, `"1"`) to a [`ChurnLabel`].
///
/// # Errors
/// Returns [`FeedbackError::Validation`] for any other value.
pub fn normalize_label(field: &str, value: &Value) -> Result<ChurnLabel, FeedbackError> {
    let number = lenient_number(field, value)?;
    if number.abs() < f64::EPSILON {
        Ok(ChurnLabel::ZERO)
    } else if (number - 1.0).abs() < f64::EPSILON {
        Ok(ChurnLabel::ONE)
    } else {
        Err(FeedbackError::Validation(format!(
            "{field} MUST be 0 or 1, got {value}"
        )))
    }
}

/// # Errors
/// Returns [`FeedbackError::Validation`] when the value is not an integral
/// number representable as a customer id.
#[allow(clippy::cast_possible_truncation)]
pub fn parse_customer_id(value: &Value) -> Result<CustomerId, FeedbackError> {
    if let Some(id) = value.as_i64() {
        return Ok(id);
    }

    let number = lenient_number("customer_id", value)?;
    if number.fract().abs() > f64::EPSILON || number.abs() > 9_007_199_254_740_992.0 {
        return Err(FeedbackError::Validation(format!(
            "customer_id MUST be an integer, got {value}"
        )));
    }
    Ok(number as CustomerId)
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`FeedbackError::Validation`] when parsing fails or the
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, FeedbackError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| FeedbackError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(FeedbackError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`FeedbackError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, FeedbackError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            FeedbackError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
