use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{
    now_utc, ChurnLabel, CustomerId, FeedbackError, FeedbackPolicy, MispredictionEntry,
    MispredictionLedger, RecordStore, RetrainInvoker, TriggerDisposition,
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackStatus {
    AlreadyRecorded,
    Correct,
    Recorded,
    Triggered,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct FeedbackOutcome {
    pub customer_id: CustomerId,
    pub status: FeedbackStatus,
    pub wrong_count: u64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retrain: Option<TriggerDisposition>,
}

/// Reconciles observed churn outcomes against stored predictions and
/// decides when accumulated mispredictions warrant retraining.
#[derive(Clone)]
pub struct FeedbackController {
    records: Arc<dyn RecordStore>,
    ledger: Arc<dyn MispredictionLedger>,
    retrain: Arc<dyn RetrainInvoker>,
    policy: FeedbackPolicy,
}

impl Debug for FeedbackController {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedbackController")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl FeedbackController {
    /// # Errors
    /// Returns [`FeedbackError::Configuration`] when `policy` is invalid.
    pub fn new(
        records: Arc<dyn RecordStore>,
        ledger: Arc<dyn MispredictionLedger>,
        retrain: Arc<dyn RetrainInvoker>,
        policy: FeedbackPolicy,
    ) -> Result<Self, FeedbackError> {
        policy.validate()?;
        Ok(Self {
            records,
            ledger,
            retrain,
            policy,
        })
    }

    #[must_use]
    pub fn policy(&self) -> &FeedbackPolicy {
        &self.policy
    }

    /// # Errors
    /// Returns [`FeedbackError::Persistence`] when the ledger is unavailable.
    pub fn wrong_prediction_count(&self) -> Result<u64, FeedbackError> {
        self.ledger.count()
    }

    /// Records the observed outcome for `customer_id`.
    ///
    /// Already-recorded outcomes are reported, never overwritten. A mismatch
    /// with the stored prediction is ledgered once per customer and, once the
    /// ledger reaches the retrain threshold, fires the retraining job without
    /// waiting for it.
    ///
    /// # Errors
    /// Returns [`FeedbackError::NotFound`] when the customer has no record,
    /// or [`FeedbackError::Persistence`] when a store operation fails.
    pub fn record_outcome(
        &self,
        customer_id: CustomerId,
        actual_output: ChurnLabel,
    ) -> Result<FeedbackOutcome, FeedbackError> {
        let record = self.records.get(customer_id)?;
        if record.actual_output.is_some() {
            return self.already_recorded(customer_id);
        }

        let commit = self.records.record_actual_output(customer_id, actual_output)?;
        if !commit.applied {
            return self.already_recorded(customer_id);
        }

        let Some(entry) = MispredictionEntry::snapshot(&commit.record, now_utc()) else {
            tracing::debug!(customer_id, %actual_output, "prediction confirmed by outcome");
            return Ok(FeedbackOutcome {
                customer_id,
                status: FeedbackStatus::Correct,
                wrong_count: self.ledger.count()?,
                message: "Actual output recorded; prediction was correct.".to_string(),
                retrain: None,
            });
        };

        let inserted = self.ledger.append_if_absent(&entry)?;
        let wrong_count = self.ledger.count()?;
        tracing::info!(
            customer_id,
            predicted = %entry.predicted_output,
            actual = %entry.actual_output,
            inserted,
            wrong_count,
            "misprediction recorded"
        );

        if self.policy.should_retrain(wrong_count) {
            let disposition = self.retrain.trigger();
            tracing::info!(
                wrong_count,
                threshold = self.policy.retrain_threshold,
                disposition = disposition.as_str(),
                "retrain threshold reached"
            );
            return Ok(FeedbackOutcome {
                customer_id,
                status: FeedbackStatus::Triggered,
                wrong_count,
                message: format!(
                    "There are {wrong_count} wrongly predicted outputs; applying retraining."
                ),
                retrain: Some(disposition),
            });
        }

        Ok(FeedbackOutcome {
            customer_id,
            status: FeedbackStatus::Recorded,
            wrong_count,
            message: format!("Actual output recorded; {wrong_count} wrongly predicted output(s)."),
            retrain: None,
        })
    }

    fn already_recorded(&self, customer_id: CustomerId) -> Result<FeedbackOutcome, FeedbackError> {
        tracing::debug!(customer_id, "actual output already recorded");
        Ok(FeedbackOutcome {
            customer_id,
            status: FeedbackStatus::AlreadyRecorded,
            wrong_count: self.ledger.count()?,
            message: "Actual output already registered for this customer.".to_string(),
            retrain: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{CountingRetrainInvoker, InMemoryChurnStore};
    use crate::{FeatureVector, PredictionWrite, RetrainMode};
    use proptest::prelude::*;

    fn must<T>(result: Result<T, FeedbackError>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("unexpected error: {err}"),
        }
    }

    struct Fixture {
        store: Arc<InMemoryChurnStore>,
        retrain: Arc<CountingRetrainInvoker>,
        controller: FeedbackController,
    }

    fn fixture(policy: FeedbackPolicy) -> Fixture {
        let store = Arc::new(InMemoryChurnStore::new());
        let retrain = Arc::new(CountingRetrainInvoker::default());
        let controller = must(FeedbackController::new(
            store.clone(),
            store.clone(),
            retrain.clone(),
            policy,
        ));
        Fixture {
            store,
            retrain,
            controller,
        }
    }

    fn features(seed: f64) -> FeatureVector {
        FeatureVector::from_array([seed; 13])
    }

    fn predict(store: &InMemoryChurnStore, customer_id: CustomerId, label: ChurnLabel) {
        must(store.upsert_prediction(&PredictionWrite {
            customer_id,
            features: features(1.0),
            predicted_output: label,
            coupons: Some(2.0),
            cashback: Some(100.0),
        }));
    }

    #[test]
    fn mismatch_is_recorded_below_threshold() {
        let fx = fixture(FeedbackPolicy::default());
        predict(&fx.store, 42, ChurnLabel::ONE);

        let outcome = must(fx.controller.record_outcome(42, ChurnLabel::ZERO));
        assert_eq!(outcome.status, FeedbackStatus::Recorded);
        assert_eq!(outcome.wrong_count, 1);
        assert!(outcome.message.contains("1 wrongly predicted output(s)"));
        assert_eq!(fx.retrain.trigger_count(), 0);

        let record = must(fx.store.get(42));
        assert_eq!(record.actual_output, Some(ChurnLabel::ZERO));
        assert!(record.actual_recorded_at.is_some());
    }

    #[test]
    fn fifth_mismatch_triggers_retraining_once() {
        let fx = fixture(FeedbackPolicy::default());
        for customer_id in 42..=46 {
            predict(&fx.store, customer_id, ChurnLabel::ONE);
        }

        for customer_id in 42..=45 {
            let outcome = must(fx.controller.record_outcome(customer_id, ChurnLabel::ZERO));
            assert_eq!(outcome.status, FeedbackStatus::Recorded);
        }
        assert_eq!(fx.retrain.trigger_count(), 0);

        let outcome = must(fx.controller.record_outcome(46, ChurnLabel::ZERO));
        assert_eq!(outcome.status, FeedbackStatus::Triggered);
        assert_eq!(outcome.wrong_count, 5);
        assert_eq!(outcome.retrain, Some(TriggerDisposition::Started));
        assert!(outcome.message.contains("applying retraining"));
        assert_eq!(fx.retrain.trigger_count(), 1);
    }

    #[test]
    fn resubmission_reports_already_recorded_without_mutation() {
        let fx = fixture(FeedbackPolicy::default());
        predict(&fx.store, 42, ChurnLabel::ONE);
        must(fx.controller.record_outcome(42, ChurnLabel::ZERO));

        let outcome = must(fx.controller.record_outcome(42, ChurnLabel::ONE));
        assert_eq!(outcome.status, FeedbackStatus::AlreadyRecorded);
        assert_eq!(outcome.wrong_count, 1);
        assert!(outcome.message.contains("already registered"));
        assert_eq!(must(fx.store.get(42)).actual_output, Some(ChurnLabel::ZERO));
        assert_eq!(must(fx.store.count()), 1);
    }

    #[test]
    fn unknown_customer_is_not_found() {
        let fx = fixture(FeedbackPolicy::default());
        let err = fx.controller.record_outcome(999, ChurnLabel::ONE);
        assert_eq!(err, Err(FeedbackError::NotFound(999)));
        assert_eq!(must(fx.store.count()), 0);
        assert!(!must(fx.store.exists(999)));
    }

    #[test]
    fn missing_prediction_is_not_a_misprediction() {
        let fx = fixture(FeedbackPolicy::default());
        must(fx.store.save_features(50, &features(3.0)));

        let outcome = must(fx.controller.record_outcome(50, ChurnLabel::ONE));
        assert_eq!(outcome.status, FeedbackStatus::Correct);
        assert_eq!(outcome.wrong_count, 0);
        assert_eq!(must(fx.store.get(50)).actual_output, Some(ChurnLabel::ONE));
    }

    #[test]
    fn matching_prediction_leaves_ledger_untouched() {
        let fx = fixture(FeedbackPolicy::default());
        predict(&fx.store, 7, ChurnLabel::ZERO);

        let outcome = must(fx.controller.record_outcome(7, ChurnLabel::ZERO));
        assert_eq!(outcome.status, FeedbackStatus::Correct);
        assert!(outcome.message.contains("prediction was correct"));
        assert_eq!(must(fx.store.count()), 0);
    }

    #[test]
    fn disabled_mode_never_triggers() {
        let fx = fixture(FeedbackPolicy {
            retrain_threshold: 1,
            retrain_mode: RetrainMode::Disabled,
        });
        predict(&fx.store, 1, ChurnLabel::ONE);

        let outcome = must(fx.controller.record_outcome(1, ChurnLabel::ZERO));
        assert_eq!(outcome.status, FeedbackStatus::Recorded);
        assert_eq!(outcome.wrong_count, 1);
        assert_eq!(fx.retrain.trigger_count(), 0);
    }

    #[test]
    fn invalid_policy_is_rejected() {
        let store = Arc::new(InMemoryChurnStore::new());
        let result = FeedbackController::new(
            store.clone(),
            store,
            Arc::new(CountingRetrainInvoker::default()),
            FeedbackPolicy {
                retrain_threshold: 0,
                retrain_mode: RetrainMode::Continuous,
            },
        );
        assert!(matches!(result, Err(FeedbackError::Configuration(_))));
    }

    #[test]
    fn concurrent_submissions_apply_exactly_once() {
        let fx = fixture(FeedbackPolicy::default());
        predict(&fx.store, 42, ChurnLabel::ONE);

        let handles = (0..8)
            .map(|_| {
                let controller = fx.controller.clone();
                std::thread::spawn(move || controller.record_outcome(42, ChurnLabel::ZERO))
            })
            .collect::<Vec<_>>();

        let mut applied = 0;
        for handle in handles {
            let outcome = match handle.join() {
                Ok(result) => must(result),
                Err(_) => panic!("worker thread panicked"),
            };
            if outcome.status != FeedbackStatus::AlreadyRecorded {
                applied += 1;
            }
        }

        assert_eq!(applied, 1);
        assert_eq!(must(fx.store.count()), 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn reported_count_matches_ledger(
            labels in proptest::collection::vec((any::<bool>(), any::<bool>()), 1..24),
            threshold in 1_u64..8,
        ) {
            let fx = fixture(FeedbackPolicy {
                retrain_threshold: threshold,
                retrain_mode: RetrainMode::Continuous,
            });
            let to_label = |flag: bool| if flag { ChurnLabel::ONE } else { ChurnLabel::ZERO };

            let mut previous = 0_u64;
            for (index, (predicted, actual)) in labels.iter().enumerate() {
                let customer_id = CustomerId::try_from(index).unwrap_or_default();
                predict(&fx.store, customer_id, to_label(*predicted));
                let outcome = must(fx.controller.record_outcome(customer_id, to_label(*actual)));

                prop_assert_eq!(outcome.wrong_count, must(fx.store.count()));
                prop_assert!(outcome.wrong_count >= previous);
                prop_assert_eq!(
                    outcome.status == FeedbackStatus::Triggered,
                    predicted != actual && outcome.wrong_count >= threshold
                );
                previous = outcome.wrong_count;
            }
        }
    }
}
