//! In-process store and retrain doubles used by tests and embedders that do
//! not need durable storage.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::{
    now_utc, ChurnLabel, ChurnRecord, CustomerId, FeatureVector, FeedbackError,
    MispredictionEntry, MispredictionLedger, OutcomeCommit, PredictionWrite, RecordStore,
    RetrainInvoker, TriggerDisposition,
};

#[derive(Debug, Default)]
struct MemoryState {
    records: BTreeMap<CustomerId, ChurnRecord>,
    ledger: Vec<MispredictionEntry>,
    latest: Option<CustomerId>,
}

/// Mutex-guarded record store and misprediction ledger. Every operation
/// holds the lock for its full duration, which makes the conditional writes
/// linearizable.
#[derive(Debug, Default)]
pub struct InMemoryChurnStore {
    state: Mutex<MemoryState>,
}

impl InMemoryChurnStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, FeedbackError> {
        self.state
            .lock()
            .map_err(|_| FeedbackError::Persistence("in-memory store lock poisoned".to_string()))
    }
}

impl RecordStore for InMemoryChurnStore {
    fn upsert_prediction(&self, write: &PredictionWrite) -> Result<ChurnRecord, FeedbackError> {
        write.validate()?;
        let now = now_utc();
        let mut state = self.lock()?;
        let inserted = !state.records.contains_key(&write.customer_id);

        let record = state
            .records
            .entry(write.customer_id)
            .and_modify(|existing| {
                existing.features = write.features;
                existing.predicted_output = Some(write.predicted_output);
                existing.coupons = write.coupons;
                existing.cashback = write.cashback;
                existing.updated_at = now;
            })
            .or_insert_with(|| ChurnRecord {
                customer_id: write.customer_id,
                features: write.features,
                predicted_output: Some(write.predicted_output),
                actual_output: None,
                coupons: write.coupons,
                cashback: write.cashback,
                created_at: now,
                updated_at: now,
                actual_recorded_at: None,
            })
            .clone();
        if inserted {
            state.latest = Some(write.customer_id);
        }
        Ok(record)
    }

    fn save_features(
        &self,
        customer_id: CustomerId,
        features: &FeatureVector,
    ) -> Result<ChurnRecord, FeedbackError> {
        features.validate()?;
        let now = now_utc();
        let mut state = self.lock()?;

        let record = state
            .records
            .entry(customer_id)
            .and_modify(|existing| {
                existing.features = *features;
                existing.updated_at = now;
            })
            .or_insert_with(|| ChurnRecord {
                customer_id,
                features: *features,
                predicted_output: None,
                actual_output: None,
                coupons: None,
                cashback: None,
                created_at: now,
                updated_at: now,
                actual_recorded_at: None,
            })
            .clone();
        state.latest = Some(customer_id);
        Ok(record)
    }

    fn exists(&self, customer_id: CustomerId) -> Result<bool, FeedbackError> {
        Ok(self.lock()?.records.contains_key(&customer_id))
    }

    fn get(&self, customer_id: CustomerId) -> Result<ChurnRecord, FeedbackError> {
        self.lock()?
            .records
            .get(&customer_id)
            .cloned()
            .ok_or(FeedbackError::NotFound(customer_id))
    }

    fn record_actual_output(
        &self,
        customer_id: CustomerId,
        actual_output: ChurnLabel,
    ) -> Result<OutcomeCommit, FeedbackError> {
        let mut state = self.lock()?;
        let record = state
            .records
            .get_mut(&customer_id)
            .ok_or(FeedbackError::NotFound(customer_id))?;

        if record.actual_output.is_some() {
            return Ok(OutcomeCommit {
                applied: false,
                record: record.clone(),
            });
        }

        let now = now_utc();
        record.actual_output = Some(actual_output);
        record.actual_recorded_at = Some(now);
        record.updated_at = now;
        let record = record.clone();

        Ok(OutcomeCommit {
            applied: true,
            record,
        })
    }

    fn latest(&self) -> Result<Option<ChurnRecord>, FeedbackError> {
        let state = self.lock()?;
        Ok(state
            .latest
            .and_then(|customer_id| state.records.get(&customer_id).cloned()))
    }
}

impl MispredictionLedger for InMemoryChurnStore {
    fn append_if_absent(&self, entry: &MispredictionEntry) -> Result<bool, FeedbackError> {
        let mut state = self.lock()?;
        if state
            .ledger
            .iter()
            .any(|existing| existing.customer_id == entry.customer_id)
        {
            return Ok(false);
        }
        state.ledger.push(entry.clone());
        Ok(true)
    }

    fn count(&self) -> Result<u64, FeedbackError> {
        let len = self.lock()?.ledger.len();
        u64::try_from(len)
            .map_err(|_| FeedbackError::Persistence("ledger size overflow".to_string()))
    }

    fn entries(&self, limit: Option<usize>) -> Result<Vec<MispredictionEntry>, FeedbackError> {
        let state = self.lock()?;
        let take = limit.unwrap_or(state.ledger.len());
        Ok(state.ledger.iter().take(take).cloned().collect())
    }
}

/// Counts triggers and always reports `Started`.
#[derive(Debug, Default)]
pub struct CountingRetrainInvoker {
    triggers: AtomicU64,
}

impl CountingRetrainInvoker {
    #[must_use]
    pub fn trigger_count(&self) -> u64 {
        self.triggers.load(Ordering::SeqCst)
    }
}

impl RetrainInvoker for CountingRetrainInvoker {
    fn trigger(&self) -> TriggerDisposition {
        self.triggers.fetch_add(1, Ordering::SeqCst);
        TriggerDisposition::Started
    }
}
