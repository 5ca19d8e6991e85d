//! Experiment statistics.
//!
//! [`StatsAggregator`] turns tracking events into counter increments on the
//! experiment record held by an [`ExperimentStore`] and recomputes every
//! derived rate from the raw counters after each change.

use crate::model::{EventType, Experiment, ExperimentStats, Status, TrackingEvent};
use crate::{Error, Result};
use log::debug;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Partial update of an experiment record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExperimentUpdate {
    pub status: Option<Status>,
    pub results: Option<ExperimentStats>,
}

/// Persistence of experiment records.
pub trait ExperimentStore: Send + Sync {
    fn get_experiment(&self, id: &str) -> Option<Experiment>;
    /// Apply `update` and return the new record, or `None` for unknown ids.
    fn update_experiment(&self, id: &str, update: ExperimentUpdate) -> Option<Experiment>;
    /// Insert or replace a record.
    fn insert_experiment(&self, experiment: Experiment);
}

/// Process-local [`ExperimentStore`].
#[derive(Default)]
pub struct MemoryExperimentStore {
    records: Mutex<HashMap<String, Experiment>>,
}

impl MemoryExperimentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Experiment>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ExperimentStore for MemoryExperimentStore {
    fn get_experiment(&self, id: &str) -> Option<Experiment> {
        self.lock().get(id).cloned()
    }

    fn update_experiment(&self, id: &str, update: ExperimentUpdate) -> Option<Experiment> {
        let mut records = self.lock();
        let record = records.get_mut(id)?;
        if let Some(status) = update.status {
            record.status = status;
        }
        if let Some(results) = update.results {
            record.results = results;
        }
        Some(record.clone())
    }

    fn insert_experiment(&self, experiment: Experiment) {
        self.lock().insert(experiment.id.clone(), experiment);
    }
}

/// Applies tracking events to experiment statistics.
pub struct StatsAggregator {
    store: Arc<dyn ExperimentStore>,
    // serializes read-modify-write cycles against the store
    write: Mutex<()>,
}

impl StatsAggregator {
    pub fn new(store: Arc<dyn ExperimentStore>) -> Self {
        Self {
            store,
            write: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<dyn ExperimentStore> {
        &self.store
    }

    /// Count one event and return the recomputed statistics. Event types that
    /// carry no counter still validate the experiment id.
    pub fn apply(&self, experiment_id: &str, event_type: &EventType) -> Result<ExperimentStats> {
        let _guard = self.write.lock().unwrap_or_else(|e| e.into_inner());
        let experiment = self
            .store
            .get_experiment(experiment_id)
            .ok_or_else(|| Error::NotFound(format!("experiment {}", experiment_id)))?;

        let mut stats = experiment.results;
        if !count(&mut stats, event_type) {
            debug!("ignoring {:?} event for {}", event_type, experiment_id);
            return Ok(stats);
        }
        stats.recompute();
        self.store
            .update_experiment(
                experiment_id,
                ExperimentUpdate {
                    results: Some(stats.clone()),
                    ..Default::default()
                },
            )
            .ok_or_else(|| Error::NotFound(format!("experiment {}", experiment_id)))?;
        Ok(stats)
    }

    pub fn apply_event(&self, event: &TrackingEvent) -> Result<ExperimentStats> {
        self.apply(&event.experiment_id, &event.event_type)
    }

    /// Overwrite the counters of an experiment; derived fields are recomputed.
    pub fn seed(&self, experiment_id: &str, mut stats: ExperimentStats) -> Result<ExperimentStats> {
        let _guard = self.write.lock().unwrap_or_else(|e| e.into_inner());
        stats.recompute();
        self.store
            .update_experiment(
                experiment_id,
                ExperimentUpdate {
                    results: Some(stats.clone()),
                    ..Default::default()
                },
            )
            .ok_or_else(|| Error::NotFound(format!("experiment {}", experiment_id)))?;
        Ok(stats)
    }
}

/// Increment the counter matching `event_type`; false when none does.
fn count(stats: &mut ExperimentStats, event_type: &EventType) -> bool {
    let counter = match event_type {
        EventType::VariantView => &mut stats.variant_visitors,
        EventType::ControlView => &mut stats.visitors,
        EventType::VariantConversion => &mut stats.variant_conversions,
        EventType::ControlConversion => &mut stats.conversions,
        EventType::VariantClick | EventType::Unknown => return false,
    };
    *counter += 1;
    true
}
