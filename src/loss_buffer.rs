//! Running means of loss and measure values over an aggregation window.

use crate::{common::*, error::MetricError};

/// Scalar values produced by one optimization or evaluation step, keyed by name.
pub type LossRecord = BTreeMap<String, f64>;

/// Accumulates [LossRecord]s over an epoch or an evaluation pass.
///
/// The window has a fixed key schema: the first record added after a reset fixes
/// the key set, and every later record must carry exactly the same keys. A single
/// shared counter is used for all keys, so `mean(name) = sum(name) / count`.
#[derive(Debug, Clone, Default)]
pub struct LossBuffer {
    sums: BTreeMap<String, f64>,
    count: usize,
}

impl LossBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.sums.clear();
        self.count = 0;
    }

    /// Number of records added since the last reset.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn add(&mut self, record: &LossRecord) -> Result<(), MetricError> {
        if self.count == 0 {
            self.sums = record.keys().map(|name| (name.clone(), 0.0)).collect();
        } else if !self.sums.keys().eq(record.keys()) {
            return Err(MetricError::KeyMismatch {
                expected: self.sums.keys().cloned().collect(),
                found: record.keys().cloned().collect(),
            });
        }

        record.iter().for_each(|(name, value)| {
            if let Some(sum) = self.sums.get_mut(name) {
                *sum += value;
            }
        });
        self.count += 1;
        Ok(())
    }

    /// Current means of every key in the window.
    pub fn get_errors(&self) -> Result<LossRecord, MetricError> {
        if self.count == 0 {
            return Err(MetricError::EmptyWindow);
        }
        let count = self.count as f64;
        Ok(self
            .sums
            .iter()
            .map(|(name, sum)| (name.clone(), sum / count))
            .collect())
    }
}
