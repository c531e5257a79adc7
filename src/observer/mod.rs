//! Read-only views of a training run.
//!
//! Everything here is built from drained, single-threaded state: the trainer
//! folds each batch's merged [`BatchStats`] into a [`WindowMetrics`] and
//! snapshots it at the reporting boundary. Snapshots can allocate; the
//! worker hot path never touches this module.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::gradient::{BatchStats, ConfusionMatrix};
use crate::readout::WeightMatrix;
use crate::trainer::TrainerConfig;

/// Running totals for one reporting window.
#[derive(Debug, Clone)]
pub struct WindowMetrics {
    confusion: ConfusionMatrix,
    loss_sum: f64,
    processed: u64,
}

impl WindowMetrics {
    pub fn new(num_classes: usize) -> Self {
        Self {
            confusion: ConfusionMatrix::new(num_classes),
            loss_sum: 0.0,
            processed: 0,
        }
    }

    pub fn absorb(&mut self, stats: &BatchStats) {
        self.confusion.merge(&stats.confusion);
        self.loss_sum += stats.loss_sum;
        self.processed += stats.processed;
    }

    pub fn processed(&self) -> u64 {
        self.processed
    }

    pub fn accuracy(&self) -> f64 {
        if self.processed == 0 {
            return 0.0;
        }
        self.confusion.correct() as f64 / self.processed as f64
    }

    pub fn mean_loss(&self) -> f64 {
        if self.processed == 0 {
            return 0.0;
        }
        self.loss_sum / self.processed as f64
    }

    /// Snapshot the window and start a fresh one.
    pub fn take(&mut self, epoch: usize, batch: Option<usize>) -> WindowReport {
        let report = WindowReport {
            epoch,
            batch,
            accuracy: self.accuracy(),
            loss: self.mean_loss(),
            processed: self.processed,
            confusion: self.confusion.clone(),
        };
        self.reset();
        report
    }

    pub fn evaluation(&self) -> EvalReport {
        EvalReport {
            accuracy: self.accuracy(),
            loss: self.mean_loss(),
            processed: self.processed,
            confusion: self.confusion.clone(),
        }
    }

    pub fn reset(&mut self) {
        self.confusion.reset();
        self.loss_sum = 0.0;
        self.processed = 0;
    }
}

/// Metrics for one epoch, or one batch when reporting per batch.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct WindowReport {
    pub epoch: usize,
    pub batch: Option<usize>,
    pub accuracy: f64,
    pub loss: f64,
    pub processed: u64,
    pub confusion: ConfusionMatrix,
}

/// Forward-pass metrics over the held-out subset.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EvalReport {
    pub accuracy: f64,
    pub loss: f64,
    pub processed: u64,
    pub confusion: ConfusionMatrix,
}

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TrainingReport {
    pub config: TrainerConfig,
    /// Seed actually used, including one picked from the clock.
    pub seed: u64,
    pub train_size: usize,
    pub test_size: usize,
    pub windows: Vec<WindowReport>,
    /// Accuracy over the last epoch.
    pub final_train_accuracy: f64,
    pub test: Option<EvalReport>,
    /// Non-finite per-cell updates discarded over the run.
    pub rejected_updates: usize,
    pub weights: WeightMatrix,
}
