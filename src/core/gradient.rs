//! Gradient and confusion accumulation, and the between-batch weight update.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::barrier::Aggregate;
use crate::readout::{argmax, cross_entropy, softmax_in_place, WeightMatrix};

/// Per-cell `(sum, count)` of weight deltas for one batch.
#[derive(Debug, Clone, PartialEq)]
pub struct GradientAccumulator {
    cols: usize,
    sums: Vec<f64>,
    counts: Vec<u64>,
}

impl GradientAccumulator {
    pub fn new(num_classes: usize, num_outputs: usize) -> Self {
        let cols = num_outputs + 1;
        Self {
            cols,
            sums: vec![0.0; num_classes * cols],
            counts: vec![0; num_classes * cols],
        }
    }

    #[inline]
    pub fn add(&mut self, class: usize, col: usize, delta: f64) {
        let i = class * self.cols + col;
        self.sums[i] += delta;
        self.counts[i] += 1;
    }

    pub fn sum(&self, class: usize, col: usize) -> f64 {
        self.sums[class * self.cols + col]
    }

    pub fn count(&self, class: usize, col: usize) -> u64 {
        self.counts[class * self.cols + col]
    }

    pub fn total_count(&self) -> u64 {
        self.counts.iter().sum()
    }

    pub fn merge(&mut self, other: &Self) {
        debug_assert_eq!(self.sums.len(), other.sums.len());
        for (a, b) in self.sums.iter_mut().zip(&other.sums) {
            *a += b;
        }
        for (a, b) in self.counts.iter_mut().zip(&other.counts) {
            *a += b;
        }
    }

    pub fn reset(&mut self) {
        self.sums.fill(0.0);
        self.counts.fill(0);
    }

    /// Apply `sum / count` to every touched cell of `weights`, skipping
    /// updates that are not normal floats, and reset every cell.
    ///
    /// Returns how many non-finite updates were discarded.
    pub fn apply_to(&mut self, weights: &mut WeightMatrix) -> usize {
        debug_assert_eq!(weights.cols(), self.cols);
        let mut rejected = 0;
        for class in 0..weights.num_classes() {
            for col in 0..self.cols {
                let i = class * self.cols + col;
                let count = self.counts[i];
                if count > 0 {
                    let update = self.sums[i] / count as f64;
                    if update.is_normal() {
                        *weights.get_mut(class, col) += update;
                    } else if !update.is_finite() {
                        rejected += 1;
                    }
                }
                self.sums[i] = 0.0;
                self.counts[i] = 0;
            }
        }
        rejected
    }
}

/// Rows are true classes, columns predictions.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ConfusionMatrix {
    num_classes: usize,
    cells: Vec<u64>,
}

impl ConfusionMatrix {
    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            cells: vec![0; num_classes * num_classes],
        }
    }

    #[inline]
    pub fn record(&mut self, truth: usize, predicted: usize) {
        self.cells[truth * self.num_classes + predicted] += 1;
    }

    pub fn get(&self, truth: usize, predicted: usize) -> u64 {
        self.cells[truth * self.num_classes + predicted]
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn total(&self) -> u64 {
        self.cells.iter().sum()
    }

    pub fn correct(&self) -> u64 {
        (0..self.num_classes).map(|c| self.get(c, c)).sum()
    }

    pub fn off_diagonal(&self) -> u64 {
        self.total() - self.correct()
    }

    pub fn rows(&self) -> impl Iterator<Item = &[u64]> {
        self.cells.chunks(self.num_classes.max(1))
    }

    pub fn merge(&mut self, other: &Self) {
        for (a, b) in self.cells.iter_mut().zip(&other.cells) {
            *a += b;
        }
    }

    pub fn reset(&mut self) {
        self.cells.fill(0);
    }
}

impl std::fmt::Display for ConfusionMatrix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for row in self.rows() {
            for v in row {
                write!(f, "{v:6} ")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Learning hyperparameters a worker needs for one observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepParams {
    pub learning_rate: f64,
    pub l2: f64,
}

/// Everything one batch contributes. Workers fill a private copy per
/// observation and merge it into the barrier's shared copy.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchStats {
    pub gradients: GradientAccumulator,
    pub confusion: ConfusionMatrix,
    pub loss_sum: f64,
    pub processed: u64,
}

impl BatchStats {
    pub fn new(num_classes: usize, num_outputs: usize) -> Self {
        Self {
            gradients: GradientAccumulator::new(num_classes, num_outputs),
            confusion: ConfusionMatrix::new(num_classes),
            loss_sum: 0.0,
            processed: 0,
        }
    }

    pub fn correct(&self) -> u64 {
        self.confusion.correct()
    }

    /// Score one activation vector against `weights` and record loss,
    /// prediction and, when `step` is given, the weight deltas.
    ///
    /// `scratch` is reused between calls to avoid per-observation allocation.
    pub fn observe(
        &mut self,
        weights: &WeightMatrix,
        activation: &[f64],
        label: usize,
        step: Option<StepParams>,
        scratch: &mut Vec<f64>,
    ) -> usize {
        weights.scores_into(activation, scratch);
        let predicted = argmax(scratch);
        softmax_in_place(scratch);

        self.loss_sum += cross_entropy(scratch[label]);
        self.processed += 1;
        self.confusion.record(label, predicted);

        if let Some(StepParams { learning_rate, l2 }) = step {
            for (class, &p) in scratch.iter().enumerate() {
                let target = if class == label { 1.0 } else { 0.0 };
                let err = p - target;
                for (col, &a) in activation.iter().enumerate() {
                    let grad = err * a + l2 * weights.get(class, col);
                    self.gradients.add(class, col, -learning_rate * grad);
                }
            }
        }
        predicted
    }
}

impl Aggregate for BatchStats {
    fn merge(&mut self, other: &Self) {
        self.gradients.merge(&other.gradients);
        self.confusion.merge(&other.confusion);
        self.loss_sum += other.loss_sum;
        self.processed += other.processed;
    }

    fn reset(&mut self) {
        self.gradients.reset();
        self.confusion.reset();
        self.loss_sum = 0.0;
        self.processed = 0;
    }
}
