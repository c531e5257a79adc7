//! Linear softmax readout over reservoir output counts.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::prng::Prng;

/// `num_classes x (num_outputs + 1)` weights, row-major. Column 0 multiplies
/// the constant bias input.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct WeightMatrix {
    num_classes: usize,
    cols: usize,
    values: Vec<f64>,
}

impl WeightMatrix {
    pub fn zeros(num_classes: usize, num_outputs: usize) -> Self {
        let cols = num_outputs + 1;
        Self {
            num_classes,
            cols,
            values: vec![0.0; num_classes * cols],
        }
    }

    /// Weights drawn from `N(0, std_dev)`.
    pub fn random_normal(num_classes: usize, num_outputs: usize, std_dev: f64, rng: &mut Prng) -> Self {
        let mut w = Self::zeros(num_classes, num_outputs);
        for v in &mut w.values {
            *v = rng.normal(0.0, std_dev);
        }
        w
    }

    pub(crate) fn from_parts(num_classes: usize, cols: usize, values: Vec<f64>) -> Option<Self> {
        (cols > 0 && values.len() == num_classes * cols).then_some(Self {
            num_classes,
            cols,
            values,
        })
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn num_outputs(&self) -> usize {
        self.cols - 1
    }

    /// Row width including the bias column.
    pub fn cols(&self) -> usize {
        self.cols
    }

    #[inline]
    pub fn get(&self, class: usize, col: usize) -> f64 {
        self.values[class * self.cols + col]
    }

    #[inline]
    pub fn get_mut(&mut self, class: usize, col: usize) -> &mut f64 {
        &mut self.values[class * self.cols + col]
    }

    pub fn row(&self, class: usize) -> &[f64] {
        &self.values[class * self.cols..(class + 1) * self.cols]
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.values
    }

    /// `y = W . a` into `out`.
    pub fn scores_into(&self, activation: &[f64], out: &mut Vec<f64>) {
        debug_assert_eq!(activation.len(), self.cols);
        out.clear();
        out.extend((0..self.num_classes).map(|c| {
            self.row(c)
                .iter()
                .zip(activation)
                .map(|(w, a)| w * a)
                .sum::<f64>()
        }));
    }

    /// Symmetric clamp of every weight to `[-limit, limit]`.
    pub fn clamp(&mut self, limit: f64) {
        for v in &mut self.values {
            *v = v.clamp(-limit, limit);
        }
    }
}

/// `[1, c_0 / scale, c_1 / scale, ...]` into `out`.
pub fn activation_into(counts: &[u32], scale: f64, out: &mut Vec<f64>) {
    out.clear();
    out.push(1.0);
    out.extend(counts.iter().map(|&c| c as f64 / scale));
}

/// In-place softmax with the max subtracted first, so large scores cannot
/// overflow `exp`.
pub fn softmax_in_place(scores: &mut [f64]) {
    let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() || scores.iter().any(|s| s.is_nan()) {
        // Nothing meaningful to normalize: fall back to uniform.
        let n = scores.len().max(1) as f64;
        scores.iter_mut().for_each(|s| *s = 1.0 / n);
        return;
    }
    let mut sum = 0.0;
    for s in scores.iter_mut() {
        *s = (*s - max).exp();
        sum += *s;
    }
    for s in scores.iter_mut() {
        *s /= sum;
    }
}

/// Index of the largest value; the first one wins ties.
pub fn argmax(values: &[f64]) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate().skip(1) {
        if v > values[best] {
            best = i;
        }
    }
    best
}

/// `-ln p`, with `p` floored so a zero probability gives a large finite loss.
pub fn cross_entropy(prob_of_target: f64) -> f64 {
    -prob_of_target.max(f64::MIN_POSITIVE).ln()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn softmax_survives_huge_scores() {
        let mut y = vec![1000.0, 1001.0, 999.0];
        softmax_in_place(&mut y);
        assert!(y.iter().all(|p| p.is_finite()));
        assert!((y.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert_eq!(argmax(&y), 1);
    }

    #[test]
    fn softmax_of_equal_scores_is_uniform() {
        let mut y = vec![3.0; 4];
        softmax_in_place(&mut y);
        for p in y {
            assert!((p - 0.25).abs() < 1e-12);
        }
    }

    #[test]
    fn argmax_prefers_first_on_ties() {
        assert_eq!(argmax(&[0.2, 0.5, 0.5]), 1);
        assert_eq!(argmax(&[-3.0, -4.0]), 0);
    }

    #[test]
    fn cross_entropy_is_finite_at_zero() {
        assert!(cross_entropy(0.0).is_finite());
        assert!(cross_entropy(1.0).abs() < 1e-15);
    }

    #[test]
    fn scores_include_bias_column() {
        let mut w = WeightMatrix::zeros(2, 2);
        *w.get_mut(0, 0) = 0.5;
        *w.get_mut(1, 1) = 2.0;
        *w.get_mut(1, 2) = -1.0;

        let mut a = Vec::new();
        activation_into(&[30, 10], 10.0, &mut a);
        assert_eq!(a, vec![1.0, 3.0, 1.0]);

        let mut y = Vec::new();
        w.scores_into(&a, &mut y);
        assert_eq!(y, vec![0.5, 5.0]);
    }

    #[test]
    fn clamp_is_symmetric() {
        let mut w = WeightMatrix::zeros(1, 2);
        *w.get_mut(0, 0) = 7.0;
        *w.get_mut(0, 1) = -9.0;
        w.clamp(2.0);
        assert_eq!(w.row(0), &[2.0, -2.0, 0.0]);
    }
}
