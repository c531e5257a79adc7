//! Reservoir grading: how well a topology separates inputs before any
//! readout is trained.
//!
//! Responses are collected over the same barrier and claim counter the
//! trainer uses; the pairwise angle math runs on rayon when the `parallel`
//! feature is enabled.

use std::thread;

#[cfg(feature = "parallel")]
use rayon::prelude::*;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::barrier::{Aggregate, BatchBarrier};
use crate::dataset::FeatureRanges;
use crate::encoder::{EncoderBank, Stimulus};
use crate::error::{ConfigError, Result, TrainError};
use crate::readout::activation_into;
use crate::simulator::{bind_once, Simulator};

#[derive(Debug, Clone, PartialEq)]
pub struct GradeOptions {
    pub threads: usize,
    pub sim_steps: u32,
    /// Read every neuron's count instead of only the output channels.
    pub all_neurons: bool,
}

impl Default for GradeOptions {
    fn default() -> Self {
        Self {
            threads: 4,
            sim_steps: 200,
            all_neurons: false,
        }
    }
}

/// Responses tagged with the index of the input that produced them.
#[derive(Debug, Default, Clone)]
struct Responses {
    rows: Vec<(usize, Vec<u32>)>,
}

impl Aggregate for Responses {
    fn merge(&mut self, other: &Self) {
        self.rows.extend(other.rows.iter().cloned());
    }

    fn reset(&mut self) {
        self.rows.clear();
    }
}

/// Run every input row through its own cleared simulator and return the
/// firing counts in input order.
pub fn collect_responses<S: Simulator>(
    topology: &S::Topology,
    bank: &EncoderBank,
    inputs: &[Vec<f64>],
    options: &GradeOptions,
) -> Result<Vec<Vec<u32>>> {
    if options.threads == 0 {
        return Err(ConfigError::trainer("threads", "must be >= 1").into());
    }
    if let Some(row) = inputs.iter().find(|r| r.len() != bank.len()) {
        return Err(ConfigError::RangeCountMismatch {
            features: row.len(),
            ranges: bank.len(),
        }
        .into());
    }
    let probe = S::bind(topology)?;
    bank.check_inputs(probe.num_inputs())?;
    drop(probe);

    let barrier: BatchBarrier<(), Responses> = BatchBarrier::new(options.threads, Responses::default());
    let collected = thread::scope(|s| {
        let mut handles = Vec::with_capacity(options.threads);
        let mut spawned = Ok(());
        for w in 0..options.threads {
            let barrier = &barrier;
            let spawn = thread::Builder::new()
                .name(format!("grade-worker-{w}"))
                .spawn_scoped(s, move || respond_worker::<S>(barrier, topology, bank, inputs, options));
            match spawn {
                Ok(h) => handles.push(h),
                Err(e) => {
                    spawned = Err(TrainError::Spawn(e));
                    break;
                }
            }
        }
        let collected = spawned.and_then(|()| {
            barrier
                .run_batch((), inputs.len(), |agg| std::mem::take(&mut agg.rows))
                .map_err(TrainError::from)
        });
        barrier.shutdown();
        for h in handles {
            if h.join().is_err() {
                warn!("grade worker panicked");
            }
        }
        collected
    })?;

    let mut out = vec![Vec::new(); inputs.len()];
    for (i, counts) in collected {
        out[i] = counts;
    }
    debug!(responses = out.len(), "responses collected");
    Ok(out)
}

fn respond_worker<S: Simulator>(
    barrier: &BatchBarrier<(), Responses>,
    topology: &S::Topology,
    bank: &EncoderBank,
    inputs: &[Vec<f64>],
    options: &GradeOptions,
) {
    let mut slot = barrier.worker();
    let mut sim: Option<S> = None;
    let mut stimuli: Vec<Stimulus> = Vec::new();
    let mut local = Responses::default();

    while slot.next_batch().is_some() {
        while let Some(i) = slot.claim() {
            let sim = match bind_once(&mut sim, topology) {
                Ok(s) => s,
                Err(e) => {
                    slot.fail(e.to_string());
                    continue;
                }
            };

            sim.clear_activity();
            bank.encode_into(&inputs[i], &mut stimuli);
            if let Err(e) = sim.inject_many(&stimuli) {
                slot.fail(e.to_string());
                continue;
            }
            sim.advance(options.sim_steps);
            let counts = if options.all_neurons {
                sim.read_all_firing_counts()
            } else {
                sim.read_output_counts()
            };
            local.reset();
            local.rows.push((i, counts));
            slot.complete(&local);
        }
    }
}

/// Mean angle in degrees between responses of each pair of classes.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SeparationMatrix {
    num_classes: usize,
    totals: Vec<f64>,
    counts: Vec<u64>,
    /// Observations whose response was all zero; they never lead a pair.
    pub silent: usize,
    pub observations: usize,
}

impl SeparationMatrix {
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// `None` when no pair contributed to the cell.
    pub fn mean(&self, a: usize, b: usize) -> Option<f64> {
        let i = a * self.num_classes + b;
        (self.counts[i] > 0).then(|| self.totals[i] / self.counts[i] as f64)
    }

    pub fn pairs(&self, a: usize, b: usize) -> u64 {
        self.counts[a * self.num_classes + b]
    }

    /// Largest mean angle within a class.
    pub fn max_intraclass(&self) -> Option<f64> {
        (0..self.num_classes)
            .filter_map(|c| self.mean(c, c))
            .fold(None, |acc: Option<f64>, m| Some(acc.map_or(m, |a| a.max(m))))
    }

    /// Smallest gap between a class's intraclass mean and its mean against
    /// any other class. `None` when either side has no pairs.
    pub fn smallest_delta(&self, class: usize) -> Option<f64> {
        let own = self.mean(class, class)?;
        (0..self.num_classes)
            .filter(|&other| other != class)
            .filter_map(|other| self.mean(class, other))
            .map(|m| (own - m).abs())
            .fold(None, |acc: Option<f64>, d| Some(acc.map_or(d, |a| a.min(d))))
    }
}

impl std::fmt::Display for SeparationMatrix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for a in 0..self.num_classes {
            for b in 0..self.num_classes {
                match self.mean(a, b) {
                    Some(m) => write!(f, "{m:10.3} ")?,
                    None => write!(f, "{:>10} ", "-")?,
                }
            }
            writeln!(f)?;
        }
        writeln!(f)?;
        writeln!(f, "Silent responses: {}/{}", self.silent, self.observations)?;
        writeln!(f)?;
        match self.max_intraclass() {
            Some(m) => writeln!(f, "Maximum intraclass distance: {m:.6}")?,
            None => writeln!(f, "Maximum intraclass distance: -")?,
        }
        for c in 0..self.num_classes {
            writeln!(f)?;
            match self.smallest_delta(c) {
                Some(d) => write!(f, "Class {:2} smallest delta {d:.6}", c + 1)?,
                None => write!(f, "Class {:2} smallest delta -", c + 1)?,
            }
        }
        Ok(())
    }
}

/// Angle in degrees between two count vectors. Identical vectors give 0, a
/// zero vector against a non-zero one gives 180.
pub fn count_angle_degrees(a: &[u32], b: &[u32]) -> f64 {
    if a == b {
        return 0.0;
    }
    let mut dot = 0.0;
    let mut norm_a = 0.0;
    let mut norm_b = 0.0;
    for (&x, &y) in a.iter().zip(b) {
        let (x, y) = (x as f64, y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 180.0;
    }
    let cos = (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0);
    // Scaled copies land a few ulps under 1, which acos blows up to ~1e-6 degrees.
    if cos >= 1.0 - 4.0 * f64::EPSILON {
        return 0.0;
    }
    cos.acos().to_degrees()
}

fn separation_row(
    i: usize,
    responses: &[Vec<u32>],
    labels: &[usize],
    num_classes: usize,
) -> Option<(usize, Vec<(f64, u64)>)> {
    let a = &responses[i];
    if a.iter().all(|&c| c == 0) {
        return None;
    }
    let mut row = vec![(0.0, 0u64); num_classes];
    for (j, b) in responses.iter().enumerate() {
        if i == j {
            continue;
        }
        let cell = &mut row[labels[j]];
        cell.0 += count_angle_degrees(a, b);
        cell.1 += 1;
    }
    Some((labels[i], row))
}

/// Average pairwise response angle per `(label_a, label_b)` cell over every
/// ordered pair of distinct observations.
pub fn class_separation(responses: &[Vec<u32>], labels: &[usize], num_classes: usize) -> SeparationMatrix {
    debug_assert_eq!(responses.len(), labels.len());
    let n = responses.len().min(labels.len());

    #[cfg(feature = "parallel")]
    let rows: Vec<_> = (0..n)
        .into_par_iter()
        .map(|i| separation_row(i, responses, labels, num_classes))
        .collect();
    #[cfg(not(feature = "parallel"))]
    let rows: Vec<_> = (0..n)
        .map(|i| separation_row(i, responses, labels, num_classes))
        .collect();

    let mut totals = vec![0.0; num_classes * num_classes];
    let mut counts = vec![0; num_classes * num_classes];
    let mut silent = 0;
    for row in rows {
        let Some((label, cells)) = row else {
            silent += 1;
            continue;
        };
        for (b, (total, count)) in cells.into_iter().enumerate() {
            totals[label * num_classes + b] += total;
            counts[label * num_classes + b] += count;
        }
    }
    SeparationMatrix {
        num_classes,
        totals,
        counts,
        silent,
        observations: n,
    }
}

/// Regular grid over each feature's range: `tests_per_feature[i]` points
/// starting at `min[i]`, spaced `(max - min) / tests`. The last feature
/// varies fastest.
pub fn grid_inputs(ranges: &FeatureRanges, tests_per_feature: &[usize]) -> std::result::Result<Vec<Vec<f64>>, ConfigError> {
    if ranges.min.len() != ranges.max.len() || ranges.min.len() != tests_per_feature.len() {
        return Err(ConfigError::RangeCountMismatch {
            features: tests_per_feature.len(),
            ranges: ranges.min.len(),
        });
    }
    if tests_per_feature.iter().any(|&t| t == 0) {
        return Err(ConfigError::ZeroWidth {
            what: "tests_per_feature",
        });
    }

    let steps: Vec<f64> = ranges
        .min
        .iter()
        .zip(&ranges.max)
        .zip(tests_per_feature)
        .map(|((lo, hi), &t)| (hi - lo) / t as f64)
        .collect();
    let mut counters = vec![0usize; tests_per_feature.len()];
    let mut points = Vec::with_capacity(tests_per_feature.iter().product());
    loop {
        points.push(
            counters
                .iter()
                .enumerate()
                .map(|(i, &c)| ranges.min[i] + steps[i] * c as f64)
                .collect(),
        );
        // Odometer increment, last digit first.
        let mut idx = counters.len();
        loop {
            if idx == 0 {
                return Ok(points);
            }
            idx -= 1;
            counters[idx] += 1;
            if counters[idx] < tests_per_feature[idx] {
                break;
            }
            counters[idx] = 0;
        }
    }
}

/// Smallest angle in radians between any two activation vectors.
pub fn min_angle(vectors: &[Vec<f64>]) -> Option<f64> {
    let angle = |a: &[f64], b: &[f64]| {
        let (mut dot, mut na, mut nb) = (0.0, 0.0, 0.0);
        for (x, y) in a.iter().zip(b) {
            dot += x * y;
            na += x * x;
            nb += y * y;
        }
        let cos = dot / (na.sqrt() * nb.sqrt());
        if cos.is_finite() {
            cos.clamp(-1.0, 1.0).acos()
        } else {
            f64::NAN
        }
    };
    let row_min = |i: usize| {
        vectors[i + 1..]
            .iter()
            .map(|b| angle(&vectors[i], b))
            .filter(|a| !a.is_nan())
            .fold(f64::INFINITY, f64::min)
    };

    let n = vectors.len();
    #[cfg(feature = "parallel")]
    let min = (0..n).into_par_iter().map(row_min).reduce(|| f64::INFINITY, f64::min);
    #[cfg(not(feature = "parallel"))]
    let min = (0..n).map(row_min).fold(f64::INFINITY, f64::min);

    min.is_finite().then_some(min)
}

/// Sweep a grid across the feature ranges, turn each point into a readout
/// activation vector and return the smallest pairwise angle in radians.
///
/// Larger is better: it bounds how close two distinct inputs can look to
/// the readout.
pub fn min_pairwise_angle<S: Simulator>(
    topology: &S::Topology,
    bank: &EncoderBank,
    ranges: &FeatureRanges,
    tests_per_feature: &[usize],
    activation_scale: f64,
    options: &GradeOptions,
) -> Result<Option<f64>> {
    let grid = grid_inputs(ranges, tests_per_feature)?;
    let responses = collect_responses::<S>(topology, bank, &grid, options)?;
    let activations: Vec<Vec<f64>> = responses
        .iter()
        .map(|counts| {
            let mut a = Vec::with_capacity(counts.len() + 1);
            activation_into(counts, activation_scale, &mut a);
            a
        })
        .collect();
    let min = min_angle(&activations);
    info!(points = grid.len(), min_angle = min, "grid sweep graded");
    Ok(min)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::EncoderKind;
    use crate::simulator::{ReservoirTopology, SpikingReservoir};

    #[test]
    fn angle_edge_cases() {
        assert_eq!(count_angle_degrees(&[3, 4], &[3, 4]), 0.0);
        assert_eq!(count_angle_degrees(&[0, 0], &[0, 0]), 0.0);
        assert_eq!(count_angle_degrees(&[1, 0], &[0, 0]), 180.0);
        assert!((count_angle_degrees(&[1, 0], &[0, 1]) - 90.0).abs() < 1e-9);
        assert_eq!(count_angle_degrees(&[2, 2], &[1, 1]), 0.0);
        assert_eq!(count_angle_degrees(&[3, 6], &[1, 2]), 0.0);
        assert_eq!(count_angle_degrees(&[7, 0, 21], &[1, 0, 3]), 0.0);
        assert!(count_angle_degrees(&[100, 1], &[100, 0]) > 0.5);
    }

    #[test]
    fn scaled_copies_separate_by_zero() {
        let responses = vec![vec![1, 2], vec![3, 6], vec![5, 0]];
        let m = class_separation(&responses, &[0, 0, 1], 2);
        assert_eq!(m.mean(0, 0), Some(0.0));
    }

    #[test]
    fn summary_reports_intraclass_and_deltas() {
        let responses = vec![vec![1, 0], vec![2, 0], vec![0, 1], vec![0, 0]];
        let m = class_separation(&responses, &[0, 0, 1, 1], 2);

        // Diagonal means are 0 for class 0 and 180 for class 1.
        assert_eq!(m.max_intraclass(), Some(180.0));
        assert!((m.smallest_delta(0).unwrap() - 135.0).abs() < 1e-9);
        assert!((m.smallest_delta(1).unwrap() - 90.0).abs() < 1e-9);

        let text = m.to_string();
        assert!(text.contains("Maximum intraclass distance: 180.000000"));
        assert!(text.contains("Class  1 smallest delta 135.000000"));
        assert!(text.contains("Class  2 smallest delta 90.000000"));
    }

    #[test]
    fn summary_without_pairs_is_undefined() {
        let m = class_separation(&[vec![1, 0]], &[0], 2);
        assert_eq!(m.max_intraclass(), None);
        assert_eq!(m.smallest_delta(0), None);
        assert!(m.to_string().contains("Maximum intraclass distance: -"));
    }

    #[test]
    fn separation_averages_per_class_pair() {
        let responses = vec![vec![1, 0], vec![2, 0], vec![0, 1], vec![0, 0]];
        let labels = vec![0, 0, 1, 1];
        let m = class_separation(&responses, &labels, 2);

        assert_eq!(m.silent, 1);
        assert_eq!(m.observations, 4);
        // Row 0 leads: (0,1) and (1,0) are parallel.
        assert_eq!(m.pairs(0, 0), 2);
        assert!(m.mean(0, 0).unwrap().abs() < 1e-6);
        // Against class 1: 90 degrees to [0,1], 180 to the silent vector.
        assert_eq!(m.pairs(0, 1), 4);
        assert!((m.mean(0, 1).unwrap() - 135.0).abs() < 1e-9);
        // Only [0,1] leads class 1 rows.
        assert_eq!(m.pairs(1, 1), 1);
        assert_eq!(m.mean(1, 1), Some(180.0));
        assert!((m.mean(1, 0).unwrap() - 90.0).abs() < 1e-9);
    }

    #[test]
    fn empty_cells_have_no_mean() {
        let m = class_separation(&[vec![1]], &[0], 3);
        assert_eq!(m.mean(2, 2), None);
        assert_eq!(m.pairs(0, 0), 0);
    }

    #[test]
    fn grid_walks_every_combination() {
        let ranges = FeatureRanges {
            min: vec![0.0, 10.0],
            max: vec![1.0, 20.0],
        };
        let grid = grid_inputs(&ranges, &[2, 3]).unwrap();
        assert_eq!(grid.len(), 6);
        assert_eq!(grid[0], vec![0.0, 10.0]);
        assert_eq!(grid[1][0], 0.0);
        assert!((grid[1][1] - 10.0 - 10.0 / 3.0).abs() < 1e-12);
        assert_eq!(grid[3][0], 0.5);
        assert_eq!(grid[3][1], 10.0);

        assert!(matches!(
            grid_inputs(&ranges, &[2, 0]),
            Err(ConfigError::ZeroWidth { .. })
        ));
        assert!(matches!(
            grid_inputs(&ranges, &[2]),
            Err(ConfigError::RangeCountMismatch { .. })
        ));
    }

    #[test]
    fn min_angle_of_orthogonal_and_parallel_sets() {
        let v = vec![vec![1.0, 0.0], vec![0.0, 1.0]];
        assert!((min_angle(&v).unwrap() - std::f64::consts::FRAC_PI_2).abs() < 1e-12);
        let v = vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![2.0, 0.0]];
        assert!(min_angle(&v).unwrap().abs() < 1e-7);
        assert_eq!(min_angle(&[vec![1.0]]), None);
    }

    #[test]
    fn responses_come_back_in_input_order() {
        let topo = ReservoirTopology::passthrough(2);
        let bank = EncoderBank::from_ranges(EncoderKind::Balanced { timesteps: 10 }, &[0.0], &[1.0]).unwrap();
        let inputs: Vec<Vec<f64>> = (0..=10).map(|i| vec![i as f64 / 10.0]).collect();
        let options = GradeOptions {
            threads: 3,
            sim_steps: 20,
            all_neurons: false,
        };
        let out = collect_responses::<SpikingReservoir>(&topo, &bank, &inputs, &options).unwrap();
        assert_eq!(out.len(), 11);
        assert_eq!(out[0], vec![0, 10]);
        assert_eq!(out[10], vec![10, 0]);
        for counts in &out {
            assert!(counts.iter().sum::<u32>() <= 10);
        }

        let bad = vec![vec![0.1, 0.2]];
        assert!(collect_responses::<SpikingReservoir>(&topo, &bank, &bad, &options).is_err());
    }

    #[test]
    fn grid_sweep_reports_a_positive_angle() {
        let topo = ReservoirTopology::passthrough(2);
        let bank = EncoderBank::from_ranges(EncoderKind::Balanced { timesteps: 10 }, &[0.0], &[1.0]).unwrap();
        let ranges = FeatureRanges {
            min: vec![0.0],
            max: vec![1.0],
        };
        let options = GradeOptions {
            threads: 2,
            sim_steps: 20,
            all_neurons: true,
        };
        let min = min_pairwise_angle::<SpikingReservoir>(&topo, &bank, &ranges, &[5], 10.0, &options)
            .unwrap()
            .unwrap();
        assert!(min > 0.0 && min < std::f64::consts::FRAC_PI_2);
    }
}
