//! Mini-batch training of the softmax readout over a worker pool.
//!
//! The calling thread is the dispatcher: it shuffles, publishes one batch at
//! a time through a [`BatchBarrier`], applies the merged update and reports.
//! Each worker owns one simulator handle, bound lazily on its first claimed
//! item and reused until the pool shuts down.

use std::thread;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::barrier::{Aggregate, BatchBarrier};
use crate::dataset::{Dataset, LabelBase, Observation};
use crate::encoder::{EncoderBank, Stimulus};
use crate::error::{ConfigError, Result, SimError, TrainError};
use crate::gradient::{BatchStats, StepParams};
use crate::observer::{EvalReport, TrainingReport, WindowMetrics, WindowReport};
use crate::prng::{clock_seed, Prng};
use crate::readout::{activation_into, WeightMatrix};
use crate::simulator::{bind_once, Simulator};

/// When metrics are reported and the confusion matrix reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ReportWindow {
    #[default]
    Epoch,
    Batch,
}

/// Hyperparameters and numeric policy for one training run.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TrainerConfig {
    pub learning_rate: f64,
    /// L2 penalty coefficient.
    pub l2: f64,
    pub threads: usize,
    pub epochs: usize,
    /// Items per batch. A trailing partial batch is dropped each epoch.
    pub batch_size: usize,
    /// Simulator steps per observation.
    pub sim_steps: u32,
    /// Output counts are divided by this before scoring.
    pub activation_scale: f64,
    pub num_classes: usize,
    /// Probability that an observation lands in the training subset.
    pub train_fraction: f64,
    /// Standard deviation of the initial weights.
    pub init_std: f64,
    /// Symmetric bound applied after every update.
    pub weight_clamp: Option<f64>,
    pub label_base: LabelBase,
    pub report_window: ReportWindow,
    /// `None` picks a seed from the clock; the report records it.
    pub seed: Option<u64>,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.1,
            l2: 0.0,
            threads: 4,
            epochs: 10,
            batch_size: 10,
            sim_steps: 200,
            activation_scale: 100.0,
            num_classes: 2,
            train_fraction: 0.75,
            init_std: 1.0,
            weight_clamp: None,
            label_base: LabelBase::Zero,
            report_window: ReportWindow::Epoch,
            seed: None,
        }
    }
}

impl TrainerConfig {
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(ConfigError::trainer("learning_rate", "must be finite and > 0"));
        }
        if !self.l2.is_finite() || self.l2 < 0.0 {
            return Err(ConfigError::trainer("l2", "must be finite and >= 0"));
        }
        if self.threads == 0 {
            return Err(ConfigError::trainer("threads", "must be >= 1"));
        }
        if self.epochs == 0 {
            return Err(ConfigError::trainer("epochs", "must be >= 1"));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::trainer("batch_size", "must be >= 1"));
        }
        if !self.activation_scale.is_finite() || self.activation_scale <= 0.0 {
            return Err(ConfigError::trainer("activation_scale", "must be finite and > 0"));
        }
        if self.num_classes < 2 {
            return Err(ConfigError::trainer("num_classes", "must be >= 2"));
        }
        if !(self.train_fraction > 0.0 && self.train_fraction <= 1.0) {
            return Err(ConfigError::trainer("train_fraction", "must be in (0, 1]"));
        }
        if !self.init_std.is_finite() || self.init_std < 0.0 {
            return Err(ConfigError::trainer("init_std", "must be finite and >= 0"));
        }
        if let Some(c) = self.weight_clamp {
            if !c.is_finite() || c <= 0.0 {
                return Err(ConfigError::trainer("weight_clamp", "must be finite and > 0"));
            }
        }
        Ok(())
    }

    pub fn with_learning_rate(mut self, rate: f64) -> Self {
        self.learning_rate = rate;
        self
    }

    pub fn with_l2(mut self, l2: f64) -> Self {
        self.l2 = l2;
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_sim_steps(mut self, steps: u32) -> Self {
        self.sim_steps = steps;
        self
    }

    pub fn with_activation_scale(mut self, scale: f64) -> Self {
        self.activation_scale = scale;
        self
    }

    pub fn with_num_classes(mut self, n: usize) -> Self {
        self.num_classes = n;
        self
    }

    pub fn with_train_fraction(mut self, fraction: f64) -> Self {
        self.train_fraction = fraction;
        self
    }

    pub fn with_init_std(mut self, std_dev: f64) -> Self {
        self.init_std = std_dev;
        self
    }

    pub fn with_weight_clamp(mut self, limit: f64) -> Self {
        self.weight_clamp = Some(limit);
        self
    }

    pub fn with_label_base(mut self, base: LabelBase) -> Self {
        self.label_base = base;
        self
    }

    pub fn with_report_window(mut self, window: ReportWindow) -> Self {
        self.report_window = window;
        self
    }

    /// Set the random seed for reproducibility.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    /// Indices refer to the training subset; gradients are accumulated.
    Train,
    /// Indices refer to the held-out subset; forward pass only.
    Evaluate,
}

/// Payload of one dispatched batch.
#[derive(Debug, Clone)]
pub struct BatchJob {
    pub kind: JobKind,
    pub indices: Vec<usize>,
    /// Snapshot taken at dispatch; workers never see a half-applied update.
    pub weights: WeightMatrix,
    pub step: Option<StepParams>,
}

/// Reusable per-worker buffers.
#[derive(Debug, Default)]
pub struct ObservationScratch {
    stimuli: Vec<Stimulus>,
    activation: Vec<f64>,
    scores: Vec<f64>,
}

/// Run one observation through `sim` and fold its contribution into `stats`.
///
/// Returns the predicted class.
#[allow(clippy::too_many_arguments)]
pub fn process_observation<S: Simulator>(
    sim: &mut S,
    bank: &EncoderBank,
    obs: &Observation,
    weights: &WeightMatrix,
    step: Option<StepParams>,
    sim_steps: u32,
    activation_scale: f64,
    scratch: &mut ObservationScratch,
    stats: &mut BatchStats,
) -> std::result::Result<usize, SimError> {
    sim.clear_activity();
    bank.encode_into(&obs.features, &mut scratch.stimuli);
    sim.inject_many(&scratch.stimuli)?;
    sim.advance(sim_steps);
    let counts = sim.read_output_counts();
    activation_into(&counts, activation_scale, &mut scratch.activation);
    Ok(stats.observe(weights, &scratch.activation, obs.label, step, &mut scratch.scores))
}

/// What every worker reads; shared by reference for the pool's lifetime.
struct WorkerContext<'a, T: ?Sized> {
    topology: &'a T,
    bank: &'a EncoderBank,
    train: &'a [Observation],
    test: &'a [Observation],
    num_classes: usize,
    num_outputs: usize,
    sim_steps: u32,
    activation_scale: f64,
}

fn run_worker<S: Simulator>(
    barrier: &BatchBarrier<BatchJob, BatchStats>,
    ctx: &WorkerContext<'_, S::Topology>,
) {
    let mut slot = barrier.worker();
    let mut sim: Option<S> = None;
    let mut scratch = ObservationScratch::default();
    let mut local = BatchStats::new(ctx.num_classes, ctx.num_outputs);

    while let Some(job) = slot.next_batch() {
        let source = match job.kind {
            JobKind::Train => ctx.train,
            JobKind::Evaluate => ctx.test,
        };
        while let Some(i) = slot.claim() {
            let fresh = sim.is_none();
            let sim = match bind_once(&mut sim, ctx.topology) {
                Ok(s) => s,
                Err(e) => {
                    slot.fail(e.to_string());
                    continue;
                }
            };
            if fresh {
                trace!("worker bound simulator");
            }

            let obs = &source[job.indices[i]];
            local.reset();
            let outcome = process_observation(
                sim,
                ctx.bank,
                obs,
                &job.weights,
                job.step,
                ctx.sim_steps,
                ctx.activation_scale,
                &mut scratch,
                &mut local,
            );
            match outcome {
                Ok(_) => slot.complete(&local),
                Err(e) => slot.fail(e.to_string()),
            }
        }
    }
}

/// Shuts the barrier down on every exit path, so the scope join cannot wait
/// on parked workers.
struct ShutdownOnDrop<'a>(&'a BatchBarrier<BatchJob, BatchStats>);

impl Drop for ShutdownOnDrop<'_> {
    fn drop(&mut self) {
        self.0.shutdown();
    }
}

struct RunOutcome {
    windows: Vec<WindowReport>,
    final_train_accuracy: f64,
    test: Option<EvalReport>,
    rejected_updates: usize,
    weights: WeightMatrix,
}

/// Train a readout for simulators of type `S` bound to `topology`.
///
/// All configuration errors are raised before any worker thread starts.
pub fn train<S: Simulator>(
    topology: &S::Topology,
    dataset: Dataset,
    bank: &EncoderBank,
    config: &TrainerConfig,
) -> Result<TrainingReport> {
    config.validate()?;
    if dataset.num_features() != bank.len() {
        return Err(ConfigError::RangeCountMismatch {
            features: dataset.num_features(),
            ranges: bank.len(),
        }
        .into());
    }
    dataset.check_shape(bank.len(), config.num_classes)?;

    let probe = S::bind(topology)?;
    bank.check_inputs(probe.num_inputs())?;
    let num_outputs = probe.num_outputs();
    drop(probe);

    let seed = config.seed.unwrap_or_else(clock_seed);
    let mut rng = Prng::new(seed);
    let (train_set, test_set) = dataset.split(config.train_fraction, &mut rng);
    if train_set.len() < config.batch_size {
        return Err(ConfigError::trainer("batch_size", "exceeds the training subset").into());
    }
    if test_set.is_empty() {
        warn!("held-out subset is empty; skipping evaluation");
    }

    let weights = WeightMatrix::random_normal(config.num_classes, num_outputs, config.init_std, &mut rng);
    info!(
        seed,
        train = train_set.len(),
        test = test_set.len(),
        threads = config.threads,
        outputs = num_outputs,
        "training started"
    );

    let barrier = BatchBarrier::new(config.threads, BatchStats::new(config.num_classes, num_outputs));
    let ctx = WorkerContext {
        topology,
        bank,
        train: train_set.observations(),
        test: test_set.observations(),
        num_classes: config.num_classes,
        num_outputs,
        sim_steps: config.sim_steps,
        activation_scale: config.activation_scale,
    };

    let outcome = thread::scope(|s| {
        let guard = ShutdownOnDrop(&barrier);
        let mut handles = Vec::with_capacity(config.threads);
        let mut spawned = Ok(());
        for w in 0..config.threads {
            let (barrier, ctx) = (&barrier, &ctx);
            let spawn = thread::Builder::new()
                .name(format!("readout-worker-{w}"))
                .spawn_scoped(s, move || run_worker::<S>(barrier, ctx));
            match spawn {
                Ok(h) => handles.push(h),
                Err(e) => {
                    spawned = Err(TrainError::Spawn(e));
                    break;
                }
            }
        }

        let outcome = spawned.and_then(|()| {
            drive(&barrier, weights, train_set.len(), test_set.len(), config, &mut rng)
        });

        drop(guard);
        for h in handles {
            if h.join().is_err() {
                warn!("worker thread panicked");
            }
        }
        outcome
    })?;

    info!(
        train_accuracy = outcome.final_train_accuracy,
        test_accuracy = outcome.test.as_ref().map(|t| t.accuracy),
        rejected = outcome.rejected_updates,
        "training finished"
    );

    Ok(TrainingReport {
        config: config.clone(),
        seed,
        train_size: train_set.len(),
        test_size: test_set.len(),
        windows: outcome.windows,
        final_train_accuracy: outcome.final_train_accuracy,
        test: outcome.test,
        rejected_updates: outcome.rejected_updates,
        weights: outcome.weights,
    })
}

/// The dispatcher side: epochs, batches, updates and reports.
fn drive(
    barrier: &BatchBarrier<BatchJob, BatchStats>,
    mut weights: WeightMatrix,
    train_len: usize,
    test_len: usize,
    config: &TrainerConfig,
    rng: &mut Prng,
) -> Result<RunOutcome> {
    let step = StepParams {
        learning_rate: config.learning_rate,
        l2: config.l2,
    };
    let mut order: Vec<usize> = (0..train_len).collect();
    let mut epoch_metrics = WindowMetrics::new(config.num_classes);
    let mut batch_metrics = WindowMetrics::new(config.num_classes);
    let mut windows = Vec::new();
    let mut final_train_accuracy = 0.0;
    let mut rejected_updates = 0;

    for epoch in 0..config.epochs {
        rng.shuffle(&mut order);
        for (b, chunk) in order.chunks_exact(config.batch_size).enumerate() {
            let job = BatchJob {
                kind: JobKind::Train,
                indices: chunk.to_vec(),
                weights: weights.clone(),
                step: Some(step),
            };
            let rejected = barrier.run_batch(job, chunk.len(), |stats| {
                epoch_metrics.absorb(stats);
                batch_metrics.absorb(stats);
                stats.gradients.apply_to(&mut weights)
            })?;
            if let Some(limit) = config.weight_clamp {
                weights.clamp(limit);
            }
            if rejected > 0 {
                debug!(epoch, batch = b, rejected, "discarded non-finite updates");
            }
            rejected_updates += rejected;

            if config.report_window == ReportWindow::Batch {
                let report = batch_metrics.take(epoch, Some(b));
                info!(
                    epoch,
                    batch = b,
                    accuracy = report.accuracy,
                    loss = report.loss,
                    "batch"
                );
                windows.push(report);
            } else {
                debug!(epoch, batch = b, "batch applied");
                batch_metrics.reset();
            }
        }

        let report = epoch_metrics.take(epoch, None);
        final_train_accuracy = report.accuracy;
        if config.report_window == ReportWindow::Epoch {
            info!(
                epoch,
                accuracy = report.accuracy,
                loss = report.loss,
                correct = report.confusion.correct(),
                processed = report.processed,
                "epoch"
            );
            windows.push(report);
        }
    }

    let test = if test_len > 0 {
        let job = BatchJob {
            kind: JobKind::Evaluate,
            indices: (0..test_len).collect(),
            weights: weights.clone(),
            step: None,
        };
        let mut metrics = WindowMetrics::new(config.num_classes);
        barrier.run_batch(job, test_len, |stats| metrics.absorb(stats))?;
        let report = metrics.evaluation();
        info!(
            accuracy = report.accuracy,
            loss = report.loss,
            processed = report.processed,
            "held-out evaluation"
        );
        Some(report)
    } else {
        None
    };

    Ok(RunOutcome {
        windows,
        final_train_accuracy,
        test,
        rejected_updates,
        weights,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::EncoderKind;
    use crate::simulator::{ReservoirTopology, SpikingReservoir};

    fn separable() -> Dataset {
        let rows = [(0.0, 0), (0.1, 0), (0.9, 1), (1.0, 1)];
        Dataset::new(
            rows.iter()
                .map(|&(x, label)| Observation {
                    features: vec![x],
                    label,
                })
                .collect(),
        )
    }

    fn bank() -> EncoderBank {
        EncoderBank::from_ranges(EncoderKind::Balanced { timesteps: 10 }, &[0.0], &[1.0]).unwrap()
    }

    fn config() -> TrainerConfig {
        TrainerConfig::default()
            .with_learning_rate(0.5)
            .with_threads(2)
            .with_epochs(200)
            .with_batch_size(4)
            .with_sim_steps(20)
            .with_activation_scale(10.0)
            .with_train_fraction(1.0)
            .with_init_std(0.1)
            .with_seed(7)
    }

    #[test]
    fn separable_rows_reach_full_accuracy() {
        let topo = ReservoirTopology::passthrough(2);
        let report = train::<SpikingReservoir>(&topo, separable(), &bank(), &config()).unwrap();

        assert_eq!(report.train_size, 4);
        assert_eq!(report.windows.len(), 200);
        assert_eq!(report.final_train_accuracy, 1.0);
        let last = report.windows.last().unwrap();
        assert_eq!(last.confusion.off_diagonal(), 0);
        assert_eq!(last.confusion.total(), 4);
        assert!(report.test.is_none());
        assert_eq!(report.weights.num_outputs(), 2);
    }

    #[test]
    fn same_seed_same_weights_across_thread_counts() {
        let topo = ReservoirTopology::passthrough(2);
        let runs: Vec<TrainingReport> = [1, 2, 8]
            .iter()
            .map(|&t| {
                let cfg = config().with_epochs(5).with_threads(t);
                train::<SpikingReservoir>(&topo, separable(), &bank(), &cfg).unwrap()
            })
            .collect();
        for r in &runs[1..] {
            for (a, b) in r.weights.as_slice().iter().zip(runs[0].weights.as_slice()) {
                assert!((a - b).abs() < 1e-9);
            }
            for (wa, wb) in r.windows.iter().zip(&runs[0].windows) {
                assert_eq!(wa.confusion, wb.confusion);
            }
        }
    }

    fn stats_for_batch(threads: usize, indices: Vec<usize>) -> BatchStats {
        let topo = ReservoirTopology::passthrough(2);
        let data = separable();
        let bank = bank();
        let mut rng = Prng::new(3);
        let weights = WeightMatrix::random_normal(2, 2, 0.5, &mut rng);
        let ctx = WorkerContext {
            topology: &topo,
            bank: &bank,
            train: data.observations(),
            test: &[],
            num_classes: 2,
            num_outputs: 2,
            sim_steps: 20,
            activation_scale: 10.0,
        };
        let barrier = BatchBarrier::new(threads, BatchStats::new(2, 2));
        thread::scope(|s| {
            for _ in 0..threads {
                let (barrier, ctx) = (&barrier, &ctx);
                s.spawn(move || run_worker::<SpikingReservoir>(barrier, ctx));
            }
            let n = indices.len();
            let job = BatchJob {
                kind: JobKind::Train,
                indices,
                weights,
                step: Some(StepParams {
                    learning_rate: 0.2,
                    l2: 0.01,
                }),
            };
            let stats = barrier.run_batch(job, n, |agg| agg.clone()).unwrap();
            barrier.shutdown();
            stats
        })
    }

    #[test]
    fn every_cell_counts_the_whole_batch() {
        let stats = stats_for_batch(3, vec![2, 0, 3, 1]);
        for class in 0..2 {
            for col in 0..3 {
                assert_eq!(stats.gradients.count(class, col), 4);
            }
        }
        assert_eq!(stats.gradients.total_count(), 4 * 2 * 3);
        assert_eq!(stats.processed, 4);
    }

    #[test]
    fn merged_batch_is_independent_of_worker_count() {
        let base = stats_for_batch(1, vec![3, 1, 0, 2]);
        for threads in [2, 8] {
            let other = stats_for_batch(threads, vec![3, 1, 0, 2]);
            assert_eq!(other.confusion, base.confusion);
            assert_eq!(other.processed, base.processed);
            assert!((other.loss_sum - base.loss_sum).abs() < 1e-9);
            for class in 0..2 {
                for col in 0..3 {
                    let d = other.gradients.sum(class, col) - base.gradients.sum(class, col);
                    assert!(d.abs() < 1e-9);
                }
            }
        }
    }

    #[test]
    fn bad_configuration_fails_before_training() {
        let topo = ReservoirTopology::passthrough(2);
        let bad = config().with_threads(0);
        assert!(matches!(
            train::<SpikingReservoir>(&topo, separable(), &bank(), &bad),
            Err(TrainError::Config(ConfigError::Trainer { field: "threads", .. }))
        ));

        let big_batch = config().with_batch_size(5);
        assert!(matches!(
            train::<SpikingReservoir>(&topo, separable(), &bank(), &big_batch),
            Err(TrainError::Config(ConfigError::Trainer { field: "batch_size", .. }))
        ));

        // Two balanced encoders need four inputs; the topology has two.
        let wide = EncoderBank::from_ranges(
            EncoderKind::Balanced { timesteps: 10 },
            &[0.0, 0.0],
            &[1.0, 1.0],
        )
        .unwrap();
        let two_features = Dataset::new(vec![Observation {
            features: vec![0.1, 0.2],
            label: 0,
        }]);
        assert!(matches!(
            train::<SpikingReservoir>(&topo, two_features, &wide, &config()),
            Err(TrainError::Config(ConfigError::InputsExhausted { .. }))
        ));

        assert!(matches!(
            train::<SpikingReservoir>(&topo, separable(), &wide, &config()),
            Err(TrainError::Config(ConfigError::RangeCountMismatch { .. }))
        ));
    }

    /// Binds fine on the dispatcher's probe but fails inside workers.
    struct FlakySim(SpikingReservoir);

    impl Simulator for FlakySim {
        type Topology = ReservoirTopology;

        fn bind(topology: &ReservoirTopology) -> std::result::Result<Self, SimError> {
            SpikingReservoir::bind(topology).map(FlakySim)
        }
        fn clear_activity(&mut self) {
            self.0.clear_activity();
        }
        fn inject(&mut self, _stimulus: Stimulus) -> std::result::Result<(), SimError> {
            Err(SimError::InputOutOfRange {
                target: 99,
                inputs: self.0.num_inputs(),
            })
        }
        fn advance(&mut self, steps: u32) {
            self.0.advance(steps);
        }
        fn read_output_counts(&self) -> Vec<u32> {
            self.0.read_output_counts()
        }
        fn read_all_firing_counts(&self) -> Vec<u32> {
            self.0.read_all_firing_counts()
        }
        fn num_inputs(&self) -> usize {
            self.0.num_inputs()
        }
        fn num_outputs(&self) -> usize {
            self.0.num_outputs()
        }
    }

    #[test]
    fn simulator_fault_stops_the_run() {
        let topo = ReservoirTopology::passthrough(2);
        let err = train::<FlakySim>(&topo, separable(), &bank(), &config()).unwrap_err();
        assert!(matches!(
            err,
            TrainError::Barrier(crate::error::BarrierError::WorkerFault { batch_index: 1, .. })
        ));
    }

    #[test]
    fn held_out_subset_is_evaluated() {
        let rows: Vec<Observation> = (0..40)
            .map(|i| {
                let x = (i % 10) as f64 / 10.0;
                Observation {
                    features: vec![x],
                    label: usize::from(x >= 0.5),
                }
            })
            .collect();
        let topo = ReservoirTopology::passthrough(2);
        let cfg = config()
            .with_train_fraction(0.75)
            .with_epochs(3)
            .with_batch_size(5)
            .with_report_window(ReportWindow::Batch);
        let report = train::<SpikingReservoir>(&topo, Dataset::new(rows), &bank(), &cfg).unwrap();

        assert_eq!(report.train_size + report.test_size, 40);
        let per_epoch = report.train_size / 5;
        assert_eq!(report.windows.len(), 3 * per_epoch);
        assert!(report.windows.iter().all(|w| w.batch.is_some() && w.processed == 5));
        if report.test_size > 0 {
            let test = report.test.as_ref().unwrap();
            assert_eq!(test.processed as usize, report.test_size);
            assert_eq!(test.confusion.total() as usize, report.test_size);
        }
    }
}
