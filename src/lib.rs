//! # spike_readout
//!
//! Train a linear softmax readout on top of a fixed spiking reservoir.
//!
//! The reservoir is reached only through the [`simulator::Simulator`]
//! trait: bind, clear, inject, advance, read counts. Features are turned into
//! stimuli by [`encoder`]s, a persistent worker pool drives one simulator per
//! thread through a [`barrier::BatchBarrier`], and the calling thread applies
//! the merged mini-batch update.
//!
//! ## Quick Start
//!
//! ```
//! use spike_readout::prelude::*;
//!
//! let topology = ReservoirTopology::passthrough(2);
//! let bank = EncoderBank::from_ranges(EncoderKind::Balanced { timesteps: 10 }, &[0.0], &[1.0])?;
//! let data = Dataset::new(
//!     [(0.0, 0), (0.1, 0), (0.9, 1), (1.0, 1)]
//!         .iter()
//!         .map(|&(x, label)| Observation { features: vec![x], label })
//!         .collect(),
//! );
//! let cfg = TrainerConfig::default()
//!     .with_threads(2)
//!     .with_batch_size(4)
//!     .with_sim_steps(20)
//!     .with_train_fraction(1.0)
//!     .with_seed(42);
//!
//! let report = train::<SpikingReservoir>(&topology, data, &bank, &cfg)?;
//! println!("accuracy {}", report.final_train_accuracy);
//! # Ok::<(), spike_readout::error::TrainError>(())
//! ```
//!
//! ## Feature Flags
//!
//! - `serde` (default): serialization of configs, topologies and reports
//! - `parallel`: pairwise grading math on rayon
//!
//! ## Modules
//!
//! - [`encoder`]: Balanced and Bin stimulus encoders
//! - [`simulator`]: simulator boundary and the reference LIF reservoir
//! - [`barrier`]: batch barrier and claim-ticket work queue
//! - [`gradient`]: gradient/confusion accumulation and the weight update
//! - [`trainer`]: configuration and the training loop
//! - [`grade`]: reservoir separation diagnostics
//! - [`storage`]: weight checkpoints
//! - [`observer`]: run reports

#[path = "core/error.rs"]
pub mod error;

#[path = "core/prng.rs"]
pub mod prng;

#[path = "core/encoder.rs"]
pub mod encoder;

#[path = "core/simulator.rs"]
pub mod simulator;

#[path = "core/barrier.rs"]
pub mod barrier;

#[path = "core/readout.rs"]
pub mod readout;

#[path = "core/gradient.rs"]
pub mod gradient;

#[path = "core/dataset.rs"]
pub mod dataset;

#[path = "core/trainer.rs"]
pub mod trainer;

#[path = "core/grade.rs"]
pub mod grade;

#[path = "core/storage.rs"]
pub mod storage;

pub mod observer;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::barrier::{Aggregate, BarrierPhase, BatchBarrier};
    pub use crate::dataset::{Dataset, FeatureRanges, LabelBase, Observation};
    pub use crate::encoder::{Encoder, EncoderBank, EncoderKind, Stimulus};
    pub use crate::error::{ConfigError, SimError, TrainError};
    pub use crate::grade::{class_separation, collect_responses, min_pairwise_angle, GradeOptions};
    pub use crate::gradient::{BatchStats, ConfusionMatrix, GradientAccumulator};
    pub use crate::observer::{EvalReport, TrainingReport, WindowReport};
    pub use crate::prng::Prng;
    pub use crate::readout::WeightMatrix;
    pub use crate::simulator::{ReservoirTopology, Simulator, SpikingReservoir};
    pub use crate::trainer::{train, ReportWindow, TrainerConfig};
}
