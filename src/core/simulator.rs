//! Simulator boundary and the bundled reference reservoir.
//!
//! The trainer treats the reservoir as a black box behind [`Simulator`]:
//! bind once to a topology, then repeatedly clear, inject, advance and read.
//! [`SpikingReservoir`] is a small deterministic leaky integrate-and-fire
//! network that satisfies the contract.

use std::collections::BTreeMap;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::encoder::{Stimulus, FULL_MAGNITUDE};
use crate::error::SimError;

/// One long-lived simulator instance. Each worker thread owns exactly one.
pub trait Simulator: Send + Sized {
    /// Network description the handle is bound to.
    type Topology: Sync + ?Sized;

    /// One-time binding to a fixed topology.
    fn bind(topology: &Self::Topology) -> Result<Self, SimError>;

    /// Reset transient activity; the bound topology is kept.
    fn clear_activity(&mut self);

    /// Queue a stimulus for the next run.
    fn inject(&mut self, stimulus: Stimulus) -> Result<(), SimError>;

    fn inject_many(&mut self, stimuli: &[Stimulus]) -> Result<(), SimError> {
        for s in stimuli {
            self.inject(*s)?;
        }
        Ok(())
    }

    /// Run for `steps` discrete time steps.
    fn advance(&mut self, steps: u32);

    /// Spike counts per output channel since the last clear, in stable order.
    fn read_output_counts(&self) -> Vec<u32>;

    /// Spike counts for every internal neuron since the last clear.
    fn read_all_firing_counts(&self) -> Vec<u32>;

    fn num_inputs(&self) -> usize;

    fn num_outputs(&self) -> usize;
}

/// Bind `handle` on first use and hand back the live simulator.
pub fn bind_once<'s, S: Simulator>(
    handle: &'s mut Option<S>,
    topology: &S::Topology,
) -> Result<&'s mut S, SimError> {
    match handle {
        Some(sim) => Ok(sim),
        None => Ok(handle.insert(S::bind(topology)?)),
    }
}

/// Processor name accepted by [`SpikingReservoir`].
pub const LIF_PROCESSOR: &str = "lif";

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NeuronSpec {
    pub threshold: f32,
    /// Fraction of potential lost per step, in [0, 1].
    #[cfg_attr(feature = "serde", serde(default))]
    pub leak: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SynapseSpec {
    pub from: usize,
    pub to: usize,
    pub weight: f32,
    /// Steps between the presynaptic spike and delivery (>= 1).
    pub delay: u32,
}

/// Static description of a reservoir. Loaded once and shared read-only by
/// every worker.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ReservoirTopology {
    pub processor: String,
    pub neurons: Vec<NeuronSpec>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub synapses: Vec<SynapseSpec>,
    /// Input index -> neuron.
    pub inputs: Vec<usize>,
    /// Output channel -> neuron.
    pub outputs: Vec<usize>,
}

impl ReservoirTopology {
    #[cfg(feature = "serde")]
    pub fn from_json(text: &str) -> Result<Self, SimError> {
        serde_json::from_str(text).map_err(|e| SimError::InvalidTopology {
            reason: e.to_string(),
        })
    }

    /// Neurons wired straight through: input `i` drives neuron `i`, which is
    /// also output `i`. Every injected full-magnitude stimulus produces one
    /// output spike.
    pub fn passthrough(channels: usize) -> Self {
        Self {
            processor: LIF_PROCESSOR.to_string(),
            neurons: vec![
                NeuronSpec {
                    threshold: 1.0,
                    leak: 1.0,
                };
                channels
            ],
            synapses: Vec::new(),
            inputs: (0..channels).collect(),
            outputs: (0..channels).collect(),
        }
    }

    fn validate(&self) -> Result<(), SimError> {
        if self.processor != LIF_PROCESSOR {
            return Err(SimError::ProcessorMismatch {
                expected: LIF_PROCESSOR,
                found: self.processor.clone(),
            });
        }
        let n = self.neurons.len();
        let invalid = |reason: String| Err(SimError::InvalidTopology { reason });
        if n == 0 {
            return invalid("no neurons".into());
        }
        for (i, neuron) in self.neurons.iter().enumerate() {
            if !(neuron.threshold.is_finite() && neuron.threshold > 0.0) {
                return invalid(format!("neuron {i} threshold must be positive"));
            }
            if !(0.0..=1.0).contains(&neuron.leak) {
                return invalid(format!("neuron {i} leak must be in [0, 1]"));
            }
        }
        for (i, syn) in self.synapses.iter().enumerate() {
            if syn.from >= n || syn.to >= n {
                return invalid(format!("synapse {i} references a missing neuron"));
            }
            if syn.delay == 0 {
                return invalid(format!("synapse {i} has zero delay"));
            }
            if !syn.weight.is_finite() {
                return invalid(format!("synapse {i} weight is not finite"));
            }
        }
        if let Some(bad) = self.inputs.iter().chain(&self.outputs).find(|&&id| id >= n) {
            return invalid(format!("I/O index {bad} references a missing neuron"));
        }
        if self.outputs.is_empty() {
            return invalid("no output neurons".into());
        }
        Ok(())
    }
}

/// Discrete-time leaky integrate-and-fire reservoir.
///
/// Deterministic: identical stimuli after `clear_activity` always produce
/// identical counts.
#[derive(Debug, Clone)]
pub struct SpikingReservoir {
    thresholds: Vec<f32>,
    leaks: Vec<f32>,
    // CSR fan-out: outgoing synapses of neuron i live in
    // targets[offsets[i]..offsets[i + 1]].
    offsets: Vec<usize>,
    targets: Vec<(usize, f32, u32)>,
    inputs: Vec<usize>,
    outputs: Vec<usize>,

    potentials: Vec<f32>,
    counts: Vec<u32>,
    // Absolute step -> (neuron, charge).
    pending: BTreeMap<u64, Vec<(usize, f32)>>,
    now: u64,
    fired: Vec<usize>,
}

impl SpikingReservoir {
    fn deliver_due(&mut self) {
        while let Some(entry) = self.pending.first_entry() {
            if *entry.key() > self.now {
                break;
            }
            for (neuron, charge) in entry.remove() {
                self.potentials[neuron] += charge;
            }
        }
    }

    fn schedule(&mut self, at: u64, neuron: usize, charge: f32) {
        self.pending.entry(at).or_default().push((neuron, charge));
    }

    fn step(&mut self) {
        self.deliver_due();

        self.fired.clear();
        for (i, p) in self.potentials.iter_mut().enumerate() {
            if *p >= self.thresholds[i] {
                *p = 0.0;
                self.counts[i] += 1;
                self.fired.push(i);
            }
        }

        for k in 0..self.fired.len() {
            let src = self.fired[k];
            for s in self.offsets[src]..self.offsets[src + 1] {
                let (to, weight, delay) = self.targets[s];
                self.schedule(self.now + delay as u64, to, weight);
            }
        }

        for (p, leak) in self.potentials.iter_mut().zip(&self.leaks) {
            *p -= *p * leak;
        }
        self.now += 1;
    }
}

impl Simulator for SpikingReservoir {
    type Topology = ReservoirTopology;

    fn bind(topology: &ReservoirTopology) -> Result<Self, SimError> {
        topology.validate()?;

        let n = topology.neurons.len();
        let mut fan_out = vec![0usize; n + 1];
        for syn in &topology.synapses {
            fan_out[syn.from + 1] += 1;
        }
        for i in 0..n {
            fan_out[i + 1] += fan_out[i];
        }
        let mut fill = fan_out.clone();
        let mut targets = vec![(0usize, 0.0f32, 0u32); topology.synapses.len()];
        for syn in &topology.synapses {
            targets[fill[syn.from]] = (syn.to, syn.weight, syn.delay);
            fill[syn.from] += 1;
        }

        Ok(Self {
            thresholds: topology.neurons.iter().map(|n| n.threshold).collect(),
            leaks: topology.neurons.iter().map(|n| n.leak).collect(),
            offsets: fan_out,
            targets,
            inputs: topology.inputs.clone(),
            outputs: topology.outputs.clone(),
            potentials: vec![0.0; n],
            counts: vec![0; n],
            pending: BTreeMap::new(),
            now: 0,
            fired: Vec::new(),
        })
    }

    fn clear_activity(&mut self) {
        self.potentials.fill(0.0);
        self.counts.fill(0);
        self.pending.clear();
        self.now = 0;
    }

    fn inject(&mut self, stimulus: Stimulus) -> Result<(), SimError> {
        let neuron = *self
            .inputs
            .get(stimulus.target)
            .ok_or(SimError::InputOutOfRange {
                target: stimulus.target,
                inputs: self.inputs.len(),
            })?;
        let charge = stimulus.magnitude as f32 / FULL_MAGNITUDE as f32;
        self.schedule(self.now + stimulus.offset as u64, neuron, charge);
        Ok(())
    }

    fn advance(&mut self, steps: u32) {
        for _ in 0..steps {
            self.step();
        }
    }

    fn read_output_counts(&self) -> Vec<u32> {
        self.outputs.iter().map(|&n| self.counts[n]).collect()
    }

    fn read_all_firing_counts(&self) -> Vec<u32> {
        self.counts.clone()
    }

    fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    fn num_outputs(&self) -> usize {
        self.outputs.len()
    }
}
