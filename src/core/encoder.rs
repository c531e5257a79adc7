//! Stimulus encoders: one continuous feature in, a sparse set of timed
//! stimuli out.
//!
//! Each encoder owns a contiguous block of simulator inputs
//! `base .. base + width()`. [`EncoderBank`] hands out blocks in sequence so
//! encoders for different features never overlap.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Magnitude used for every encoder-produced stimulus.
pub const FULL_MAGNITUDE: u8 = 255;

/// A single injected event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Stimulus {
    /// Simulator input index.
    pub target: usize,
    /// Logical time step, relative to the start of the run.
    pub offset: u32,
    pub magnitude: u8,
}

impl Stimulus {
    pub fn new(target: usize, offset: u32, magnitude: u8) -> Self {
        Self {
            target,
            offset,
            magnitude,
        }
    }
}

/// Which strategy (and its size parameter) to build for every feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum EncoderKind {
    /// Two-input population code with `timesteps` total spikes.
    Balanced { timesteps: u32 },
    /// One-hot code over `num_bins` inputs.
    Bin { num_bins: usize },
}

impl EncoderKind {
    pub fn width(&self) -> usize {
        match *self {
            EncoderKind::Balanced { .. } => 2,
            EncoderKind::Bin { num_bins } => num_bins,
        }
    }

    /// Parse `balanced:<timesteps>` or `bin:<num_bins>`.
    pub fn parse(s: &str) -> Option<Self> {
        let (name, arg) = s.split_once(':')?;
        match name.trim() {
            "balanced" => Some(EncoderKind::Balanced {
                timesteps: arg.trim().parse().ok()?,
            }),
            "bin" => Some(EncoderKind::Bin {
                num_bins: arg.trim().parse().ok()?,
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Encoder {
    Balanced(BalancedEncoder),
    Bin(BinEncoder),
}

impl Encoder {
    pub fn new(kind: EncoderKind, base: usize, dmin: f64, dmax: f64) -> Result<Self, ConfigError> {
        Ok(match kind {
            EncoderKind::Balanced { timesteps } => {
                Encoder::Balanced(BalancedEncoder::new(base, timesteps, dmin, dmax)?)
            }
            EncoderKind::Bin { num_bins } => {
                Encoder::Bin(BinEncoder::new(base, num_bins, dmin, dmax)?)
            }
        })
    }

    pub fn encode(&self, x: f64) -> Vec<Stimulus> {
        match self {
            Encoder::Balanced(e) => e.encode(x),
            Encoder::Bin(e) => e.encode(x),
        }
    }

    pub fn width(&self) -> usize {
        match self {
            Encoder::Balanced(_) => 2,
            Encoder::Bin(e) => e.num_bins,
        }
    }

    pub fn base(&self) -> usize {
        match self {
            Encoder::Balanced(e) => e.base,
            Encoder::Bin(e) => e.base,
        }
    }
}

fn check_range(dmin: f64, dmax: f64) -> Result<(), ConfigError> {
    // `!(dmax > dmin)` also rejects NaN bounds.
    if !dmin.is_finite() || !dmax.is_finite() || !(dmax > dmin) {
        return Err(ConfigError::EmptyRange { dmin, dmax });
    }
    Ok(())
}

/// Splits `timesteps` spikes between two inputs in proportion to where `x`
/// sits in `[dmin, dmax]`.
///
/// At `x = dmin` the second input receives all `timesteps` spikes and the
/// first receives none; at `x = dmax` it is the other way round. Values
/// outside the range are clamped to it first.
#[derive(Debug, Clone, PartialEq)]
pub struct BalancedEncoder {
    base: usize,
    timesteps: u32,
    dmin: f64,
    range: f64,
}

impl BalancedEncoder {
    pub fn new(base: usize, timesteps: u32, dmin: f64, dmax: f64) -> Result<Self, ConfigError> {
        check_range(dmin, dmax)?;
        if timesteps == 0 {
            return Err(ConfigError::ZeroWidth { what: "timesteps" });
        }
        Ok(Self {
            base,
            timesteps,
            dmin,
            range: dmax - dmin,
        })
    }

    /// Spike counts `(first, second)` for `x`.
    pub fn counts(&self, x: f64) -> (u32, u32) {
        if !x.is_finite() {
            return (0, 0);
        }
        let frac = ((x - self.dmin) / self.range).clamp(0.0, 1.0);
        let t = self.timesteps as f64;
        let hi = (frac * t).floor() as u32;
        let lo = ((1.0 - frac) * t).floor() as u32;
        (hi.min(self.timesteps), lo.min(self.timesteps))
    }

    pub fn encode(&self, x: f64) -> Vec<Stimulus> {
        let (hi, lo) = self.counts(x);
        let mut out = Vec::with_capacity((hi + lo) as usize);
        out.extend((0..hi).map(|t| Stimulus::new(self.base, t, FULL_MAGNITUDE)));
        out.extend((0..lo).map(|t| Stimulus::new(self.base + 1, t, FULL_MAGNITUDE)));
        out
    }
}

/// One-hot encoding into `num_bins` equal-width bins.
#[derive(Debug, Clone, PartialEq)]
pub struct BinEncoder {
    base: usize,
    num_bins: usize,
    dmin: f64,
    bin_width: f64,
}

impl BinEncoder {
    pub fn new(base: usize, num_bins: usize, dmin: f64, dmax: f64) -> Result<Self, ConfigError> {
        check_range(dmin, dmax)?;
        if num_bins == 0 {
            return Err(ConfigError::ZeroWidth { what: "num_bins" });
        }
        Ok(Self {
            base,
            num_bins,
            dmin,
            bin_width: (dmax - dmin) / num_bins as f64,
        })
    }

    pub fn bin(&self, x: f64) -> usize {
        let raw = ((x - self.dmin) / self.bin_width).floor();
        if raw.is_nan() || raw < 0.0 {
            return 0;
        }
        (raw as usize).min(self.num_bins - 1)
    }

    pub fn encode(&self, x: f64) -> Vec<Stimulus> {
        vec![Stimulus::new(self.base + self.bin(x), 0, FULL_MAGNITUDE)]
    }
}

/// One encoder per feature, allocated over consecutive input blocks.
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderBank {
    encoders: Vec<Encoder>,
    next_base: usize,
}

impl EncoderBank {
    pub fn new() -> Self {
        Self {
            encoders: Vec::new(),
            next_base: 0,
        }
    }

    /// Build one encoder of `kind` per `(dmin, dmax)` pair.
    pub fn from_ranges(kind: EncoderKind, dmin: &[f64], dmax: &[f64]) -> Result<Self, ConfigError> {
        if dmin.len() != dmax.len() {
            return Err(ConfigError::RangeCountMismatch {
                features: dmin.len(),
                ranges: dmax.len(),
            });
        }
        let mut bank = Self::new();
        for (&lo, &hi) in dmin.iter().zip(dmax) {
            bank.push(kind, lo, hi)?;
        }
        Ok(bank)
    }

    /// Append an encoder at the next free input block.
    pub fn push(&mut self, kind: EncoderKind, dmin: f64, dmax: f64) -> Result<&Encoder, ConfigError> {
        let enc = Encoder::new(kind, self.next_base, dmin, dmax)?;
        self.next_base += enc.width();
        self.encoders.push(enc);
        Ok(&self.encoders[self.encoders.len() - 1])
    }

    pub fn len(&self) -> usize {
        self.encoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.encoders.is_empty()
    }

    /// Total simulator inputs claimed by the bank.
    pub fn input_width(&self) -> usize {
        self.next_base
    }

    pub fn encoders(&self) -> &[Encoder] {
        &self.encoders
    }

    /// Fail if the bank needs more inputs than the simulator exposes.
    pub fn check_inputs(&self, available: usize) -> Result<(), ConfigError> {
        match self.encoders.last() {
            Some(last) if self.next_base > available => Err(ConfigError::InputsExhausted {
                base: last.base(),
                needed: last.width(),
                available,
            }),
            _ => Ok(()),
        }
    }

    /// Encode every feature of one observation into `out`.
    pub fn encode_into(&self, features: &[f64], out: &mut Vec<Stimulus>) {
        out.clear();
        for (enc, &x) in self.encoders.iter().zip(features) {
            out.extend(enc.encode(x));
        }
    }
}

impl Default for EncoderBank {
    fn default() -> Self {
        Self::new()
    }
}
