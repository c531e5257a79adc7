//! Observations, loading, the train/test split and feature range scans.

use std::io::BufRead;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::DatasetError;
use crate::prng::Prng;

#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub features: Vec<f64>,
    /// Zero-based class index.
    pub label: usize,
}

/// How labels are numbered in the source files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum LabelBase {
    #[default]
    Zero,
    /// Source labels start at 1 and are shifted down on load.
    One,
}

impl LabelBase {
    fn offset(self) -> i64 {
        match self {
            LabelBase::Zero => 0,
            LabelBase::One => 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    observations: Vec<Observation>,
}

impl Dataset {
    pub fn new(observations: Vec<Observation>) -> Self {
        Self { observations }
    }

    /// Read a feature matrix and a parallel label stream.
    ///
    /// Feature rows are numbers separated by commas and/or whitespace; blank
    /// lines are skipped. Labels are whitespace-separated integers consumed
    /// one per row.
    pub fn from_readers<F: BufRead, L: BufRead>(
        features: F,
        labels: L,
        label_base: LabelBase,
        num_classes: usize,
    ) -> Result<Self, DatasetError> {
        let mut label_tokens = Vec::new();
        for (i, line) in labels.lines().enumerate() {
            let line = line?;
            for token in line.split_whitespace() {
                let v: i64 = token.parse().map_err(|_| DatasetError::BadNumber {
                    line: i + 1,
                    token: token.to_string(),
                })?;
                label_tokens.push(v);
            }
        }

        let mut observations = Vec::new();
        let mut width = None;
        for (i, line) in features.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let row = parse_row(&line, i + 1)?;
            let expected = *width.get_or_insert(row.len());
            if row.len() != expected {
                return Err(DatasetError::RaggedRow {
                    line: i + 1,
                    expected,
                    found: row.len(),
                });
            }

            let idx = observations.len();
            let raw = *label_tokens
                .get(idx)
                .ok_or(DatasetError::MissingLabel { row: idx })?;
            let label = raw - label_base.offset();
            if label < 0 || label >= num_classes as i64 {
                return Err(DatasetError::LabelOutOfRange {
                    row: idx,
                    label,
                    num_classes,
                });
            }
            observations.push(Observation {
                features: row,
                label: label as usize,
            });
        }

        if observations.is_empty() {
            return Err(DatasetError::Empty);
        }
        Ok(Self { observations })
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    pub fn num_features(&self) -> usize {
        self.observations.first().map_or(0, |o| o.features.len())
    }

    /// Every row `num_features` wide and every label below `num_classes`.
    pub fn check_shape(&self, num_features: usize, num_classes: usize) -> Result<(), DatasetError> {
        if self.observations.is_empty() {
            return Err(DatasetError::Empty);
        }
        for (row, obs) in self.observations.iter().enumerate() {
            if obs.features.len() != num_features {
                return Err(DatasetError::RaggedRow {
                    line: row + 1,
                    expected: num_features,
                    found: obs.features.len(),
                });
            }
            if obs.label >= num_classes {
                return Err(DatasetError::LabelOutOfRange {
                    row,
                    label: obs.label as i64,
                    num_classes,
                });
            }
        }
        Ok(())
    }

    /// Independent draw per item: kept for training with probability
    /// `train_fraction`, otherwise held out. Not stratified.
    pub fn split(self, train_fraction: f64, rng: &mut Prng) -> (Dataset, Dataset) {
        let mut train = Vec::new();
        let mut test = Vec::new();
        for obs in self.observations {
            if rng.next_f64_01() < train_fraction {
                train.push(obs);
            } else {
                test.push(obs);
            }
        }
        (Dataset::new(train), Dataset::new(test))
    }
}

fn parse_row(line: &str, line_no: usize) -> Result<Vec<f64>, DatasetError> {
    line.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|t| !t.is_empty())
        .map(|t| {
            t.parse::<f64>().map_err(|_| DatasetError::BadNumber {
                line: line_no,
                token: t.to_string(),
            })
        })
        .collect()
}

/// Per-feature minimum and maximum over a dataset.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FeatureRanges {
    pub min: Vec<f64>,
    pub max: Vec<f64>,
}

impl FeatureRanges {
    pub fn scan(dataset: &Dataset) -> Self {
        let n = dataset.num_features();
        let mut min = vec![f64::INFINITY; n];
        let mut max = vec![f64::NEG_INFINITY; n];
        for obs in dataset.observations() {
            for (i, &x) in obs.features.iter().enumerate().take(n) {
                min[i] = min[i].min(x);
                max[i] = max[i].max(x);
            }
        }
        Self { min, max }
    }
}
