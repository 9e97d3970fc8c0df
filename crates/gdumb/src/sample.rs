//! Labelled training samples

use crate::{GDumbError, Result};
use serde::{Deserialize, Serialize};

/// Integer class id
pub type Label = i64;

/// One labelled exemplar.
///
/// Features are stored flat in row-major order next to their shape. A
/// `Sample` cannot be modified once built; memory replaces whole samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawSample")]
pub struct Sample {
    features: Vec<f32>,
    shape: Vec<usize>,
    label: Label,
}

impl Sample {
    /// Create a sample with an explicit feature shape
    pub fn new(features: Vec<f32>, shape: Vec<usize>, label: Label) -> Result<Self> {
        if features.is_empty() {
            return Err(GDumbError::InvalidSample("empty features".into()));
        }
        if shape.is_empty() || shape.contains(&0) {
            return Err(GDumbError::InvalidSample(format!(
                "shape must be non-empty with positive dims, got {:?}",
                shape
            )));
        }

        let numel: usize = shape.iter().product();
        if numel != features.len() {
            return Err(GDumbError::ShapeMismatch {
                expected: shape,
                got: vec![features.len()],
            });
        }

        Ok(Self {
            features,
            shape,
            label,
        })
    }

    /// Create a sample holding a flat feature vector
    pub fn from_vec(features: Vec<f32>, label: Label) -> Result<Self> {
        let shape = vec![features.len()];
        Self::new(features, shape, label)
    }

    /// Flat feature values
    pub fn features(&self) -> &[f32] {
        &self.features
    }

    /// Feature shape
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Class label
    pub fn label(&self) -> Label {
        self.label
    }

    /// Number of feature elements
    pub fn numel(&self) -> usize {
        self.features.len()
    }
}

/// Unchecked wire form; deserialization goes through [`Sample::new`]
#[derive(Deserialize)]
struct RawSample {
    features: Vec<f32>,
    shape: Vec<usize>,
    label: Label,
}

impl TryFrom<RawSample> for Sample {
    type Error = GDumbError;

    fn try_from(raw: RawSample) -> Result<Self> {
        Sample::new(raw.features, raw.shape, raw.label)
    }
}
