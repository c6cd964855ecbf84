//! Flat tensor checkpoints, serialized with postcard.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use ndarray::{Array, ArrayD, Dimension};
use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// Flat mapping from parameter name to tensor.
pub type StateDict = BTreeMap<String, ArrayD<f32>>;

/// Serialized network weights.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Checkpoint {
    pub tensors: StateDict,
    /// blake3 hex digest of the serialized bytes.
    #[serde(skip)]
    pub fingerprint: String,
}

impl Checkpoint {
    pub fn from_state_dict(tensors: StateDict) -> Result<Self> {
        let mut ckpt = Self {
            tensors,
            fingerprint: String::new(),
        };
        ckpt.fingerprint = blake3::hash(&ckpt.to_bytes()?).to_hex().to_string();
        Ok(ckpt)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut ckpt: Checkpoint = postcard::from_bytes(data).context("decoding checkpoint")?;
        ckpt.fingerprint = blake3::hash(data).to_hex().to_string();
        Ok(ckpt)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(postcard::to_allocvec(self)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let ckpt = Self::from_bytes(&data).with_context(|| format!("parsing {}", path.display()))?;
        log::info!(
            "loaded checkpoint from {} ({} tensors)",
            path.display(),
            ckpt.tensors.len()
        );
        Ok(ckpt)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_bytes()?).with_context(|| format!("writing {}", path.display()))
    }

    /// Class count of the stored classification head, if any.
    pub fn n_classes(&self) -> Option<usize> {
        self.tensors.get("final.weight").and_then(|w| w.shape().first().copied())
    }
}

pub(crate) fn insert_param<D: Dimension>(sd: &mut StateDict, name: &str, value: &Array<f32, D>) {
    sd.insert(name.to_string(), value.clone().into_dyn());
}

/// Fetches `name` and checks it has exactly `expected` shape.
pub(crate) fn load_param<D: Dimension>(
    sd: &StateDict,
    name: &str,
    expected: &[usize],
) -> Result<Array<f32, D>> {
    let tensor = sd
        .get(name)
        .ok_or_else(|| ModelError::MissingParameter(name.to_string()))?;
    if tensor.shape() != expected {
        return Err(ModelError::ShapeMismatch {
            name: name.to_string(),
            expected: expected.to_vec(),
            got: tensor.shape().to_vec(),
        }
        .into());
    }
    Ok(tensor.clone().into_dimensionality::<D>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array1, Array2};

    #[test]
    fn test_load_param_checks_shape() {
        let mut sd = StateDict::new();
        insert_param(&mut sd, "bn.weight", &array![1.0f32, 2.0]);
        let ok: Array1<f32> = load_param(&sd, "bn.weight", &[2]).unwrap();
        assert_eq!(ok, array![1.0, 2.0]);

        let err = load_param::<ndarray::Ix1>(&sd, "bn.weight", &[3]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ModelError>(),
            Some(ModelError::ShapeMismatch { .. })
        ));
        let err = load_param::<ndarray::Ix1>(&sd, "bn.bias", &[2]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ModelError>(),
            Some(ModelError::MissingParameter(_))
        ));
    }

    #[test]
    fn test_fingerprint_follows_bytes() -> Result<()> {
        let mut sd = StateDict::new();
        insert_param(&mut sd, "final.weight", &Array2::<f32>::zeros((3, 4)));
        let ckpt = Checkpoint::from_state_dict(sd.clone())?;
        let reread = Checkpoint::from_bytes(&ckpt.to_bytes()?)?;
        assert_eq!(ckpt.fingerprint, reread.fingerprint);
        assert_eq!(reread.n_classes(), Some(3));

        insert_param(&mut sd, "pooling.p", &array![3.5f32]);
        let other = Checkpoint::from_state_dict(sd)?;
        assert_ne!(ckpt.fingerprint, other.fingerprint);
        Ok(())
    }
}
