use std::path::Path;

use anyhow::{Context, Result};
use ndarray::Array4;
use ort::{
    ep::{self, ExecutionProvider},
    session::{
        builder::{GraphOptimizationLevel, SessionBuilder},
        Session,
    },
    value::Value,
};

use crate::backbone::Backbone;
use crate::error::ModelError;

pub fn session_builder(device: &str) -> Result<SessionBuilder> {
    let mut builder =
        Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;

    if device == "cpu" {
        return Ok(builder);
    }

    #[cfg(feature = "openvino")]
    {
        let ep = ep::OpenVINO::default();
        if ep.is_available()? {
            ep.register(&mut builder)?;
        } else {
            log::warn!("openvino feature is enabled, onnx runtime not compiled with openvino")
        }
    }

    #[cfg(feature = "cuda")]
    {
        let ep = ep::CUDA::default();
        if ep.is_available()? {
            ep.register(&mut builder)?;
        } else {
            log::warn!("cuda feature is enabled, onnx runtime not compiled with cuda")
        }
    }

    #[cfg(not(any(feature = "openvino", feature = "cuda")))]
    log::warn!("device {device} requested but no accelerator feature is enabled, using cpu");

    Ok(builder)
}

/// Backbone exported to ONNX with its classifier and global pool removed,
/// so the graph returns the raw `[N, C, H, W]` feature map.
pub struct OnnxBackbone {
    session: Session,
    features: usize,
    /// blake3 of the model file.
    digest: String,
}

impl OnnxBackbone {
    pub fn open(path: &Path, device: &str, features: usize) -> Result<Self> {
        let bytes = std::fs::read(path).with_context(|| format!("read backbone {}", path.display()))?;
        let session = session_builder(device)?
            .commit_from_memory(&bytes)
            .with_context(|| format!("load backbone {}", path.display()))?;
        log::info!("loaded backbone {} on {device}", path.display());
        Ok(Self {
            session,
            features,
            digest: blake3::hash(&bytes).to_hex().to_string(),
        })
    }
}

impl Backbone for OnnxBackbone {
    fn forward(&mut self, images: &Array4<f32>) -> Result<Array4<f32>> {
        let batch = images.dim().0;
        let input_tensor = Value::from_array(images.clone())?;
        let outputs = self.session.run(ort::inputs![input_tensor])?;
        let (shape, data) = outputs[0].try_extract_tensor::<f32>()?;
        let dims: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();

        // Some exports keep a global pool and emit [N, C]; treat that as a 1x1 map.
        let (c, h, w) = match dims.as_slice() {
            [n, c, h, w] if *n == batch => (*c, *h, *w),
            [n, c] if *n == batch => (*c, 1, 1),
            _ => {
                return Err(ModelError::ShapeMismatch {
                    name: "backbone output".into(),
                    expected: vec![batch, self.features, 0, 0],
                    got: dims,
                }
                .into())
            }
        };
        if c != self.features {
            return Err(ModelError::ShapeMismatch {
                name: "backbone channels".into(),
                expected: vec![self.features],
                got: vec![c],
            }
            .into());
        }
        Ok(Array4::from_shape_vec((batch, c, h, w), data.to_vec())?)
    }

    fn out_features(&self) -> usize {
        self.features
    }

    fn fingerprint(&self) -> Option<&str> {
        Some(&self.digest)
    }
}
