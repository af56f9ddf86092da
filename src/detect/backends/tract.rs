#![cfg(feature = "backend-tract")]

use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tract_onnx::prelude::*;

use crate::frame::{FrameSample, GrayPlane};

use super::pose::{Landmark, PoseEstimator};

type Plan = TypedRunnableModel<TypedModel>;

/// ONNX pose model run through tract.
///
/// The model takes a `1x3xHxW` float image in `0.0..=1.0` and yields a flat list of
/// `(x, y, score)` triples, with coordinates normalised to the input size. Inference runs
/// on the blocking pool so the monitor task is never stalled by CPU work.
pub struct TractPoseEstimator {
    plan: Arc<Plan>,
    width: usize,
    height: usize,
}

impl TractPoseEstimator {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, width: u32, height: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let plan = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, height as usize, width as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            plan: Arc::new(plan),
            width: width as usize,
            height: height as usize,
        })
    }

    fn build_input(&self, frame: &FrameSample) -> Tensor {
        let plane = GrayPlane::resampled(frame, self.width, self.height);
        // Gray replicated across the three channels the model expects.
        tract_ndarray::Array4::from_shape_fn((1, 3, self.height, self.width), |(_, _, y, x)| {
            plane.get(x, y) as f32 / 255.0
        })
        .into_tensor()
    }
}

fn landmarks_from(outputs: TVec<TValue>) -> Result<Vec<Landmark>> {
    let output = outputs
        .first()
        .ok_or_else(|| anyhow!("model produced no outputs"))?;
    let values = output
        .to_array_view::<f32>()
        .context("model output tensor was not f32")?;
    let flat: Vec<f32> = values.iter().copied().collect();
    if flat.len() % 3 != 0 {
        return Err(anyhow!(
            "model output has {} values, expected (x, y, score) triples",
            flat.len()
        ));
    }
    Ok(flat
        .chunks_exact(3)
        .map(|t| Landmark::new(t[0], t[1], t[2]))
        .collect())
}

#[async_trait]
impl PoseEstimator for TractPoseEstimator {
    fn name(&self) -> &'static str {
        "tract"
    }

    async fn estimate(&self, frame: &FrameSample) -> Result<Vec<Landmark>> {
        let input = self.build_input(frame);
        let plan = Arc::clone(&self.plan);
        let outputs = tokio::task::spawn_blocking(move || plan.run(tvec!(input.into())))
            .await
            .context("pose inference task failed")?
            .context("ONNX inference failed")?;
        landmarks_from(outputs)
    }
}
