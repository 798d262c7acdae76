#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use crate::classify::backend::ClipClassifier;
use crate::classify::result::Prediction;
use crate::frame::SharedFrame;

/// Tract-based backend for ONNX video classifiers.
///
/// Expects a model exported with a `[1, T, 3, H, W]` float input (VideoMAE layout) and
/// a `[1, num_labels]` logits output. Frames are resized nearest-neighbor to the model
/// input and scaled to [0, 1].
pub struct TractClassifier {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    num_frames: usize,
    width: u32,
    height: u32,
    labels: Vec<String>,
}

impl TractClassifier {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        num_frames: usize,
        width: u32,
        height: u32,
        labels: Vec<String>,
    ) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, num_frames, 3, height as usize, width as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            num_frames,
            width,
            height,
            labels,
        })
    }

    fn build_input(&self, clip: &[SharedFrame]) -> Result<Tensor> {
        if clip.len() != self.num_frames {
            return Err(anyhow!(
                "clip has {} frames, model expects {}",
                clip.len(),
                self.num_frames
            ));
        }

        let out_w = self.width as usize;
        let out_h = self.height as usize;
        let input = tract_ndarray::Array5::from_shape_fn(
            (1, self.num_frames, 3, out_h, out_w),
            |(_, t, channel, y, x)| {
                let frame = &clip[t];
                let src_x = (x * frame.width() as usize / out_w) as u32;
                let src_y = (y * frame.height() as usize / out_h) as u32;
                frame
                    .pixel(src_x, src_y)
                    .map(|rgb| rgb[channel] as f32 / 255.0)
                    .unwrap_or(0.0)
            },
        );

        Ok(input.into_tensor())
    }

    fn top_label(&self, outputs: TVec<TValue>) -> Result<Prediction> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let logits = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let logits: Vec<f32> = logits.iter().cloned().collect();
        if logits.is_empty() {
            return Err(anyhow!("model produced empty logits"));
        }

        let probs = softmax(&logits);
        let (index, confidence) = probs
            .iter()
            .cloned()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |best, (i, p)| {
                if p > best.1 {
                    (i, p)
                } else {
                    best
                }
            });
        let label = self
            .labels
            .get(index)
            .cloned()
            .unwrap_or_else(|| index.to_string());
        Ok(Prediction::new(label, confidence))
    }
}

impl ClipClassifier for TractClassifier {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn window_size(&self) -> usize {
        self.num_frames
    }

    fn predict(&mut self, clip: &[SharedFrame]) -> Result<Prediction> {
        let input = self.build_input(clip)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.top_label(outputs)
    }
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    if sum > 0.0 && sum.is_finite() {
        exps.iter().map(|v| v / sum).collect()
    } else {
        vec![0.0; logits.len()]
    }
}
