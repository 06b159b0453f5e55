//! ONNX Runtime classifier backend.
//!
//! Each pool worker owns one session; the input buffer is allocated once and
//! refilled per window so steady-state classification does not allocate.

use super::{Classifier, ClassifierProvider, Prediction};
use crate::audio::WINDOW_SAMPLES;
use anyhow::{Context, Result};
use ort::session::Session;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub struct OnnxProvider {
    model: PathBuf,
    codes: Arc<Vec<String>>,
    top_k: usize,
}

impl OnnxProvider {
    pub fn new(model: &Path, codes: Vec<String>, top_k: usize) -> Self {
        OnnxProvider { model: model.to_path_buf(), codes: Arc::new(codes), top_k }
    }
}

impl ClassifierProvider for OnnxProvider {
    fn create(&self) -> Result<Box<dyn Classifier>> {
        Ok(Box::new(OnnxClassifier::open(&self.model, Arc::clone(&self.codes), self.top_k)?))
    }
}

pub struct OnnxClassifier {
    session: Session,
    codes: Arc<Vec<String>>,
    top_k: usize,
    /// Reused input tensor backing store, one window long.
    input: Vec<f32>,
}

impl OnnxClassifier {
    pub fn open(model: &Path, codes: Arc<Vec<String>>, top_k: usize) -> Result<Self> {
        let session = Session::builder()
            .context("ort session builder")?
            .with_execution_providers([ort::ep::CPU::default().build()])
            .context("setting CPU EP")?
            .with_intra_threads(1)
            .context("setting intra-op threads")?
            .commit_from_file(model)
            .with_context(|| format!("loading model from {}", model.display()))?;
        Ok(OnnxClassifier { session, codes, top_k, input: vec![0.0; WINDOW_SAMPLES] })
    }
}

impl Classifier for OnnxClassifier {
    fn classify(&mut self, pcm: &[f32]) -> Result<Vec<Prediction>> {
        anyhow::ensure!(
            pcm.len() == WINDOW_SAMPLES,
            "window must be {WINDOW_SAMPLES} samples, got {}",
            pcm.len()
        );
        self.input.copy_from_slice(pcm);

        let tensor = ort::value::Tensor::from_array(([1usize, WINDOW_SAMPLES], self.input.clone()))
            .context("building input tensor")?;
        let outputs =
            self.session.run(ort::inputs![tensor]).context("running model")?;
        let (_, scores) = outputs[0]
            .try_extract_tensor::<f32>()
            .context("extracting model output")?;
        anyhow::ensure!(
            scores.len() == self.codes.len(),
            "model produced {} scores for {} codes",
            scores.len(),
            self.codes.len()
        );

        // The model emits logits; squash to [0, 1] before ranking.
        let mut pairs: Vec<Prediction> = scores
            .iter()
            .zip(self.codes.iter())
            .map(|(&logit, code)| (code.clone(), sigmoid(logit)))
            .collect();
        pairs.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        pairs.truncate(self.top_k);
        Ok(pairs)
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sigmoid_maps_logits_into_unit_interval() {
        assert!(sigmoid(-20.0) < 1e-6);
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-6);
        assert!(sigmoid(20.0) > 1.0 - 1e-6);
    }
}
