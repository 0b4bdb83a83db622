//! Single-sample inference and the softmax helpers it relies on.

use log::debug;
use rand::Rng;

use crate::backend::ComputeBackend;
use crate::dataset::{MnistSubset, Split};
use crate::errors::{RuntimeError, RuntimeResult};
use crate::layout::KernelRole;
use crate::runtime::KernelRuntime;

#[derive(Debug, Clone, PartialEq)]
pub struct InferenceResult {
    /// Index of the sample in the test split.
    pub index: usize,
    /// Pixel intensities of the sample, row-major.
    pub image: Vec<f32>,
    pub true_label: u8,
    pub predicted_label: usize,
    /// Softmax probability of the predicted class.
    pub confidence: f32,
    pub logits: Vec<f32>,
}

impl InferenceResult {
    pub fn is_correct(&self) -> bool {
        self.predicted_label == usize::from(self.true_label)
    }
}

impl std::fmt::Display for InferenceResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "sample #{}: label={} pred={} conf={:.2}%",
            self.index,
            self.true_label,
            self.predicted_label,
            self.confidence * 100.0
        )
    }
}

/// Index of the largest value; the first one wins on ties. `None` when empty.
pub fn argmax(values: &[f32]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f32)>, (i, &v)| match best {
            Some((_, b)) if v <= b => best,
            _ => Some((i, v)),
        })
        .map(|(i, _)| i)
}

/// Softmax of `logits` using max subtraction for stability.
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Softmax probability of class `index`. Zero when `index` is out of range.
pub fn softmax_confidence(logits: &[f32], index: usize) -> f32 {
    if index >= logits.len() {
        return 0.0;
    }
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let sum: f32 = logits.iter().map(|l| (l - max).exp()).sum();
    (logits[index] - max).exp() / sum
}

impl<B: ComputeBackend> KernelRuntime<B> {
    /// Runs the forward kernel on one test sample.
    pub fn infer(&mut self, dataset: &MnistSubset, test_index: usize) -> RuntimeResult<InferenceResult> {
        let (image, label) = dataset.test_sample(test_index)?;
        self.write_sample(image, label)?;
        self.dispatch_role(KernelRole::Forward, None)?;

        let logits = self.read_logits()?;
        let predicted_label = argmax(&logits).unwrap_or_default();
        let result = InferenceResult {
            index: test_index,
            image: image.to_vec(),
            true_label: label,
            predicted_label,
            confidence: softmax_confidence(&logits, predicted_label),
            logits,
        };
        debug!("{result}");
        Ok(result)
    }

    /// Runs inference on a test sample drawn uniformly at random.
    pub fn infer_random<R: Rng + ?Sized>(
        &mut self,
        dataset: &MnistSubset,
        rng: &mut R,
    ) -> RuntimeResult<InferenceResult> {
        let count = dataset.test_count();
        if count == 0 {
            return Err(RuntimeError::EmptySplit {
                split: Split::Test.to_string(),
            });
        }
        self.infer(dataset, rng.gen_range(0..count))
    }
}
