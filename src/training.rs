//! The training loop and held-out evaluation.

use log::{debug, info};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::backend::ComputeBackend;
use crate::dataset::{MnistSubset, Split};
use crate::errors::{RuntimeError, RuntimeResult};
use crate::inference::argmax;
use crate::layout::KernelRole;
use crate::runtime::KernelRuntime;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub epochs: usize,
    pub learning_rate: f32,
    /// Stop as soon as the running average loss drops to this value.
    pub loss_threshold: Option<f32>,
    /// Shuffle the train split every epoch with this seed; fixed order when
    /// absent.
    pub shuffle_seed: Option<u64>,
    /// Samples between progress reports.
    pub progress_interval: usize,
    /// Upper bound on test samples evaluated after training.
    pub max_eval_samples: usize,
    /// Run the parameter-init kernel before the first epoch.
    pub reset_parameters: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 3,
            learning_rate: 0.01,
            loss_threshold: None,
            shuffle_seed: None,
            progress_interval: 100,
            max_eval_samples: 300,
            reset_parameters: true,
        }
    }
}

/// Running statistics reported during training.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingProgress {
    /// Zero-based epoch index.
    pub epoch: usize,
    pub epochs: usize,
    /// One-based number of samples processed this epoch.
    pub sample: usize,
    pub samples: usize,
    pub average_loss: f32,
    pub accuracy: f32,
}

impl std::fmt::Display for TrainingProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "epoch {}/{} sample {}/{} loss {:.5} acc {:.2}%",
            self.epoch + 1,
            self.epochs,
            self.sample,
            self.samples,
            self.average_loss,
            self.accuracy * 100.0
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSummary {
    /// Epochs run, including one interrupted by the loss threshold.
    pub epochs_completed: usize,
    pub final_loss: f32,
    pub final_accuracy: f32,
    pub test_accuracy: f32,
    pub stopped_by_loss_threshold: bool,
}

impl std::fmt::Display for TrainingSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "done: epochs={} loss={:.5} train_acc={:.2}% test_acc={:.2}%",
            self.epochs_completed,
            self.final_loss,
            self.final_accuracy * 100.0,
            self.test_accuracy * 100.0
        )?;
        if self.stopped_by_loss_threshold {
            write!(f, " (stopped by loss threshold)")?;
        }
        Ok(())
    }
}

/// Callback receiving progress snapshots on the training thread.
pub type ProgressCallback<'a> = &'a mut dyn FnMut(&TrainingProgress);

impl<B: ComputeBackend> KernelRuntime<B> {
    fn check_image_size(&self, dataset: &MnistSubset) -> RuntimeResult<()> {
        if dataset.image_size() != self.image_size() {
            return Err(RuntimeError::ImageSizeMismatch {
                field: self.layout().input_name().to_string(),
                dataset: dataset.image_size(),
                field_elements: self.image_size(),
            });
        }
        Ok(())
    }

    /// Trains on the train split and evaluates on the test split.
    pub fn train(
        &mut self,
        dataset: &MnistSubset,
        config: &TrainConfig,
        mut on_progress: Option<ProgressCallback<'_>>,
    ) -> RuntimeResult<TrainingSummary> {
        self.check_image_size(dataset)?;
        let samples = dataset.train_count();
        if samples == 0 {
            return Err(RuntimeError::EmptySplit {
                split: Split::Train.to_string(),
            });
        }

        if config.reset_parameters {
            self.initialize_parameters(None)?;
        }

        let interval = config.progress_interval.max(1);
        let mut order: Vec<usize> = (0..samples).collect();
        let mut rng = config.shuffle_seed.map(StdRng::seed_from_u64);

        let mut epochs_completed = 0;
        let mut final_loss = 0.0;
        let mut final_accuracy = 0.0;
        let mut stopped = false;

        info!(
            "training {} epochs over {} samples, lr {}",
            config.epochs, samples, config.learning_rate
        );

        'epochs: for epoch in 0..config.epochs {
            if let Some(rng) = rng.as_mut() {
                order.shuffle(rng);
            }
            epochs_completed = epoch + 1;
            let mut loss_sum = 0.0f64;
            let mut correct = 0usize;

            for (step, &index) in order.iter().enumerate() {
                let (image, label) = dataset.train_sample(index)?;
                self.write_sample(image, label)?;
                self.dispatch_sequence(&[
                    (KernelRole::Forward, None),
                    (KernelRole::Backward, None),
                    (KernelRole::ApplyGrad, Some(config.learning_rate)),
                ])?;

                loss_sum += f64::from(self.read_loss()?);
                if argmax(&self.read_logits()?) == Some(usize::from(label)) {
                    correct += 1;
                }

                let seen = step + 1;
                if seen % interval == 0 || seen == samples {
                    let progress = TrainingProgress {
                        epoch,
                        epochs: config.epochs,
                        sample: seen,
                        samples,
                        average_loss: (loss_sum / seen as f64) as f32,
                        accuracy: correct as f32 / seen as f32,
                    };
                    debug!("{progress}");
                    final_loss = progress.average_loss;
                    final_accuracy = progress.accuracy;
                    if let Some(callback) = on_progress.as_deref_mut() {
                        callback(&progress);
                    }
                    if config
                        .loss_threshold
                        .is_some_and(|threshold| progress.average_loss <= threshold)
                    {
                        stopped = true;
                        break 'epochs;
                    }
                }
            }
        }

        let test_accuracy = self.evaluate(dataset, config.max_eval_samples)?;
        let summary = TrainingSummary {
            epochs_completed,
            final_loss,
            final_accuracy,
            test_accuracy,
            stopped_by_loss_threshold: stopped,
        };
        info!("{summary}");
        Ok(summary)
    }

    /// Accuracy over the first `min(test_count, limit)` test samples using
    /// forward passes only. Returns zero when nothing is evaluated.
    pub fn evaluate(&mut self, dataset: &MnistSubset, limit: usize) -> RuntimeResult<f32> {
        self.check_image_size(dataset)?;
        let count = dataset.test_count().min(limit);
        if count == 0 {
            return Ok(0.0);
        }

        let mut correct = 0usize;
        for index in 0..count {
            let (image, label) = dataset.test_sample(index)?;
            self.write_sample(image, label)?;
            self.dispatch_role(KernelRole::Forward, None)?;
            if argmax(&self.read_logits()?) == Some(usize::from(label)) {
                correct += 1;
            }
        }
        Ok(correct as f32 / count as f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HostBackend;
    use crate::reference_kernels::ReferenceModel;

    fn setup(image_size: usize) -> (KernelRuntime<HostBackend>, MnistSubset) {
        let model = ReferenceModel::new(image_size, 10);
        let runtime = KernelRuntime::with_defaults(model.metadata(), model.backend()).unwrap();
        let dataset = MnistSubset::new(
            image_size,
            vec![0.5; image_size * 5],
            vec![0, 1, 2, 3, 4],
            vec![0.5; image_size * 2],
            vec![0, 1],
        )
        .unwrap();
        (runtime, dataset)
    }

    #[test]
    fn test_progress_cadence() {
        let (mut runtime, dataset) = setup(4);
        let config = TrainConfig {
            epochs: 2,
            progress_interval: 2,
            ..TrainConfig::default()
        };
        let mut seen = Vec::new();
        let mut record = |p: &TrainingProgress| seen.push((p.epoch, p.sample));
        runtime.train(&dataset, &config, Some(&mut record)).unwrap();

        // every second sample plus the last one of each epoch
        assert_eq!(
            seen,
            vec![(0, 2), (0, 4), (0, 5), (1, 2), (1, 4), (1, 5)]
        );
    }

    #[test]
    fn test_image_size_mismatch() {
        let (mut runtime, _) = setup(4);
        let (_, other) = setup(3);
        let result = runtime.train(&other, &TrainConfig::default(), None);
        assert!(matches!(
            result,
            Err(RuntimeError::ImageSizeMismatch {
                dataset: 3,
                field_elements: 4,
                ..
            })
        ));
    }

    #[test]
    fn test_evaluate_limit() {
        let (mut runtime, dataset) = setup(4);
        runtime.initialize_parameters(None).unwrap();
        let before = runtime.backend().launches().len();
        runtime.evaluate(&dataset, 1).unwrap();
        let forward_tasks = runtime.kernels().get(KernelRole::Forward).tasks.len();
        assert_eq!(runtime.backend().launches().len() - before, forward_tasks);
        assert_eq!(runtime.evaluate(&dataset, 0).unwrap(), 0.0);
    }

    #[test]
    fn test_shuffled_training_is_reproducible() {
        let config = TrainConfig {
            epochs: 2,
            shuffle_seed: Some(9),
            ..TrainConfig::default()
        };
        let (mut a, dataset) = setup(4);
        let (mut b, _) = setup(4);
        let first = a.train(&dataset, &config, None).unwrap();
        let second = b.train(&dataset, &config, None).unwrap();
        assert_eq!(first, second);
        assert_eq!(a.backend().arena(), b.backend().arena());
    }
}
