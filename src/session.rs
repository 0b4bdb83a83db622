//! Background training and inference for interactive front-ends.
//!
//! A [`TrainingSession`] owns the runtime and the dataset. Each action runs
//! on its own worker thread and reports through a channel of
//! [`SessionEvent`]s whose `Display` output is ready to show to a user.
//! Only one action may run at a time; a second request while one is active
//! is rejected with [`SessionError::Busy`]. The session is idle again by the
//! time the final `Finished`, `Inference` or `Failed` event is delivered.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use log::{info, warn};

use crate::backend::ComputeBackend;
use crate::dataset::MnistSubset;
use crate::errors::{SessionError, SessionResult};
use crate::inference::InferenceResult;
use crate::runtime::KernelRuntime;
use crate::training::{TrainConfig, TrainingProgress, TrainingSummary};

pub const MIN_LEARNING_RATE: f32 = 1e-6;
pub const MAX_ADVISED_EPOCHS: i64 = 50;

/// User-editable training parameters, as entered.
#[derive(Debug, Clone, PartialEq)]
pub struct Hyperparameters {
    pub epochs: i64,
    pub learning_rate: f32,
    pub loss_threshold: Option<f32>,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Self {
            epochs: 3,
            learning_rate: 0.01,
            loss_threshold: None,
        }
    }
}

impl Hyperparameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_epochs(mut self, epochs: i64) -> Self {
        self.epochs = epochs;
        self
    }

    pub fn with_learning_rate(mut self, learning_rate: f32) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    pub fn with_loss_threshold(mut self, loss_threshold: Option<f32>) -> Self {
        self.loss_threshold = loss_threshold;
        self
    }

    /// Warnings about questionable values. They never block a run.
    pub fn advisories(&self) -> Vec<String> {
        let mut advisories = Vec::new();
        if self.epochs < 1 {
            advisories.push(format!("epochs {} is below 1; 1 will be used", self.epochs));
        } else if self.epochs > MAX_ADVISED_EPOCHS {
            advisories.push(format!(
                "epochs {} is above {MAX_ADVISED_EPOCHS}; training may take a long time",
                self.epochs
            ));
        }
        if !(self.learning_rate > 0.0 && self.learning_rate <= 1.0) {
            advisories.push(format!(
                "learning rate {} is outside (0, 1]",
                self.learning_rate
            ));
        }
        if let Some(threshold) = self.loss_threshold {
            if !(threshold > 0.0) {
                advisories.push(format!("loss threshold {threshold} is not positive and is ignored"));
            }
        }
        advisories
    }

    /// Values clamped to what the training loop accepts.
    pub fn clamped(&self) -> Hyperparameters {
        let learning_rate = if self.learning_rate.is_finite() {
            self.learning_rate.max(MIN_LEARNING_RATE)
        } else {
            MIN_LEARNING_RATE
        };
        Hyperparameters {
            epochs: self.epochs.max(1),
            learning_rate,
            loss_threshold: self
                .loss_threshold
                .filter(|threshold| threshold.is_finite() && *threshold > 0.0),
        }
    }

    /// Applies the clamped values on top of `base`.
    pub fn to_train_config(&self, base: &TrainConfig) -> TrainConfig {
        let clamped = self.clamped();
        TrainConfig {
            epochs: usize::try_from(clamped.epochs).unwrap_or(usize::MAX),
            learning_rate: clamped.learning_rate,
            loss_threshold: clamped.loss_threshold,
            ..base.clone()
        }
    }
}

/// Message from a background worker.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Advisory(String),
    Progress(TrainingProgress),
    Finished(TrainingSummary),
    Inference(InferenceResult),
    Failed(String),
}

impl std::fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionEvent::Advisory(message) => write!(f, "warning: {message}"),
            SessionEvent::Progress(progress) => progress.fmt(f),
            SessionEvent::Finished(summary) => summary.fmt(f),
            SessionEvent::Inference(result) => result.fmt(f),
            SessionEvent::Failed(message) => write!(f, "error: {message}"),
        }
    }
}

/// Clears the running flag when the worker finishes, even on panic.
struct RunGuard {
    running: Arc<AtomicBool>,
}

impl RunGuard {
    fn acquire(running: &Arc<AtomicBool>) -> SessionResult<Self> {
        running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| SessionError::Busy)?;
        Ok(Self {
            running: Arc::clone(running),
        })
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Handle to a background run.
pub struct RunHandle<T> {
    handle: JoinHandle<SessionResult<T>>,
}

impl<T> RunHandle<T> {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the worker and returns its result.
    pub fn join(self) -> SessionResult<T> {
        self.handle
            .join()
            .map_err(|_| SessionError::ThreadPanicked)?
    }
}

pub struct TrainingSession<B: ComputeBackend + 'static> {
    runtime: Arc<Mutex<KernelRuntime<B>>>,
    dataset: Arc<MnistSubset>,
    running: Arc<AtomicBool>,
    events: Sender<SessionEvent>,
    base_config: TrainConfig,
}

impl<B: ComputeBackend + 'static> TrainingSession<B> {
    /// Creates a session and the receiving end of its event channel.
    pub fn new(runtime: KernelRuntime<B>, dataset: MnistSubset) -> (Self, Receiver<SessionEvent>) {
        let (events, receiver) = mpsc::channel();
        let session = Self {
            runtime: Arc::new(Mutex::new(runtime)),
            dataset: Arc::new(dataset),
            running: Arc::new(AtomicBool::new(false)),
            events,
            base_config: TrainConfig::default(),
        };
        (session, receiver)
    }

    /// Sets the settings hyperparameters do not cover.
    pub fn with_train_config(mut self, config: TrainConfig) -> Self {
        self.base_config = config;
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn dataset(&self) -> &MnistSubset {
        &self.dataset
    }

    /// Runs `job` on a worker thread. `finished` maps a successful result to
    /// the final event.
    fn spawn<T, F>(&self, job: F, finished: fn(T) -> SessionEvent) -> SessionResult<RunHandle<T>>
    where
        T: Clone + Send + 'static,
        F: FnOnce(&mut KernelRuntime<B>, &MnistSubset, &Sender<SessionEvent>) -> SessionResult<T>
            + Send
            + 'static,
    {
        let guard = RunGuard::acquire(&self.running)?;
        let runtime = Arc::clone(&self.runtime);
        let dataset = Arc::clone(&self.dataset);
        let events = self.events.clone();

        let handle = thread::spawn(move || {
            let result = {
                let _guard = guard;
                match runtime.lock() {
                    Ok(mut runtime) => job(&mut runtime, &dataset, &events),
                    Err(_) => Err(SessionError::Poisoned),
                }
            };
            // Lock and run guard are released here.
            let event = match &result {
                Ok(value) => finished(value.clone()),
                Err(err) => SessionEvent::Failed(err.to_string()),
            };
            let _ = events.send(event);
            result
        });
        Ok(RunHandle { handle })
    }

    /// Starts training in the background.
    pub fn start_training(&self, params: &Hyperparameters) -> SessionResult<RunHandle<TrainingSummary>> {
        let advisories = params.advisories();
        let config = params.to_train_config(&self.base_config);

        self.spawn(
            move |runtime, dataset, events| {
                for advisory in advisories {
                    warn!("{advisory}");
                    let _ = events.send(SessionEvent::Advisory(advisory));
                }
                info!(
                    "background training: epochs={} lr={}",
                    config.epochs, config.learning_rate
                );

                let mut forward = |progress: &TrainingProgress| {
                    let _ = events.send(SessionEvent::Progress(progress.clone()));
                };
                Ok(runtime.train(dataset, &config, Some(&mut forward))?)
            },
            SessionEvent::Finished,
        )
    }

    /// Starts inference on `test_index`, or on a random test sample.
    pub fn start_inference(&self, test_index: Option<usize>) -> SessionResult<RunHandle<InferenceResult>> {
        self.spawn(
            move |runtime, dataset, _| {
                Ok(match test_index {
                    Some(index) => runtime.infer(dataset, index)?,
                    None => runtime.infer_random(dataset, &mut rand::thread_rng())?,
                })
            },
            SessionEvent::Inference,
        )
    }
}
