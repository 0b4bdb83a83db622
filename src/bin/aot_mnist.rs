//! Command line front-end: bundle exported shaders, prepare the dataset,
//! train and run inference.
//!
//! Usage:
//!   aot-mnist bundle-shaders --aot-dir build/aot_mnist --out-dir build/shaders
//!   aot-mnist prepare-dataset --idx-dir .cache/mnist --output data/mnist_subset.bin
//!   aot-mnist inspect build/shaders/metadata.json
//!   aot-mnist train --epochs 3 --learning-rate 0.01
//!   aot-mnist --backend host infer --ascii
//!   aot-mnist grad-check --size 16 --base 0.25

use std::path::PathBuf;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use log::{error, info, warn};
use thiserror::Error;

use aot_mnist::autodiff::{DEFAULT_BASE, DEFAULT_SIZE, GRADIENT_TOLERANCE};
use aot_mnist::backend::ComputeBackend;
use aot_mnist::dataset::idx::{PrepareOptions, prepare_subset};
use aot_mnist::errors::{BundleError, ConfigError, DatasetError, RuntimeError, SessionError};
use aot_mnist::reference_kernels::NUM_CLASSES;
use aot_mnist::render::{ascii_preview, save_png, square_side};
use aot_mnist::session::RunHandle;
use aot_mnist::shader_bundle::{BundleOptions, bundle_shaders};
use aot_mnist::{
    AotMetadata, AutodiffReference, ConfigLoader, FieldNames, GradientCheck, Hyperparameters,
    KernelRuntime, MnistSubset, ReferenceModel, RuntimeConfig, SessionEvent, TrainingSession,
    WgpuBackend,
};

#[derive(Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error(transparent)]
    Bundle(#[from] BundleError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("Gradient error {error:.3e} exceeds the tolerance {tolerance:.0e}")]
    GradientMismatch { error: f32, tolerance: f32 },
}

type CliResult<T> = Result<T, CliError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BackendKind {
    /// Exported SPIR-V on the GPU
    Gpu,
    /// Built-in CPU kernels, no shader bundle needed
    Host,
}

/// Train and evaluate an MNIST classifier from compiler-exported kernels
#[derive(Parser)]
#[command(name = "aot-mnist")]
#[command(version)]
#[command(about = "Run compiler-exported SPIR-V kernels to train an MNIST classifier")]
struct Cli {
    /// Runtime configuration file
    #[arg(long, default_value = "aot_mnist.json")]
    config: PathBuf,

    /// Compute backend
    #[arg(long, value_enum, default_value = "gpu")]
    backend: BackendKind,

    /// Shader bundle directory (overrides the config)
    #[arg(long)]
    shader_dir: Option<PathBuf>,

    /// Dataset container (overrides the config)
    #[arg(long)]
    dataset: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate and bundle exported .spv files with a manifest
    BundleShaders {
        #[arg(long)]
        aot_dir: Option<PathBuf>,

        #[arg(long)]
        out_dir: Option<PathBuf>,

        /// Translator command with {input} and {output} placeholders
        #[arg(long)]
        translator: Option<String>,

        /// Extension of translated outputs
        #[arg(long, default_value = "metal")]
        extension: String,

        /// Name translated outputs after their kernel instead of the task
        #[arg(long)]
        merge_by_kernel: bool,
    },

    /// Cut a subset container from MNIST IDX files already on disk
    ///
    /// Nothing is downloaded: place train-images-idx3-ubyte,
    /// train-labels-idx1-ubyte, t10k-images-idx3-ubyte and
    /// t10k-labels-idx1-ubyte (optionally with a .gz suffix) in --idx-dir
    /// first.
    PrepareDataset {
        /// Directory holding the four IDX files (optionally gzipped); they
        /// must already be present
        #[arg(long, default_value = ".cache/mnist")]
        idx_dir: PathBuf,

        #[arg(long)]
        output: Option<PathBuf>,

        #[arg(long, default_value_t = 2000)]
        train_count: usize,

        #[arg(long, default_value_t = 400)]
        test_count: usize,

        #[arg(long, default_value_t = 42)]
        seed: u64,
    },

    /// Print the fields and kernels described by a metadata file
    Inspect {
        metadata: Option<PathBuf>,
    },

    /// Train on the dataset and report held-out accuracy
    Train {
        #[arg(long, allow_negative_numbers = true)]
        epochs: Option<i64>,

        #[arg(long, allow_negative_numbers = true)]
        learning_rate: Option<f32>,

        #[arg(long, allow_negative_numbers = true)]
        loss_threshold: Option<f32>,

        /// Shuffle the train split each epoch with this seed
        #[arg(long)]
        shuffle_seed: Option<u64>,

        /// Run inference on one random test sample afterwards
        #[arg(long)]
        infer: bool,
    },

    /// Classify one test sample
    Infer {
        /// Test index; random when omitted
        #[arg(long)]
        index: Option<usize>,

        /// Train this many epochs first
        #[arg(long, default_value_t = 1)]
        epochs: i64,

        /// Write the sample as a PNG
        #[arg(long)]
        png: Option<PathBuf>,

        /// Print the sample as text
        #[arg(long)]
        ascii: bool,
    },

    /// Check the autodiff kernels against the analytic gradient of sum(x^2)
    GradCheck {
        /// Elements in x for the host kernels; a GPU bundle fixes it at export
        #[arg(long, default_value_t = DEFAULT_SIZE)]
        size: usize,

        /// Initial value of x[0]; x[i] = base + 0.01 * i
        #[arg(long, default_value_t = DEFAULT_BASE, allow_negative_numbers = true)]
        base: f32,

        /// Autodiff bundle directory (overrides the config)
        #[arg(long)]
        bundle: Option<PathBuf>,
    },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> CliResult<()> {
    let mut config = ConfigLoader::load_runtime_config(&cli.config)?;
    if let Some(dir) = cli.shader_dir {
        config.shader_dir = dir;
    }
    if let Some(path) = cli.dataset {
        config.dataset_path = path;
    }

    match cli.command {
        Commands::BundleShaders {
            aot_dir,
            out_dir,
            translator,
            extension,
            merge_by_kernel,
        } => {
            let aot_dir = aot_dir.unwrap_or_else(|| config.aot_dir.clone());
            let out_dir = out_dir.unwrap_or_else(|| config.shader_dir.clone());
            let options = BundleOptions {
                translator,
                translated_extension: extension,
                preserve_task_names: !merge_by_kernel,
            };
            let manifest = bundle_shaders(&aot_dir, &out_dir, &options)?;
            for entry in &manifest {
                println!("{} <- {} ({})", entry.output, entry.task, entry.kernel);
            }
            println!("bundled {} shaders into {}", manifest.len(), out_dir.display());
        }
        Commands::PrepareDataset {
            idx_dir,
            output,
            train_count,
            test_count,
            seed,
        } => {
            let output = output.unwrap_or_else(|| config.dataset_path.clone());
            let options = PrepareOptions {
                train_count,
                test_count,
                seed,
            };
            let dataset = prepare_subset(&idx_dir, &options)?;
            dataset.save(&output)?;
            println!("wrote subset binary: {}", output.display());
            println!(
                "train={} test={} image_size={}",
                dataset.train_count(),
                dataset.test_count(),
                dataset.image_size()
            );
        }
        Commands::Inspect { metadata } => {
            let path = metadata.unwrap_or_else(|| config.metadata_path());
            inspect(&AotMetadata::load(path)?);
        }
        Commands::Train {
            epochs,
            learning_rate,
            loss_threshold,
            shuffle_seed,
            infer,
        } => {
            let params = Hyperparameters::new()
                .with_epochs(epochs.unwrap_or(config.training.epochs as i64))
                .with_learning_rate(learning_rate.unwrap_or(config.training.learning_rate))
                .with_loss_threshold(loss_threshold.or(config.training.loss_threshold));
            config.training.shuffle_seed = shuffle_seed.or(config.training.shuffle_seed);
            let job = Job::Train { params, infer };
            with_runtime(cli.backend, &config, job)?;
        }
        Commands::Infer {
            index,
            epochs,
            png,
            ascii,
        } => {
            let job = Job::Infer {
                index,
                epochs,
                png,
                ascii,
            };
            with_runtime(cli.backend, &config, job)?;
        }
        Commands::GradCheck { size, base, bundle } => {
            if let Some(dir) = bundle {
                config.autodiff_dir = dir;
            }
            let check = gradient_check(cli.backend, &config, size, base)?;
            println!("{check}");
            if !check.passed(GRADIENT_TOLERANCE) {
                return Err(CliError::GradientMismatch {
                    error: check.max_abs_error,
                    tolerance: GRADIENT_TOLERANCE,
                });
            }
            println!("gradient check passed");
        }
    }
    Ok(())
}

fn gradient_check(
    kind: BackendKind,
    config: &RuntimeConfig,
    size: usize,
    base: f32,
) -> CliResult<GradientCheck> {
    let names = &config.autodiff;
    let check = match kind {
        BackendKind::Gpu => {
            let metadata = AotMetadata::load(config.autodiff_metadata_path())?;
            let backend = WgpuBackend::new(&config.autodiff_dir).map_err(RuntimeError::from)?;
            info!("using GPU adapter {}", backend.adapter_info().name);
            let mut runtime = KernelRuntime::autodiff(metadata, backend, names)?;
            if runtime.program().size() != size {
                warn!(
                    "bundle exports {} elements, ignoring --size {}",
                    runtime.program().size(),
                    size
                );
            }
            runtime.gradient_check(base)?
        }
        BackendKind::Host => {
            let reference = AutodiffReference::new(size);
            let mut runtime = KernelRuntime::autodiff(
                reference.metadata_with(names),
                reference.backend_with(names),
                names,
            )?;
            runtime.gradient_check(base)?
        }
    };
    Ok(check)
}

fn inspect(metadata: &AotMetadata) {
    println!("arena: {} bytes", metadata.root_buffer_size);
    println!("fields:");
    for field in &metadata.fields {
        let size = field
            .byte_len()
            .map_or_else(|| "overflowing".to_string(), |len| len.to_string());
        println!(
            "  {:<10} offset {:>8} shape {:?} ({} bytes)",
            field.field_name, field.mem_offset_in_parent, field.shape, size
        );
    }
    println!("kernels:");
    for kernel in &metadata.kernels {
        println!("  {}", kernel.name);
        for task in &kernel.tasks {
            let binds: Vec<String> = task
                .buffer_binds
                .iter()
                .map(|bind| format!("{}:{:?}", bind.binding, bind.buffer.kind))
                .collect();
            println!(
                "    {} threads={} per_group={} binds=[{}]",
                task.name,
                task.advisory_total_num_threads,
                task.advisory_num_threads_per_group,
                binds.join(", ")
            );
        }
    }
}

enum Job {
    Train {
        params: Hyperparameters,
        infer: bool,
    },
    Infer {
        index: Option<usize>,
        epochs: i64,
        png: Option<PathBuf>,
        ascii: bool,
    },
}

fn with_runtime(kind: BackendKind, config: &RuntimeConfig, job: Job) -> CliResult<()> {
    let dataset = MnistSubset::load(&config.dataset_path)?;
    match kind {
        BackendKind::Gpu => {
            let metadata = AotMetadata::load(config.metadata_path())?;
            let backend = WgpuBackend::new(&config.shader_dir).map_err(RuntimeError::from)?;
            info!("using GPU adapter {}", backend.adapter_info().name);
            let runtime = KernelRuntime::new(metadata, backend, &config.kernels, &config.fields)?;
            run_job(runtime, dataset, config, job)
        }
        BackendKind::Host => {
            let model = ReferenceModel::new(dataset.image_size(), NUM_CLASSES);
            let runtime = KernelRuntime::new(
                model.metadata_with(&config.kernels),
                model.backend_with(&config.kernels),
                &config.kernels,
                &FieldNames::default(),
            )?;
            run_job(runtime, dataset, config, job)
        }
    }
}

/// Prints session events until the worker behind `handle` finishes.
fn follow<T>(events: &Receiver<SessionEvent>, handle: RunHandle<T>) -> CliResult<T> {
    loop {
        match events.recv_timeout(Duration::from_millis(100)) {
            Ok(event) => report(&event),
            Err(RecvTimeoutError::Timeout) if !handle.is_finished() => {}
            Err(_) => break,
        }
    }
    events.try_iter().for_each(|event| report(&event));
    Ok(handle.join()?)
}

fn report(event: &SessionEvent) {
    match event {
        SessionEvent::Failed(_) => {}
        other => println!("{other}"),
    }
}

fn run_job<B: ComputeBackend + 'static>(
    runtime: KernelRuntime<B>,
    dataset: MnistSubset,
    config: &RuntimeConfig,
    job: Job,
) -> CliResult<()> {
    let (session, events) = TrainingSession::new(runtime, dataset);
    let session = session.with_train_config(config.training.clone());

    match job {
        Job::Train { params, infer } => {
            follow(&events, session.start_training(&params)?)?;
            if infer {
                follow(&events, session.start_inference(None)?)?;
            }
        }
        Job::Infer {
            index,
            epochs,
            png,
            ascii,
        } => {
            if epochs > 0 {
                let params = Hyperparameters::new()
                    .with_epochs(epochs)
                    .with_learning_rate(config.training.learning_rate);
                follow(&events, session.start_training(&params)?)?;
            }
            let result = follow(&events, session.start_inference(index)?)?;
            let width = square_side(result.image.len()).unwrap_or(result.image.len().max(1));
            if ascii {
                print!("{}", ascii_preview(&result.image, width)?);
            }
            if let Some(path) = png {
                save_png(&result.image, width, &path)?;
                println!("wrote {}", path.display());
            }
        }
    }
    Ok(())
}
