//! Tests for error types raised while building and driving the runtime.

use aot_mnist::errors::{
    BundleError, ConfigError, DatasetError, RuntimeError, SessionError,
};
use aot_mnist::gpu::GpuError;
use aot_mnist::metadata::{AotMetadata, BufferBind, BufferKind};
use aot_mnist::reference_kernels::ReferenceModel;
use aot_mnist::{ConfigLoader, KernelRuntime, MnistSubset};

#[cfg(test)]
mod runtime_error_tests {
    use super::*;

    #[test]
    fn test_missing_kernel_is_reported_by_name() {
        let model = ReferenceModel::new(4, 10);
        let mut metadata = model.metadata();
        metadata.kernels.retain(|kernel| kernel.name != "mnist_backward");

        let result = KernelRuntime::with_defaults(metadata, model.backend());
        assert!(matches!(
            result,
            Err(RuntimeError::MissingKernel { name }) if name == "mnist_backward"
        ));
    }

    #[test]
    fn test_field_beyond_arena_is_rejected() {
        let model = ReferenceModel::new(4, 10);
        let mut metadata = model.metadata();
        metadata.root_buffer_size -= 4;

        let result = KernelRuntime::with_defaults(metadata, model.backend());
        assert!(matches!(
            result,
            Err(RuntimeError::FieldOutsideArena { name, .. }) if name == "loss"
        ));
    }

    #[test]
    fn test_malformed_field_extents_are_errors() {
        let model = ReferenceModel::new(4, 10);

        let mut metadata = model.metadata();
        metadata.fields[0].shape = vec![4294967296, 4294967296];
        let result = KernelRuntime::with_defaults(metadata, model.backend());
        assert!(matches!(
            result,
            Err(RuntimeError::FieldSizeOverflow { name, .. }) if name == "x"
        ));

        let mut metadata = model.metadata();
        metadata.fields[0].mem_offset_in_parent = usize::MAX;
        let result = KernelRuntime::with_defaults(metadata, model.backend());
        assert!(matches!(
            result,
            Err(RuntimeError::FieldOutsideArena { name, end: usize::MAX, .. }) if name == "x"
        ));
    }

    #[test]
    fn test_unsupported_binding_is_rejected_at_load() {
        let model = ReferenceModel::new(4, 10);
        let mut metadata = model.metadata();
        metadata.kernels[0].tasks[0]
            .buffer_binds
            .push(BufferBind::new(2, BufferKind::Other(7)));

        let result = KernelRuntime::with_defaults(metadata, model.backend());
        assert!(matches!(
            result,
            Err(RuntimeError::UnsupportedBufferBinding { kind: 7, .. })
        ));
    }

    #[test]
    fn test_metadata_without_arena_size() {
        let result = AotMetadata::from_json(r#"{"fields": [], "kernels": []}"#);
        assert!(matches!(result, Err(RuntimeError::MetadataParse { .. })));
    }
}

#[cfg(test)]
mod dataset_error_tests {
    use super::*;

    #[test]
    fn test_mismatched_pixels_and_labels() {
        let result = MnistSubset::new(4, vec![0.0; 7], vec![1, 2], vec![], vec![]);
        assert!(matches!(result, Err(DatasetError::InvalidFormat { .. })));
    }

    #[test]
    fn test_label_outside_classes() {
        let result = MnistSubset::new(1, vec![0.0], vec![0], vec![0.0], vec![12]);
        assert!(matches!(
            result,
            Err(DatasetError::LabelOutOfRange { label: 12, index: 0, .. })
        ));
    }
}

#[cfg(test)]
mod error_display_tests {
    use super::*;

    #[test]
    fn test_basic_error_displays() {
        assert_eq!(SessionError::Busy.to_string(), "A run is already in progress");
        assert_eq!(
            RuntimeError::ArenaNotAllocated.to_string(),
            "Arena has not been allocated"
        );
        assert_eq!(
            BundleError::EmptyTranslator.to_string(),
            "Translator command template is empty"
        );
    }

    #[test]
    fn test_complex_error_displays() {
        let error = RuntimeError::FieldOverflow {
            offset: 16,
            capacity: 4,
            actual: 8,
        };
        assert_eq!(
            error.to_string(),
            "Write of 8 bytes exceeds the 4 byte extent of the field at offset 16"
        );

        let error = RuntimeError::ImageSizeMismatch {
            field: "x".to_string(),
            dataset: 3,
            field_elements: 784,
        };
        assert_eq!(
            error.to_string(),
            "Dataset images have 3 elements but field 'x' holds 784"
        );

        let error = DatasetError::IndexOutOfBounds {
            split: "test".to_string(),
            index: 5,
            count: 2,
        };
        assert_eq!(
            error.to_string(),
            "Index 5 is out of bounds for the test split of 2 samples"
        );
    }

    #[test]
    fn test_wrapped_errors_are_transparent() {
        let gpu = GpuError::MissingShader {
            task: "mnist_forward_t00".to_string(),
            path: "bundle/mnist_forward_t00.spv".to_string(),
        };
        let message = gpu.to_string();
        let runtime = RuntimeError::from(gpu);
        assert_eq!(runtime.to_string(), message);

        let session = SessionError::from(RuntimeError::EmptySplit {
            split: "train".to_string(),
        });
        assert_eq!(session.to_string(), "The train split is empty");
    }

    #[test]
    fn test_config_parse_error_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aot_mnist.json");
        std::fs::write(&path, "{ not json").unwrap();

        let error = ConfigLoader::load_runtime_config(&path).unwrap_err();
        assert!(matches!(error, ConfigError::ConfigParseError { .. }));
        assert!(error.to_string().contains("aot_mnist.json"));
    }
}
