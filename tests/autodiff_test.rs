//! Tests for the autodiff gradient check on the host backend.

use aot_mnist::autodiff::{
    AutodiffProgram, DEFAULT_BASE, DEFAULT_SIZE, GRADIENT_TOLERANCE, expected_gradient,
};
use aot_mnist::backend::HostInvocation;
use aot_mnist::errors::RuntimeError;
use aot_mnist::reference_kernels::task_name;
use aot_mnist::{AutodiffNames, AutodiffReference, KernelRuntime};

fn runtime(size: usize) -> KernelRuntime<aot_mnist::HostBackend, AutodiffProgram> {
    let reference = AutodiffReference::new(size);
    KernelRuntime::autodiff(
        reference.metadata(),
        reference.backend(),
        &AutodiffNames::default(),
    )
    .unwrap()
}

#[cfg(test)]
mod gradient_check_tests {
    use super::*;

    #[test]
    fn test_default_export_passes() {
        let mut runtime = runtime(DEFAULT_SIZE);
        let check = runtime.gradient_check(DEFAULT_BASE).unwrap();

        assert_eq!(check.gradients.len(), DEFAULT_SIZE);
        assert!(
            check.passed(GRADIENT_TOLERANCE),
            "max abs error {}",
            check.max_abs_error
        );
        // sum over i of (0.25 + 0.01 i)^2 for i < 16
        let loss: f32 = (0..DEFAULT_SIZE)
            .map(|i| (0.25 + 0.01 * i as f32).powi(2))
            .sum();
        assert!((check.loss - loss).abs() < 1e-4);
    }

    #[test]
    fn test_kernels_are_dispatched_by_name_in_order() {
        let mut runtime = runtime(4);
        runtime.gradient_check(1.0).unwrap();

        let launched: Vec<_> = runtime
            .backend()
            .launches()
            .iter()
            .map(|launch| (launch.task.as_str(), launch.scalar))
            .collect();
        assert_eq!(
            launched,
            vec![
                ("init_x_t00", Some(1.0)),
                ("clear_loss_t00", None),
                ("forward_t00", None),
                ("backward_t00", None),
            ]
        );
    }

    #[test]
    fn test_repeated_checks_do_not_accumulate() {
        let mut runtime = runtime(8);
        runtime.gradient_check(0.5).unwrap();
        let check = runtime.gradient_check(-0.3).unwrap();
        assert_eq!(check.expected, expected_gradient(-0.3, 8));
        assert!(check.passed(GRADIENT_TOLERANCE));
    }

    #[test]
    fn test_wrong_backward_is_detected() {
        let reference = AutodiffReference::new(4);
        let mut backend = reference.backend();
        // Drops the factor of two.
        backend.register(task_name("backward", 0), |inv: &mut HostInvocation<'_>| {
            for i in 0..4 {
                let x = inv.load_f32(i * 4)?;
                inv.store_f32(16 + i * 4, x)?;
            }
            Ok(())
        });
        let mut runtime =
            KernelRuntime::autodiff(reference.metadata(), backend, &AutodiffNames::default())
                .unwrap();

        let check = runtime.gradient_check(DEFAULT_BASE).unwrap();
        assert!(!check.passed(GRADIENT_TOLERANCE));
        assert!((check.max_abs_error - 0.28).abs() < 1e-5);
    }

    #[test]
    fn test_unknown_kernel_name() {
        let mut runtime = runtime(4);
        let result = runtime.dispatch("mnist_forward", None);
        assert!(matches!(
            result,
            Err(RuntimeError::MissingKernel { name }) if name == "mnist_forward"
        ));
    }

    #[test]
    fn test_missing_gradient_field() {
        let reference = AutodiffReference::new(4);
        let mut metadata = reference.metadata();
        metadata.fields.retain(|field| field.field_name != "loss_grad");

        let result =
            KernelRuntime::autodiff(metadata, reference.backend(), &AutodiffNames::default());
        assert!(matches!(
            result,
            Err(RuntimeError::MissingField { name }) if name == "loss_grad"
        ));
    }
}
