//! Gradient check for the exported autodiff kernels.
//!
//! The autodiff export holds a vector field `x`, a scalar `loss` and their
//! gradient fields, plus four kernels: `init_x(base)` writes
//! `x[i] = base + 0.01 * i`, `clear_loss` zeroes the loss, `forward`
//! accumulates `loss += x[i]^2` and `backward` is its reverse-mode
//! derivative, accumulating `x_grad[i] += 2 * x[i] * loss_grad`. The check
//! drives them by name through the runtime, seeds `loss_grad = 1` and
//! compares `x_grad` against the analytic gradient `2 * x`.

use std::fmt;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::backend::ComputeBackend;
use crate::errors::{RuntimeError, RuntimeResult};
use crate::layout::{FieldSlot, KernelProgram, ResolvedKernel, check_disjoint};
use crate::metadata::AotMetadata;
use crate::runtime::KernelRuntime;

/// Step between consecutive initial values of `x`.
pub const INIT_STEP: f32 = 0.01;

/// Field size the exporter uses by default.
pub const DEFAULT_SIZE: usize = 16;

/// Base value the exporter uses by default.
pub const DEFAULT_BASE: f32 = 0.25;

/// Largest absolute gradient error a passing check may show.
pub const GRADIENT_TOLERANCE: f32 = 1e-5;

/// Names of the autodiff kernels and fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutodiffNames {
    pub init: String,
    pub clear_loss: String,
    pub forward: String,
    pub backward: String,
    pub x: String,
    pub loss: String,
    pub x_grad: String,
    pub loss_grad: String,
}

impl Default for AutodiffNames {
    fn default() -> Self {
        Self {
            init: "init_x".to_string(),
            clear_loss: "clear_loss".to_string(),
            forward: "forward".to_string(),
            backward: "backward".to_string(),
            x: "x".to_string(),
            loss: "loss".to_string(),
            x_grad: "x_grad".to_string(),
            loss_grad: "loss_grad".to_string(),
        }
    }
}

/// The autodiff program resolved from the metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct AutodiffProgram {
    pub x: FieldSlot,
    pub loss: FieldSlot,
    pub x_grad: FieldSlot,
    pub loss_grad: FieldSlot,
    /// `init`, `clear_loss`, `forward`, `backward`, in that order.
    kernels: [ResolvedKernel; 4],
}

impl AutodiffProgram {
    pub fn resolve(metadata: &AotMetadata, names: &AutodiffNames) -> RuntimeResult<Self> {
        let named = [
            (names.x.as_str(), FieldSlot::resolve(metadata, &names.x)?),
            (names.loss.as_str(), FieldSlot::resolve(metadata, &names.loss)?),
            (names.x_grad.as_str(), FieldSlot::resolve(metadata, &names.x_grad)?),
            (names.loss_grad.as_str(), FieldSlot::resolve(metadata, &names.loss_grad)?),
        ];
        check_disjoint(&named)?;

        let [(_, x), (_, loss), (_, x_grad), (_, loss_grad)] = named;
        for (field, grad, primal, adjoint) in [
            (&names.x, &names.x_grad, x, x_grad),
            (&names.loss, &names.loss_grad, loss, loss_grad),
        ] {
            if primal.len() != adjoint.len() {
                return Err(RuntimeError::GradientShapeMismatch {
                    field: field.clone(),
                    grad: grad.clone(),
                    expected: primal.num_elements(),
                    actual: adjoint.num_elements(),
                });
            }
        }

        Ok(Self {
            x,
            loss,
            x_grad,
            loss_grad,
            kernels: [
                ResolvedKernel::resolve(metadata, &names.init)?,
                ResolvedKernel::resolve(metadata, &names.clear_loss)?,
                ResolvedKernel::resolve(metadata, &names.forward)?,
                ResolvedKernel::resolve(metadata, &names.backward)?,
            ],
        })
    }

    /// Number of elements in `x`.
    pub fn size(&self) -> usize {
        self.x.num_elements()
    }

    fn kernel_names(&self) -> [String; 4] {
        std::array::from_fn(|i| self.kernels[i].name.clone())
    }
}

impl KernelProgram for AutodiffProgram {
    fn kernels(&self) -> &[ResolvedKernel] {
        &self.kernels
    }
}

/// Initial value of `x[index]` for a given base.
pub fn initial_value(base: f32, index: usize) -> f32 {
    base + INIT_STEP * index as f32
}

/// Analytic gradient of `sum(x^2)` at the initial values.
pub fn expected_gradient(base: f32, size: usize) -> Vec<f32> {
    (0..size).map(|i| 2.0 * initial_value(base, i)).collect()
}

/// Outcome of one gradient check.
#[derive(Debug, Clone, PartialEq)]
pub struct GradientCheck {
    pub base: f32,
    pub loss: f32,
    pub gradients: Vec<f32>,
    pub expected: Vec<f32>,
    pub max_abs_error: f32,
}

impl GradientCheck {
    pub fn passed(&self, tolerance: f32) -> bool {
        self.max_abs_error <= tolerance
    }
}

impl fmt::Display for GradientCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "size={} base={} loss={:.6} max_abs_err={:.3e}",
            self.gradients.len(),
            self.base,
            self.loss,
            self.max_abs_error
        )
    }
}

impl<B: ComputeBackend> KernelRuntime<B, AutodiffProgram> {
    /// Resolves the autodiff program and builds a runtime for it.
    pub fn autodiff(
        metadata: AotMetadata,
        backend: B,
        names: &AutodiffNames,
    ) -> RuntimeResult<Self> {
        let program = AutodiffProgram::resolve(&metadata, names)?;
        Self::from_program(metadata, backend, program)
    }

    /// Runs `init(base)`, `clear_loss` and `forward`, seeds the loss
    /// gradient with one, runs `backward` and compares the gradient of `x`
    /// with `2 * x`.
    pub fn gradient_check(&mut self, base: f32) -> RuntimeResult<GradientCheck> {
        let [init, clear_loss, forward, backward] = self.program().kernel_names();
        let program = self.program();
        let (loss_slot, x_grad, loss_grad) = (program.loss, program.x_grad, program.loss_grad);
        let size = program.size();

        self.dispatch(&init, Some(base))?;
        self.write_field(x_grad, &vec![0u8; x_grad.len()])?;
        self.write_field(loss_grad, &0f32.to_le_bytes())?;
        self.dispatch(&clear_loss, None)?;
        self.dispatch(&forward, None)?;

        self.write_field(loss_grad, &1f32.to_le_bytes())?;
        self.dispatch(&backward, None)?;

        let gradients = self.read_f32s(x_grad)?;
        let loss = self
            .read_f32s(loss_slot)?
            .first()
            .copied()
            .unwrap_or_default();
        let expected = expected_gradient(base, size);
        // NaN propagates so a broken gradient never passes.
        let max_abs_error = gradients
            .iter()
            .zip(&expected)
            .map(|(got, want)| (got - want).abs())
            .fold(0.0f32, |worst, err| {
                if err.is_nan() || err > worst { err } else { worst }
            });

        debug!("x_grad = {:?}", gradients);
        info!("gradient check: loss {:.6}, max abs error {:.3e}", loss, max_abs_error);
        Ok(GradientCheck {
            base,
            loss,
            gradients,
            expected,
            max_abs_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference_kernels::AutodiffReference;

    #[test]
    fn test_expected_gradient() {
        let expected = expected_gradient(0.25, 3);
        assert_eq!(expected.len(), 3);
        assert_eq!(expected[0], 0.5);
        assert!((expected[2] - 0.54).abs() < 1e-6);
    }

    #[test]
    fn test_resolve_program() {
        let reference = AutodiffReference::new(8);
        let program =
            AutodiffProgram::resolve(&reference.metadata(), &AutodiffNames::default()).unwrap();
        assert_eq!(program.size(), 8);
        assert_eq!(program.loss.len(), 4);
        assert_eq!(program.kernel("backward").map(|k| k.tasks.len()), Some(1));
        assert!(program.kernel("mnist_forward").is_none());
    }

    #[test]
    fn test_gradient_field_must_match_primal() {
        let reference = AutodiffReference::new(4);
        let mut metadata = reference.metadata();
        for field in &mut metadata.fields {
            if field.field_name == "x_grad" {
                field.shape = vec![3];
            }
        }
        let result = AutodiffProgram::resolve(&metadata, &AutodiffNames::default());
        assert!(matches!(
            result,
            Err(RuntimeError::GradientShapeMismatch { expected: 4, actual: 3, .. })
        ));
    }

    #[test]
    fn test_display() {
        let check = GradientCheck {
            base: 0.25,
            loss: 1.5,
            gradients: vec![0.5, 0.52],
            expected: vec![0.5, 0.52],
            max_abs_error: 0.0,
        };
        assert_eq!(
            check.to_string(),
            "size=2 base=0.25 loss=1.500000 max_abs_err=0.000e0"
        );
        assert!(check.passed(GRADIENT_TOLERANCE));
    }
}
