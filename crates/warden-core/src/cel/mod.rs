//! Expression-evaluator façade for CEL-governed rules.
//!
//! The expression language is a capability boundary: the engine's contract
//! with it is exactly compile-once-validate-at-write and
//! evaluate-per-decision. [`PolicyEvaluator`] is the seam; the default
//! implementation [`CelPolicyEvaluator`] wraps the `cel-interpreter`
//! runtime, and [`CompiledPolicy`] is an opaque handle so a different
//! engine can be swapped in without touching the store or the resolution
//! logic.
//!
//! Evaluation failure is never surfaced as an engine error. The resolution
//! layer maps it to a fail-closed Block; this module only reports it.

use std::any::Any;
use std::sync::Arc;

use cel_interpreter::{Context, Program, Value};
use thiserror::Error;

/// Errors from compiling or evaluating a policy expression.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EvalError {
    /// The expression source failed to compile.
    #[error("expression failed to compile: {0}")]
    Compile(String),

    /// The expression failed at evaluation time.
    #[error("expression evaluation failed: {0}")]
    Runtime(String),

    /// The expression evaluated to something other than a boolean.
    #[error("expression produced a non-boolean result")]
    NonBoolean,

    /// The compiled policy handle was produced by a different evaluator.
    #[error("compiled policy was produced by a different evaluator")]
    ForeignPolicy,
}

/// Decision-time facts a policy expression can inspect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct ActivationContext {
    /// Filesystem path of the candidate executable.
    pub path: String,

    /// Process arguments, argv[0] included.
    pub args: Vec<String>,

    /// Signing identifier of the candidate, when signed.
    pub signing_id: Option<String>,

    /// Team identifier of the candidate, when signed.
    pub team_id: Option<String>,
}

impl ActivationContext {
    /// A context for an executable at `path` with no other facts.
    #[must_use]
    pub fn for_path(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }
}

/// An opaque compiled expression, reusable across evaluations.
///
/// Only the evaluator that produced it can run it.
pub struct CompiledPolicy {
    program: Box<dyn Any + Send + Sync>,
}

/// The expression-engine seam.
///
/// `compile` is called at rule-add time to validate a batch before any row
/// is written; `evaluate` is called per decision.
pub trait PolicyEvaluator: Send + Sync {
    /// Compiles expression source into a reusable program.
    ///
    /// # Errors
    ///
    /// Returns [`EvalError::Compile`] when the source is not a valid
    /// expression.
    fn compile(&self, source: &str) -> Result<CompiledPolicy, EvalError>;

    /// Runs a compiled program against decision-time facts. `true` means
    /// allow, `false` means block.
    ///
    /// # Errors
    ///
    /// Returns an [`EvalError`] on runtime failure or a non-boolean
    /// result. Callers on the decision path must treat any error as Block.
    fn evaluate(
        &self,
        policy: &CompiledPolicy,
        ctx: &ActivationContext,
    ) -> Result<bool, EvalError>;
}

/// Default evaluator backed by the `cel-interpreter` runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct CelPolicyEvaluator;

impl CelPolicyEvaluator {
    /// Creates the default evaluator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl PolicyEvaluator for CelPolicyEvaluator {
    fn compile(&self, source: &str) -> Result<CompiledPolicy, EvalError> {
        let program =
            Program::compile(source).map_err(|e| EvalError::Compile(e.to_string()))?;
        Ok(CompiledPolicy {
            program: Box::new(program),
        })
    }

    fn evaluate(
        &self,
        policy: &CompiledPolicy,
        ctx: &ActivationContext,
    ) -> Result<bool, EvalError> {
        let program = policy
            .program
            .downcast_ref::<Program>()
            .ok_or(EvalError::ForeignPolicy)?;

        let mut context = Context::default();
        context.add_variable_from_value("path", Value::String(Arc::new(ctx.path.clone())));
        context.add_variable_from_value(
            "args",
            Value::List(Arc::new(
                ctx.args
                    .iter()
                    .map(|arg| Value::String(Arc::new(arg.clone())))
                    .collect(),
            )),
        );
        context.add_variable_from_value(
            "signing_id",
            Value::String(Arc::new(ctx.signing_id.clone().unwrap_or_default())),
        );
        context.add_variable_from_value(
            "team_id",
            Value::String(Arc::new(ctx.team_id.clone().unwrap_or_default())),
        );

        match program
            .execute(&context)
            .map_err(|e| EvalError::Runtime(e.to_string()))?
        {
            Value::Bool(allow) => Ok(allow),
            _ => Err(EvalError::NonBoolean),
        }
    }
}
