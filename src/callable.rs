//! Built evaluators and backend selection.
//!
//! Every backend produces a [`Callable`]: a zero-argument evaluator that reads the current
//! values of its bound sources. Building performs all structural checks, so calling never
//! fails.

use std::fmt;

use tracing::{debug, warn};

use crate::errors::BehaviorError;
use crate::interpreter::{Environment, Interpreter};
use crate::node::Node;
use crate::program::Program;
use crate::scalar::Scalar;

/// Evaluation strategy for built artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Backend {
    /// Walk the tree on every call
    Interpreted,
    /// Flattened stack program
    Program,
    /// Native code through Cranelift; domains without native support use [`Backend::Program`]
    #[default]
    Jit,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Interpreted => write!(f, "interpreted"),
            Backend::Program => write!(f, "program"),
            Backend::Jit => write!(f, "jit"),
        }
    }
}

/// A built evaluator.
pub trait Callable<D>: Send {
    /// Evaluates against the current values of the bound sources.
    fn call(&self) -> D;

    /// The backend that actually produced this evaluator.
    fn backend(&self) -> Backend;
}

/// Interpreter-backed evaluator owning its node and environment.
pub struct Interpreted<D> {
    node: Node,
    environment: Environment<D>,
}

impl<D: Scalar> Interpreted<D> {
    /// Validates `node` eagerly so that calls cannot hit a structural error.
    pub fn new(node: Node, environment: Environment<D>) -> Result<Self, BehaviorError> {
        Interpreter::new(&environment).validate(&node)?;
        Ok(Self { node, environment })
    }
}

impl<D: Scalar> Callable<D> for Interpreted<D> {
    fn call(&self) -> D {
        match Interpreter::new(&self.environment).evaluate(&self.node) {
            Ok(value) => value,
            Err(error) => {
                warn!(%error, node = %self.node, "evaluation failed after validation");
                D::from_real(f64::NAN)
            }
        }
    }

    fn backend(&self) -> Backend {
        Backend::Interpreted
    }
}

/// Builds an evaluator for `node` with the requested backend.
pub fn build_callable<D: Scalar>(
    node: &Node,
    environment: &Environment<D>,
    backend: Backend,
) -> Result<Box<dyn Callable<D>>, BehaviorError> {
    match backend {
        Backend::Interpreted => Ok(Box::new(Interpreted::new(node.clone(), environment.clone())?)),
        Backend::Program => Ok(Box::new(Program::compile(node, environment)?)),
        Backend::Jit => match D::compile_native(node, environment) {
            Some(native) => native,
            None => {
                debug!(domain = D::DOMAIN, "no native backend, using program");
                Ok(Box::new(Program::compile(node, environment)?))
            }
        },
    }
}
