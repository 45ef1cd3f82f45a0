//! Expression compiler and automatic differentiation for behavioral circuit elements.
//!
//! A behavioral source is an element whose value is an arbitrary expression of circuit
//! quantities, such as `v(in) * 10k / (1 + v(ctrl)^2)`. Solving a circuit that contains
//! one requires the expression value and its partial derivatives with respect to node
//! voltages and branch currents, evaluated many times per simulation.
//!
//! This crate provides:
//!
//! - An expression tree ([`node::Node`]) with circuit-aware variables, and a textual
//!   front-end built on [evalexpr](https://github.com/ISibboI/evalexpr)
//! - Symbolic differentiation producing derivative trees ([`derivative`])
//! - Three evaluation backends with identical semantics: a tree-walking interpreter, a
//!   flattened stack program, and native code through
//!   [Cranelift](https://github.com/bytecodealliance/wasmtime/tree/main/cranelift)
//! - Real (`f64`) and complex (`Complex64`) value domains ([`scalar::Scalar`])
//!
//! Variables are bound to *sources*: closures that return the current value. Built
//! evaluators read their sources on every call, so a host updates its solution vector
//! and simply calls again.
//!
//! # Example
//!
//! ```rust
//! use behave_jit::prelude::*;
//!
//! let x = Probe::new(1.0);
//! let y = Probe::new(2.0);
//! let bindings = Bindings::default()
//!     .with(&Variable::voltage("x"), x.source())
//!     .with(&Variable::voltage("y"), y.source());
//!
//! let behavior = Behavior::parse("2*v(x) + v(y)^2", Environment::new(bindings), BuildOptions::default()).unwrap();
//! assert_eq!(behavior.value(), 6.0);
//! assert_eq!(behavior.jacobian(), vec![2.0, 4.0]);
//! ```

pub use behavior::{Behavior, BuildOptions};
pub use callable::{Backend, Callable};
pub use errors::{BehaviorError, ExpressionError};
pub use node::{Node, Variable};

pub mod prelude {
    pub use crate::behavior::{Behavior, BuildOptions};
    pub use crate::binding::{Bindings, NameComparison, Probe};
    pub use crate::callable::{build_callable, Backend, Callable};
    pub use crate::convert::parse;
    pub use crate::derivative::Differentiator;
    pub use crate::functions::{Arity, FunctionTable};
    pub use crate::interpreter::{Environment, Interpreter};
    pub use crate::node::{BinaryOp, Node, Quantity, UnaryOp, Variable, VariableKind};
    pub use crate::numeric::Tolerances;
}

/// Component facade: value and derivative evaluators for one expression
pub mod behavior;
/// Variable identity, bindings and probes
pub mod binding;
/// JIT compilation functionality using Cranelift
pub mod builder;
/// Built evaluators and backend selection
pub mod callable;
/// Lowering of node trees to Cranelift IR
pub(crate) mod codegen;
/// Conversion from expression text to node trees
pub mod convert;
/// Symbolic differentiation
pub mod derivative;
/// Error types for the various failure modes
pub mod errors;
/// Function tables and the default function library
pub mod functions;
/// Tree-walking reference evaluator
pub mod interpreter;
/// Expression tree representation
pub mod node;
/// Numeric safety primitives and tolerances
pub mod numeric;
/// Constant folding and algebraic simplification
pub mod opt;
/// Flattened stack programs
pub mod program;
/// Value domains
pub mod scalar;
/// Shared type aliases
pub mod types;
/// Native shims linked into JIT-compiled code
pub(crate) mod operators {
    pub(crate) mod divide;
    pub(crate) mod equality;
    pub(crate) mod native;
    pub(crate) mod pow;
}
