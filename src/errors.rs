//! Error types for the behave-jit crate.
//!
//! This module defines the error types that can occur while turning an expression into
//! value and derivative evaluators. The main error types are:
//!
//! - `ExpressionError`: Structural mismatches between an expression and its environment
//!   (unbound variables, unknown functions, arity mismatches, ...)
//! - `ConvertError`: Errors during conversion from the evalexpr tree to our node model
//! - `BuilderError`: Errors during JIT compilation with Cranelift
//! - `BehaviorError`: High-level errors when building a behavioral component
//!
//! Every one of these is raised while building. Numeric edge cases (division by zero,
//! powers of negative bases, near-equal comparisons) are never errors: they are absorbed
//! by the primitives in [`crate::numeric`].

use cranelift_codegen::CodegenError;
use cranelift_module::ModuleError;
use evalexpr::{DefaultNumericTypes, EvalexprError};
use thiserror::Error;

use crate::binding::NameComparison;

/// Structural errors raised when an expression does not fit the environment it is
/// evaluated, compiled or differentiated in.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExpressionError {
    /// A node shape the evaluator or compiler does not know how to handle
    #[error("unrecognized expression node: {0}")]
    UnrecognizedNode(String),
    /// A variable node without an entry in the binding map
    #[error("unbound variable: {0}")]
    UnboundVariable(String),
    /// A function call whose name has no registered implementation
    #[error("unrecognized call to function '{0}'")]
    UnknownFunction(String),
    /// A function call whose argument count does not match the registered arity
    #[error("function '{name}' expects {expected} argument(s), got {got}")]
    ArityMismatch {
        name: String,
        expected: String,
        got: usize,
    },
    /// Differentiation reached a function without a derivative rule
    #[error("function '{0}' has no derivative rule")]
    UndifferentiableFunction(String),
    /// An operator that is undefined in the scalar domain (ordering over complex values)
    #[error("operator '{operator}' is not supported for {domain} values")]
    UnsupportedOperatorForDomain {
        operator: String,
        domain: &'static str,
    },
}

/// Errors that can occur during conversion from evalexpr AST to our node model.
#[derive(Error, Debug)]
pub enum ConvertError {
    /// Error when the text could not be parsed by evalexpr
    #[error("failed to parse expression: {0}")]
    Parse(#[from] EvalexprError<DefaultNumericTypes>),
    /// Error when encountering an operator that is not supported by our implementation
    #[error("unsupported operator: {0}")]
    UnsupportedOperator(String),
    /// Error when a constant value is not numeric
    #[error("expected numeric constant: {0}")]
    ConstOperator(String),
    /// Error when the root node does not have exactly one child
    #[error("expected single child for root node: {0}")]
    RootNode(String),
    /// Error when a `v(..)`/`i(..)` reference is malformed
    #[error("malformed circuit reference: {0}")]
    Reference(String),
    /// Error when an operator receives the wrong number of operands
    #[error("operator {operator} expects {expected} operand(s), got {got}")]
    Operands {
        operator: String,
        expected: usize,
        got: usize,
    },
    /// Error when a numeric literal cannot be read
    #[error("invalid numeric literal: {0}")]
    Literal(String),
}

/// Errors that can occur during JIT compilation of expressions.
///
/// This enum represents various failure modes in the process of converting a node tree
/// into machine code using Cranelift as the JIT compiler backend.
#[derive(Error, Debug)]
pub enum BuilderError {
    /// Error when the target machine architecture is not supported
    #[error("host machine is not supported: {0}")]
    HostMachineNotSupported(String),
    /// Error when a Cranelift setting is rejected
    #[error("invalid compiler setting: {0}")]
    Setting(String),
    /// Error during Cranelift code generation
    #[error("codegen error: {0}")]
    CodegenError(CodegenError),
    /// Error in the Cranelift JIT module
    #[error("module error: {0}")]
    ModuleError(#[from] ModuleError),
    /// Error when defining the JIT function
    #[error("function error: {0}")]
    FunctionError(String),
    /// Error when declaring the JIT function or one of its imports
    #[error("declaration error: {0}")]
    DeclarationError(String),
}

/// High-level errors that can occur when building a behavioral component.
///
/// Wraps the lower-level errors from conversion, structural checks and JIT compilation.
#[derive(Debug, Error)]
pub enum BehaviorError {
    /// Error when converting the expression text into nodes
    #[error("failed to build expression tree")]
    Convert(#[from] ConvertError),
    /// Error when the expression does not fit its environment
    #[error(transparent)]
    Expression(#[from] ExpressionError),
    /// Error when JIT compiling the expression
    #[error("failed to build JIT function")]
    Builder(#[from] BuilderError),
    /// Error when the options ask for a different name comparison than the bindings use
    #[error("options compare names {requested:?} but the bindings compare them {bindings:?}")]
    ComparisonMismatch {
        requested: NameComparison,
        bindings: NameComparison,
    },
    /// Error when the component has no expression to build from
    #[error("no expression has been set")]
    MissingExpression,
}
