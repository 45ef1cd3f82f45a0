//! Tree-walking evaluator.
//!
//! The interpreter is the reference semantics of the crate: the compiled backends are
//! tested for equivalence against it. Nothing is cached between evaluations, every
//! variable is read from its source on each call.

use crate::binding::Bindings;
use crate::errors::ExpressionError;
use crate::functions::FunctionTable;
use crate::node::{BinaryOp, Node, UnaryOp};
use crate::numeric::Tolerances;
use crate::scalar::{unsupported_for, Scalar};
use crate::types::ExtensionHandler;

/// Everything an expression is evaluated against.
#[derive(Clone)]
pub struct Environment<D> {
    pub bindings: Bindings<D>,
    pub functions: FunctionTable<D>,
    pub tolerances: Tolerances,
    pub extension: Option<ExtensionHandler<D>>,
}

impl<D: Scalar> Environment<D> {
    /// An environment with the default function library and default tolerances.
    pub fn new(bindings: Bindings<D>) -> Self {
        Self {
            bindings,
            functions: FunctionTable::defaults(),
            tolerances: Tolerances::default(),
            extension: None,
        }
    }
}

impl<D> Environment<D> {
    pub fn with_bindings(mut self, bindings: Bindings<D>) -> Self {
        self.bindings = bindings;
        self
    }

    pub fn with_functions(mut self, functions: FunctionTable<D>) -> Self {
        self.functions = functions;
        self
    }

    pub fn with_tolerances(mut self, tolerances: Tolerances) -> Self {
        self.tolerances = tolerances;
        self
    }

    pub fn with_extension(mut self, handler: ExtensionHandler<D>) -> Self {
        self.extension = Some(handler);
        self
    }
}

/// Evaluates node trees directly.
pub struct Interpreter<'e, D> {
    environment: &'e Environment<D>,
}

impl<'e, D: Scalar> Interpreter<'e, D> {
    pub fn new(environment: &'e Environment<D>) -> Self {
        Self { environment }
    }

    pub fn environment(&self) -> &'e Environment<D> {
        self.environment
    }

    /// Evaluates `node` against the current values of the bound sources.
    pub fn evaluate(&self, node: &Node) -> Result<D, ExpressionError> {
        match node {
            Node::Constant(value) => Ok(D::from_real(*value)),
            Node::Variable(variable) => self
                .environment
                .bindings
                .get(variable)
                .map(|source| source())
                .ok_or_else(|| ExpressionError::UnboundVariable(variable.to_string())),
            Node::Unary(op, operand) => {
                let value = self.evaluate(operand)?;
                Ok(match op {
                    UnaryOp::Plus => value,
                    UnaryOp::Minus => -value,
                    UnaryOp::Not => D::from_bool(!value.is_true()),
                })
            }
            Node::Binary(op, left, right) => {
                let left = self.evaluate(left)?;
                let right = self.evaluate(right)?;
                self.binary(*op, left, right)
            }
            Node::Ternary(condition, if_true, if_false) => {
                if self.evaluate(condition)?.is_true() {
                    self.evaluate(if_true)
                } else {
                    self.evaluate(if_false)
                }
            }
            Node::Call(name, arguments) => {
                let definition = self.environment.functions.resolve(name, arguments.len())?;
                let values = arguments
                    .iter()
                    .map(|argument| self.evaluate(argument))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok((definition.implementation)(&values))
            }
            Node::Extension(name, arguments) => {
                let handler = self
                    .environment
                    .extension
                    .as_ref()
                    .ok_or_else(|| ExpressionError::UnrecognizedNode(node.to_string()))?;
                let values = arguments
                    .iter()
                    .map(|argument| self.evaluate(argument))
                    .collect::<Result<Vec<_>, _>>()?;
                handler(name, &values)
            }
        }
    }

    fn binary(&self, op: BinaryOp, left: D, right: D) -> Result<D, ExpressionError> {
        let tolerances = &self.environment.tolerances;
        Ok(match op {
            BinaryOp::Add => left + right,
            BinaryOp::Sub => left - right,
            BinaryOp::Mul => left * right,
            BinaryOp::Div => left.safe_divide(right, tolerances.fudge_factor),
            BinaryOp::Mod => left.modulo(right),
            BinaryOp::Pow => left.power(right),
            BinaryOp::Lt | BinaryOp::Gt | BinaryOp::Le | BinaryOp::Ge => {
                D::from_bool(D::compare(op, left, right)?)
            }
            BinaryOp::Eq => D::from_bool(left.fuzzy_equals(right, tolerances)),
            BinaryOp::Ne => D::from_bool(!left.fuzzy_equals(right, tolerances)),
            BinaryOp::And => D::from_bool(left.is_true() && right.is_true()),
            BinaryOp::Or => D::from_bool(left.is_true() || right.is_true()),
            BinaryOp::Xor => D::from_bool(left.is_true() != right.is_true()),
        })
    }

    /// Performs every structural check of [`Interpreter::evaluate`] without reading any
    /// source or calling any function.
    pub fn validate(&self, node: &Node) -> Result<(), ExpressionError> {
        match node {
            Node::Constant(_) => Ok(()),
            Node::Variable(variable) => {
                if self.environment.bindings.contains(variable) {
                    Ok(())
                } else {
                    Err(ExpressionError::UnboundVariable(variable.to_string()))
                }
            }
            Node::Binary(op, _, _) if op.is_ordering() && !D::ORDERED => Err(unsupported_for::<D>(*op)),
            Node::Call(name, arguments) => {
                self.environment.functions.resolve(name, arguments.len())?;
                arguments.iter().try_for_each(|argument| self.validate(argument))
            }
            Node::Extension(..) if self.environment.extension.is_none() => {
                Err(ExpressionError::UnrecognizedNode(node.to_string()))
            }
            _ => node
                .children()
                .into_iter()
                .try_for_each(|child| self.validate(child)),
        }
    }
}
