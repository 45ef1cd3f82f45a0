use std::sync::Arc;

use crate::errors::ExpressionError;
use crate::functions::FunctionTable;
use crate::node::Node;

/// Type alias for a live value source bound to a variable.
///
/// This represents a function that:
/// - Takes no arguments
/// - Returns the current value of a circuit unknown or parameter
/// - Is read again on every evaluation, so the host can update the underlying state
///   between calls without rebuilding anything
pub type Source<D> = Arc<dyn Fn() -> D + Send + Sync>;

/// Type alias for the implementation of a registered function.
///
/// Receives the evaluated arguments in call order and returns the function value.
pub type NativeFn<D> = Arc<dyn Fn(&[D]) -> D + Send + Sync>;

/// Type alias for the derivative rule of a registered function.
///
/// This represents a function that:
/// - Takes the argument nodes of a call
/// - Returns one node per argument, the partial derivative of the function with respect
///   to that argument
///
/// The chain rule is applied by the differentiator, so the rule never sees the
/// differentiation variable.
pub type DerivativeRule = Arc<dyn Fn(&[Node]) -> Vec<Node> + Send + Sync>;

/// Type alias for a function-table registration hook.
///
/// Invoked on a private copy of the function table before a component builds its
/// artifacts, so a host can add or replace functions for that component only.
pub type BuilderHook<D> = Arc<dyn Fn(&mut FunctionTable<D>) + Send + Sync>;

/// Type alias for the evaluator of [`Node::Extension`] nodes.
///
/// Receives the extension name and its evaluated arguments. Interpreters without a handler
/// reject extension nodes with [`ExpressionError::UnrecognizedNode`].
pub type ExtensionHandler<D> = Arc<dyn Fn(&str, &[D]) -> Result<D, ExpressionError> + Send + Sync>;
