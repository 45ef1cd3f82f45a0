//! Symbolic differentiation of node trees.
//!
//! The derivative of an expression with respect to a variable is itself a node tree, which
//! any backend can then evaluate. Derivative trees are built with folding constructors
//! ([`sum`], [`product`], ...) so that terms which are identically zero vanish instead of
//! piling up: the derivative with respect to a variable that does not occur in the
//! expression is exactly `Constant(0)`.

use std::collections::HashMap;
use std::fmt;

use rayon::prelude::*;
use tracing::{debug, trace};

use crate::binding::{NameComparison, VariableKey};
use crate::errors::ExpressionError;
use crate::functions::FunctionTable;
use crate::node::{BinaryOp, Node, UnaryOp, Variable};

/// `a + b`, folding zeros and constants.
pub fn sum(a: Node, b: Node) -> Node {
    match (a.as_constant(), b.as_constant()) {
        (Some(x), Some(y)) => Node::constant(x + y),
        (Some(x), _) if x == 0.0 => b,
        (_, Some(y)) if y == 0.0 => a,
        _ => Node::binary(BinaryOp::Add, a, b),
    }
}

/// `a - b`, folding zeros and constants.
pub fn difference(a: Node, b: Node) -> Node {
    match (a.as_constant(), b.as_constant()) {
        (Some(x), Some(y)) => Node::constant(x - y),
        (_, Some(y)) if y == 0.0 => a,
        (Some(x), _) if x == 0.0 => negate(b),
        _ => Node::binary(BinaryOp::Sub, a, b),
    }
}

/// `a * b`, folding zeros, ones and constants.
pub fn product(a: Node, b: Node) -> Node {
    match (a.as_constant(), b.as_constant()) {
        (Some(x), Some(y)) => Node::constant(x * y),
        (Some(x), _) | (_, Some(x)) if x == 0.0 => Node::constant(0.0),
        (Some(x), _) if x == 1.0 => b,
        (_, Some(y)) if y == 1.0 => a,
        _ => Node::binary(BinaryOp::Mul, a, b),
    }
}

/// `a / b` as a fudge-protected division node; a zero numerator folds to zero.
pub fn quotient(a: Node, b: Node) -> Node {
    if a.is_constant_value(0.0) {
        Node::constant(0.0)
    } else if b.is_constant_value(1.0) {
        a
    } else {
        Node::binary(BinaryOp::Div, a, b)
    }
}

/// `-a`, folding constants and double negation.
pub fn negate(a: Node) -> Node {
    match a {
        Node::Constant(value) => Node::constant(-value),
        Node::Unary(UnaryOp::Minus, inner) => *inner,
        other => Node::unary(UnaryOp::Minus, other),
    }
}

fn call(name: &str, argument: Node) -> Node {
    Node::call(name, vec![argument])
}

/// Ordered mapping from variables to per-variable artifacts.
///
/// Entries keep the order in which the variables were requested. Lookup follows the
/// [`NameComparison`] the map was built with.
#[derive(Clone)]
pub struct Derivatives<A> {
    comparison: NameComparison,
    entries: Vec<(Variable, A)>,
    index: HashMap<VariableKey, usize>,
}

impl<A> Derivatives<A> {
    pub fn new(comparison: NameComparison) -> Self {
        Self {
            comparison,
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Adds an entry; an existing entry for the same variable is replaced in place.
    pub fn insert(&mut self, variable: Variable, artifact: A) {
        let key = self.comparison.key(&variable);
        match self.index.get(&key) {
            Some(&position) => self.entries[position] = (variable, artifact),
            None => {
                self.index.insert(key, self.entries.len());
                self.entries.push((variable, artifact));
            }
        }
    }

    pub fn get(&self, variable: &Variable) -> Option<&A> {
        self.index
            .get(&self.comparison.key(variable))
            .map(|&position| &self.entries[position].1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Variable, &A)> {
        self.entries.iter().map(|(variable, artifact)| (variable, artifact))
    }

    pub fn variables(&self) -> impl Iterator<Item = &Variable> {
        self.entries.iter().map(|(variable, _)| variable)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn comparison(&self) -> NameComparison {
        self.comparison
    }

    /// Converts every artifact, stopping at the first failure.
    pub fn try_map<B, E>(
        &self,
        mut f: impl FnMut(&Variable, &A) -> Result<B, E>,
    ) -> Result<Derivatives<B>, E> {
        let mut mapped = Derivatives::new(self.comparison);
        for (variable, artifact) in &self.entries {
            mapped.insert(variable.clone(), f(variable, artifact)?);
        }
        Ok(mapped)
    }
}

impl<A: fmt::Debug> fmt::Debug for Derivatives<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

/// Computes derivative trees against a function table.
pub struct Differentiator<'t, D> {
    functions: &'t FunctionTable<D>,
    comparison: NameComparison,
}

impl<'t, D: Send + Sync> Differentiator<'t, D> {
    pub fn new(functions: &'t FunctionTable<D>, comparison: NameComparison) -> Self {
        Self {
            functions,
            comparison,
        }
    }

    /// Returns the derivative of `node` with respect to `variable`.
    pub fn derive(&self, node: &Node, variable: &Variable) -> Result<Node, ExpressionError> {
        Ok(match node {
            Node::Constant(_) => Node::constant(0.0),
            Node::Variable(v) => Node::constant(if self.comparison.same(v, variable) { 1.0 } else { 0.0 }),

            Node::Unary(op, operand) => match op {
                UnaryOp::Plus => self.derive(operand, variable)?,
                UnaryOp::Minus => negate(self.derive(operand, variable)?),
                UnaryOp::Not => Node::constant(0.0),
            },

            Node::Binary(op, _, _) if op.is_logical() => Node::constant(0.0),
            Node::Binary(op, left, right) => {
                let (a, b) = (left.as_ref(), right.as_ref());
                let da = self.derive(a, variable)?;
                let db = self.derive(b, variable)?;
                match op {
                    BinaryOp::Add => sum(da, db),
                    BinaryOp::Sub => difference(da, db),
                    BinaryOp::Mul => sum(product(da, b.clone()), product(a.clone(), db)),
                    BinaryOp::Div => quotient(
                        difference(product(da, b.clone()), product(a.clone(), db)),
                        product(b.clone(), b.clone()),
                    ),
                    BinaryOp::Mod => {
                        // a % b = a - trunc(a / b) * b
                        let ratio = quotient(a.clone(), b.clone());
                        let truncated = product(
                            call("sgn", ratio.clone()),
                            call("floor", call("abs", ratio)),
                        );
                        difference(da, product(truncated, db))
                    }
                    BinaryOp::Pow => self.derive_power(a, b, da, db),
                    _ => Node::constant(0.0),
                }
            }

            Node::Ternary(condition, if_true, if_false) => {
                let dt = self.derive(if_true, variable)?;
                let df = self.derive(if_false, variable)?;
                match (dt.as_constant(), df.as_constant()) {
                    (Some(x), Some(y)) if x == y => dt,
                    _ => Node::ternary(condition.as_ref().clone(), dt, df),
                }
            }

            Node::Call(name, arguments) => {
                if !arguments
                    .iter()
                    .any(|argument| argument.depends_on(variable, self.comparison))
                {
                    return Ok(Node::constant(0.0));
                }
                let definition = self.functions.resolve(name, arguments.len())?;
                let rule = definition
                    .derivative
                    .as_ref()
                    .ok_or_else(|| ExpressionError::UndifferentiableFunction(name.clone()))?;
                trace!(function = %name, "chain rule");
                let partials = rule(arguments);
                if partials.len() != arguments.len() {
                    return Err(ExpressionError::UndifferentiableFunction(name.clone()));
                }
                let mut result = Node::constant(0.0);
                for (argument, partial) in arguments.iter().zip(partials) {
                    let inner = self.derive(argument, variable)?;
                    if !inner.is_constant_value(0.0) {
                        result = sum(result, product(partial, inner));
                    }
                }
                result
            }

            Node::Extension(..) => {
                if node.depends_on(variable, self.comparison) {
                    return Err(ExpressionError::UnrecognizedNode(node.to_string()));
                }
                Node::constant(0.0)
            }
        })
    }

    fn derive_power(&self, a: &Node, b: &Node, da: Node, db: Node) -> Node {
        if let Some(exponent) = b.as_constant() {
            // d|a|^b = b * |a|^(b-1) * sgn(a) * da
            return if exponent == 0.0 {
                Node::constant(0.0)
            } else if exponent == 1.0 {
                product(call("sgn", a.clone()), da)
            } else if exponent == 2.0 {
                product(product(Node::constant(2.0), a.clone()), da)
            } else {
                let reduced = Node::binary(BinaryOp::Pow, a.clone(), Node::constant(exponent - 1.0));
                let term = product(
                    product(product(Node::constant(exponent), reduced), call("sgn", a.clone())),
                    da,
                );
                // |a|^(b-1) is infinite at a = 0 when b < 1, and sgn(0) would turn it into NaN
                if exponent < 1.0 {
                    Node::ternary(
                        Node::binary(BinaryOp::Eq, a.clone(), Node::constant(0.0)),
                        Node::constant(0.0),
                        term,
                    )
                } else {
                    term
                }
            };
        }

        // d(a^b) = a^b * (db * log|a| + b * da / a)
        let exponent_term = product(db, call("log", call("abs", a.clone())));
        let base_term = quotient(product(b.clone(), da), a.clone());
        product(
            Node::binary(BinaryOp::Pow, a.clone(), b.clone()),
            sum(exponent_term, base_term),
        )
    }

    /// Differentiates `node` with respect to each of `variables`, in parallel.
    ///
    /// The result keeps the order of `variables`.
    pub fn derive_all(
        &self,
        node: &Node,
        variables: &[Variable],
    ) -> Result<Derivatives<Node>, ExpressionError> {
        debug!(targets = variables.len(), "deriving");
        let derived = variables
            .par_iter()
            .map(|variable| Ok((variable.clone(), self.derive(node, variable)?)))
            .collect::<Result<Vec<_>, ExpressionError>>()?;

        let mut derivatives = Derivatives::new(self.comparison);
        for (variable, derivative) in derived {
            derivatives.insert(variable, derivative);
        }
        Ok(derivatives)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::Bindings;
    use crate::functions::Arity;
    use crate::interpreter::{Environment, Interpreter};
    use crate::types::Source;
    use std::sync::Arc;

    fn x() -> Node {
        Node::var(Variable::voltage("x"))
    }

    fn y() -> Node {
        Node::var(Variable::voltage("y"))
    }

    fn environment(x: f64, y: f64) -> Environment<f64> {
        let mut bindings = Bindings::default();
        bindings.bind_value(&Variable::voltage("x"), x);
        bindings.bind_value(&Variable::voltage("y"), y);
        Environment::new(bindings)
    }

    fn eval(node: &Node, x: f64, y: f64) -> f64 {
        let env = environment(x, y);
        Interpreter::new(&env).evaluate(node).unwrap()
    }

    fn derive(node: &Node, variable: &Variable) -> Node {
        let table = FunctionTable::<f64>::defaults();
        Differentiator::new(&table, NameComparison::CaseInsensitive)
            .derive(node, variable)
            .unwrap()
    }

    #[test]
    fn test_square() {
        let node = Node::binary(BinaryOp::Mul, x(), x());
        let derivative = derive(&node, &Variable::voltage("x"));
        for point in [-3.0, 0.0, 1.5, 10.0] {
            assert_eq!(eval(&derivative, point, 0.0), 2.0 * point);
        }
    }

    #[test]
    fn test_quotient_matches_finite_differences() {
        let node = Node::binary(BinaryOp::Div, x(), y());
        let dx = derive(&node, &Variable::voltage("x"));
        let dy = derive(&node, &Variable::voltage("y"));
        let h = 1e-6;
        for (px, py) in [(1.0, 2.0), (-3.0, 0.5), (4.0, -1.5)] {
            let fd_x = (eval(&node, px + h, py) - eval(&node, px - h, py)) / (2.0 * h);
            let fd_y = (eval(&node, px, py + h) - eval(&node, px, py - h)) / (2.0 * h);
            assert!((eval(&dx, px, py) - fd_x).abs() < 1e-4);
            assert!((eval(&dy, px, py) - fd_y).abs() < 1e-4);
        }
    }

    #[test]
    fn test_absent_variable_folds_to_zero() {
        let mut node = Node::binary(BinaryOp::Add, x(), Node::constant(1.0));
        for depth in 0..20 {
            let leaf = if depth % 2 == 0 { y() } else { Node::call("sin", vec![x()]) };
            node = Node::binary(BinaryOp::Add, node, Node::binary(BinaryOp::Mul, leaf, x()));
        }
        let derivative = derive(&node, &Variable::current("r1"));
        assert_eq!(derivative, Node::constant(0.0));
    }

    #[test]
    fn test_comparison_derivative_is_zero() {
        let node = Node::binary(BinaryOp::Gt, x(), Node::constant(3.0));
        let derivative = derive(&node, &Variable::voltage("x"));
        assert_eq!(derivative, Node::constant(0.0));
        assert_eq!(eval(&derivative, 3.0, 0.0), 0.0);
    }

    #[test]
    fn test_power_rules() {
        let x_var = Variable::voltage("x");
        let cube = Node::binary(BinaryOp::Pow, x(), Node::constant(3.0));
        let d_cube = derive(&cube, &x_var);
        // |x|^3 has derivative 3 x |x|
        assert!((eval(&d_cube, 2.0, 0.0) - 12.0).abs() < 1e-12);
        assert!((eval(&d_cube, -2.0, 0.0) + 12.0).abs() < 1e-12);

        let general = Node::binary(BinaryOp::Pow, x(), y());
        let dx = derive(&general, &x_var);
        let dy = derive(&general, &Variable::voltage("y"));
        let h = 1e-6;
        for (px, py) in [(2.0, 1.5), (-1.5, 2.5), (0.7, -0.5)] {
            let fd_x = (eval(&general, px + h, py) - eval(&general, px - h, py)) / (2.0 * h);
            let fd_y = (eval(&general, px, py + h) - eval(&general, px, py - h)) / (2.0 * h);
            assert!((eval(&dx, px, py) - fd_x).abs() < 1e-4, "d/dx at ({px}, {py})");
            assert!((eval(&dy, px, py) - fd_y).abs() < 1e-4, "d/dy at ({px}, {py})");
        }
    }

    #[test]
    fn test_fractional_power_is_finite_at_zero() {
        let x_var = Variable::voltage("x");
        for exponent in [0.5, -1.5] {
            let root = Node::binary(BinaryOp::Pow, x(), Node::constant(exponent));
            let derivative = derive(&root, &x_var);
            assert_eq!(eval(&derivative, 0.0, 0.0), 0.0, "x^{exponent}");
            let expected = exponent * 4.0f64.powf(exponent - 1.0);
            assert!((eval(&derivative, 4.0, 0.0) - expected).abs() < 1e-12);
            assert!((eval(&derivative, -4.0, 0.0) + expected).abs() < 1e-12);
        }
    }

    #[test]
    fn test_rule_must_cover_every_argument() {
        let mut table = FunctionTable::<f64>::defaults();
        table.register(
            "pair",
            Arity::Exactly(2),
            Arc::new(|args: &[f64]| args[0] * args[1]),
            Some(Arc::new(|args: &[Node]| -> Vec<Node> { vec![args[1].clone()] })),
        );
        let differentiator = Differentiator::new(&table, NameComparison::CaseInsensitive);
        let node = Node::call("pair", vec![x(), y()]);
        assert_eq!(
            differentiator.derive(&node, &Variable::voltage("y")).unwrap_err(),
            ExpressionError::UndifferentiableFunction("pair".to_string())
        );
    }

    #[test]
    fn test_ternary_derivative() {
        let node = Node::ternary(
            Node::binary(BinaryOp::Gt, x(), Node::constant(0.0)),
            Node::binary(BinaryOp::Mul, x(), x()),
            Node::unary(UnaryOp::Minus, x()),
        );
        let derivative = derive(&node, &Variable::voltage("x"));
        assert_eq!(eval(&derivative, 3.0, 0.0), 6.0);
        assert_eq!(eval(&derivative, -3.0, 0.0), -1.0);
    }

    #[test]
    fn test_chain_rule_through_library() {
        let node = Node::call("exp", vec![Node::binary(BinaryOp::Mul, Node::constant(2.0), x())]);
        let derivative = derive(&node, &Variable::voltage("x"));
        let point: f64 = 0.3;
        assert!((eval(&derivative, point, 0.0) - 2.0 * (2.0 * point).exp()).abs() < 1e-12);

        let selection = Node::call("max", vec![x(), y()]);
        let dx = derive(&selection, &Variable::voltage("x"));
        assert_eq!(eval(&dx, 2.0, 1.0), 1.0);
        assert_eq!(eval(&dx, 1.0, 2.0), 0.0);
    }

    #[test]
    fn test_call_errors() {
        let mut table = FunctionTable::<f64>::defaults();
        table.register("opaque", Arity::Exactly(1), Arc::new(|args: &[f64]| args[0]), None);
        let differentiator = Differentiator::new(&table, NameComparison::CaseInsensitive);

        let opaque = Node::call("opaque", vec![x()]);
        assert_eq!(
            differentiator.derive(&opaque, &Variable::voltage("x")).unwrap_err(),
            ExpressionError::UndifferentiableFunction("opaque".to_string())
        );
        // no argument depends on y, so the missing rule is never consulted
        assert_eq!(
            differentiator.derive(&opaque, &Variable::voltage("y")).unwrap(),
            Node::constant(0.0)
        );

        let unknown = Node::call("mystery", vec![x()]);
        assert!(matches!(
            differentiator.derive(&unknown, &Variable::voltage("x")),
            Err(ExpressionError::UnknownFunction(_))
        ));

        let extension = Node::Extension("table".to_string(), vec![x()]);
        assert!(differentiator.derive(&extension, &Variable::voltage("x")).is_err());
        assert_eq!(
            differentiator.derive(&extension, &Variable::voltage("y")).unwrap(),
            Node::constant(0.0)
        );
    }

    #[test]
    fn test_derive_all_keeps_order() {
        let table = FunctionTable::<f64>::defaults();
        let differentiator = Differentiator::new(&table, NameComparison::CaseInsensitive);
        let node = Node::binary(BinaryOp::Mul, x(), y());
        let variables = vec![Variable::voltage("y"), Variable::voltage("x")];
        let derivatives = differentiator.derive_all(&node, &variables).unwrap();

        let order: Vec<_> = derivatives.variables().map(|v| v.name.clone()).collect();
        assert_eq!(order, vec!["y", "x"]);
        assert_eq!(derivatives.get(&Variable::voltage("X")), Some(&y()));
        assert_eq!(derivatives.get(&Variable::voltage("y")), Some(&x()));
    }

    #[test]
    fn test_derivative_sources_stay_live() {
        let value = Arc::new(std::sync::Mutex::new(1.0));
        let shared = value.clone();
        let source: Source<f64> = Arc::new(move || *shared.lock().unwrap());
        let bindings = Bindings::default().with(&Variable::voltage("x"), source);
        let env = Environment::new(bindings);

        let node = Node::binary(BinaryOp::Pow, x(), Node::constant(2.0));
        let derivative = derive(&node, &Variable::voltage("x"));
        let interpreter = Interpreter::new(&env);
        assert_eq!(interpreter.evaluate(&derivative).unwrap(), 2.0);
        *value.lock().unwrap() = 5.0;
        assert_eq!(interpreter.evaluate(&derivative).unwrap(), 10.0);
    }
}
