//! Behavioral component facade.
//!
//! A [`Behavior`] turns one expression into everything a circuit solver needs from a
//! behavioral source: an evaluator for the expression value and an evaluator for its
//! partial derivative with respect to each unknown (node voltages and branch currents).
//!
//! # Example
//!
//! ```
//! use behave_jit::prelude::*;
//!
//! let a = Probe::new(2.0);
//! let bindings = Bindings::default().with(&Variable::voltage("a"), a.source());
//!
//! let behavior = Behavior::parse("v(a)^2 + 1k", Environment::new(bindings), BuildOptions::default()).unwrap();
//! assert_eq!(behavior.value(), 1004.0);
//! assert_eq!(behavior.derivative(&Variable::voltage("a")), Some(4.0));
//!
//! a.set(3.0);
//! assert_eq!(behavior.value(), 1009.0);
//! ```

use std::fmt;

use colored::Colorize;
use itertools::Itertools;
use tracing::{debug, trace};

use crate::binding::{Bindings, NameComparison};
use crate::callable::{build_callable, Backend, Callable};
use crate::convert;
use crate::derivative::{Derivatives, Differentiator};
use crate::errors::{BehaviorError, ExpressionError};
use crate::interpreter::Environment;
use crate::node::{Node, Variable};
use crate::numeric::Tolerances;
use crate::scalar::Scalar;
use crate::types::BuilderHook;

/// Options controlling how a [`Behavior`] is built.
#[derive(Clone)]
pub struct BuildOptions<D> {
    pub backend: Backend,
    /// Comparison used to find derivative targets and to look derivatives up; defaults to
    /// the comparison of the environment's bindings and must agree with it when set
    pub comparison: Option<NameComparison>,
    /// Replaces the environment's tolerances when set
    pub tolerances: Option<Tolerances>,
    /// Invoked on the component's own copy of the function table before building
    pub hook: Option<BuilderHook<D>>,
    /// Variables to differentiate against; defaults to every voltage and current
    pub targets: Option<Vec<Variable>>,
}

impl<D> Default for BuildOptions<D> {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            comparison: None,
            tolerances: None,
            hook: None,
            targets: None,
        }
    }
}

impl<D> BuildOptions<D> {
    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_comparison(mut self, comparison: NameComparison) -> Self {
        self.comparison = Some(comparison);
        self
    }

    pub fn with_tolerances(mut self, tolerances: Tolerances) -> Self {
        self.tolerances = Some(tolerances);
        self
    }

    pub fn with_hook(mut self, hook: BuilderHook<D>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn with_targets(mut self, targets: Vec<Variable>) -> Self {
        self.targets = Some(targets);
        self
    }
}

impl<D> fmt::Debug for BuildOptions<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildOptions")
            .field("backend", &self.backend)
            .field("comparison", &self.comparison)
            .field("tolerances", &self.tolerances)
            .field("hook", &self.hook.is_some())
            .field("targets", &self.targets)
            .finish()
    }
}

/// A built behavioral expression with its partial derivatives.
///
/// All evaluators are built up front. Evaluation reads the current values of the bound
/// sources, so a host updates its sources and calls [`Behavior::value`] and
/// [`Behavior::jacobian`] on every solver iteration.
pub struct Behavior<D> {
    node: Node,
    backend: Backend,
    value: Box<dyn Callable<D>>,
    expressions: Derivatives<Node>,
    derivatives: Derivatives<Box<dyn Callable<D>>>,
}

impl<D: Scalar> Behavior<D> {
    /// Parses `text` and builds a behavior from it.
    pub fn parse(
        text: &str,
        environment: Environment<D>,
        options: BuildOptions<D>,
    ) -> Result<Self, BehaviorError> {
        let node = convert::parse(text)?;
        Self::build(node, environment, options)
    }

    /// Builds the value evaluator and one derivative evaluator per target.
    ///
    /// # Errors
    /// Returns `BehaviorError` if:
    /// - a variable of the expression or of a derivative is unbound
    /// - the requested name comparison differs from the bindings' comparison
    /// - a function is unknown, called with the wrong arity, or lacks a derivative rule
    ///   while its arguments depend on a target
    /// - JIT compilation fails
    pub fn build(
        node: Node,
        mut environment: Environment<D>,
        options: BuildOptions<D>,
    ) -> Result<Self, BehaviorError> {
        if let Some(hook) = &options.hook {
            hook(&mut environment.functions);
        }
        if let Some(tolerances) = options.tolerances {
            environment.tolerances = tolerances;
        }
        let comparison = environment.bindings.comparison();
        if let Some(requested) = options.comparison {
            if requested != comparison {
                return Err(BehaviorError::ComparisonMismatch {
                    requested,
                    bindings: comparison,
                });
            }
        }

        let targets = match &options.targets {
            Some(targets) => targets.clone(),
            None => node
                .variables(comparison)
                .into_iter()
                .filter(Variable::is_unknown)
                .collect(),
        };
        debug!(
            expression = %node,
            targets = targets.len(),
            backend = %options.backend,
            "building behavior"
        );

        let value = build_callable(&node, &environment, options.backend)?;
        let expressions = Differentiator::new(&environment.functions, comparison)
            .derive_all(&node, &targets)?;
        let derivatives = expressions.try_map(|variable, derivative| {
            trace!(%variable, %derivative, "building derivative");
            build_callable(derivative, &environment, options.backend)
        })?;

        Ok(Self {
            node,
            backend: value.backend(),
            value,
            expressions,
            derivatives,
        })
    }

    /// Evaluates the expression.
    pub fn value(&self) -> D {
        self.value.call()
    }

    /// Evaluates the partial derivative with respect to `variable`.
    ///
    /// Returns `None` if `variable` is not one of the targets.
    pub fn derivative(&self, variable: &Variable) -> Option<D> {
        self.derivatives.get(variable).map(|callable| callable.call())
    }

    /// Evaluates every partial derivative, in target order.
    pub fn jacobian(&self) -> Vec<D> {
        self.derivatives
            .iter()
            .map(|(_, callable)| callable.call())
            .collect()
    }

    /// Evaluates the linearized response `Σ ∂f/∂xᵢ · xᵢ`, reading each `xᵢ` from
    /// `excitation`.
    ///
    /// The derivatives are evaluated at the operating point of the behavior's own bindings.
    /// Every target must be bound in `excitation`.
    pub fn small_signal(&self, excitation: &Bindings<D>) -> Result<D, ExpressionError> {
        self.derivatives
            .iter()
            .try_fold(D::from_real(0.0), |total, (variable, callable)| {
                let source = excitation
                    .get(variable)
                    .ok_or_else(|| ExpressionError::UnboundVariable(variable.to_string()))?;
                Ok(total + callable.call() * source())
            })
    }
}

impl<D> Behavior<D> {
    pub fn node(&self) -> &Node {
        &self.node
    }

    /// The backend that actually built the evaluators.
    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// The variables derivatives were built for, in order.
    pub fn targets(&self) -> impl Iterator<Item = &Variable> {
        self.expressions.variables()
    }

    /// The symbolic derivative with respect to `variable`.
    pub fn derivative_expression(&self, variable: &Variable) -> Option<&Node> {
        self.expressions.get(variable)
    }

    /// All symbolic derivatives, in target order.
    pub fn derivative_expressions(&self) -> &Derivatives<Node> {
        &self.expressions
    }
}

impl<D> fmt::Debug for Behavior<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{{")?;
        writeln!(f, "    {}: {}", "Expression".cyan(), self.node)?;
        writeln!(f, "    {}: {}", "Backend".cyan(), self.backend)?;
        writeln!(f, "    {}: {:?}", "Derivatives".cyan(), self.expressions)?;
        writeln!(f, "}}")?;
        Ok(())
    }
}

impl<D> fmt::Display for Behavior<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}: {}", "Expression".cyan(), self.node)?;
        writeln!(
            f,
            "{}: [{}]",
            "Targets".cyan(),
            self.targets().map(Variable::to_string).join(", ")
        )?;
        for (variable, derivative) in self.expressions.iter() {
            writeln!(f, "  {} = {}", format!("∂/∂{variable}").green(), derivative)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::Probe;
    use crate::functions::{Arity, FunctionTable};
    use crate::node::BinaryOp;
    use num_complex::Complex64;
    use std::sync::Arc;

    fn voltage(name: &str) -> Variable {
        Variable::voltage(name)
    }

    #[test]
    fn test_value_and_derivatives_follow_sources() {
        let a = Probe::new(2.0);
        let b = Probe::new(5.0);
        let bindings = Bindings::default()
            .with(&voltage("a"), a.source())
            .with(&voltage("b"), b.source());

        for backend in [Backend::Interpreted, Backend::Program, Backend::Jit] {
            let behavior = Behavior::parse(
                "v(a) * v(b) + v(a)^2",
                Environment::new(bindings.clone()),
                BuildOptions::default().with_backend(backend),
            )
            .unwrap();
            assert_eq!(behavior.backend(), backend);

            a.set(2.0);
            b.set(5.0);
            assert_eq!(behavior.value(), 14.0);
            assert_eq!(behavior.jacobian(), vec![9.0, 2.0]);

            a.set(-1.0);
            assert_eq!(behavior.value(), -4.0);
            assert_eq!(behavior.derivative(&voltage("a")), Some(3.0));
            assert_eq!(behavior.derivative(&voltage("c")), None);
        }
    }

    #[test]
    fn test_default_targets_skip_parameters() {
        let bindings = Bindings::default()
            .with(&voltage("a"), Probe::new(1.0).source())
            .with(&Variable::current("r1"), Probe::new(2.0).source())
            .with(&Variable::parameter("gain"), Probe::new(3.0).source());

        let behavior = Behavior::parse(
            "gain * v(a) + i(r1)",
            Environment::new(bindings),
            BuildOptions::default(),
        )
        .unwrap();
        let targets: Vec<_> = behavior.targets().cloned().collect();
        assert_eq!(targets, vec![voltage("a"), Variable::current("r1")]);
        assert_eq!(behavior.jacobian(), vec![3.0, 1.0]);
    }

    #[test]
    fn test_explicit_targets_keep_order() {
        let bindings = Bindings::default()
            .with(&voltage("a"), Probe::new(1.0).source())
            .with(&voltage("b"), Probe::new(2.0).source());

        let behavior = Behavior::build(
            Node::binary(
                BinaryOp::Sub,
                Node::var(voltage("a")),
                Node::var(voltage("b")),
            ),
            Environment::new(bindings),
            BuildOptions::default().with_targets(vec![voltage("b"), voltage("a"), voltage("z")]),
        )
        .unwrap();
        assert_eq!(behavior.jacobian(), vec![-1.0, 1.0, 0.0]);
        assert_eq!(
            behavior.derivative_expression(&voltage("z")),
            Some(&Node::constant(0.0))
        );
    }

    #[test]
    fn test_hook_extends_private_table() {
        let bindings = Bindings::default().with(&voltage("a"), Probe::new(4.0).source());
        let environment = Environment::new(bindings);

        let hook: BuilderHook<f64> = Arc::new(|table: &mut FunctionTable<f64>| {
            table.register(
                "twice",
                Arity::Exactly(1),
                Arc::new(|args: &[f64]| 2.0 * args[0]),
                Some(Arc::new(|_: &[Node]| vec![Node::constant(2.0)])),
            );
        });

        let behavior = Behavior::parse(
            "twice(v(a))",
            environment.clone(),
            BuildOptions::default().with_hook(hook),
        )
        .unwrap();
        assert_eq!(behavior.value(), 8.0);
        assert_eq!(behavior.jacobian(), vec![2.0]);

        assert!(!environment.functions.contains("twice"));
        let result = Behavior::parse("twice(v(a))", environment, BuildOptions::default());
        assert!(matches!(
            result,
            Err(BehaviorError::Expression(ExpressionError::UnknownFunction(_)))
        ));
    }

    #[test]
    fn test_missing_derivative_rule() {
        let bindings = Bindings::default().with(&voltage("a"), Probe::new(1.0).source());
        let hook: BuilderHook<f64> = Arc::new(|table: &mut FunctionTable<f64>| {
            table.register(
                "opaque",
                Arity::Exactly(1),
                Arc::new(|args: &[f64]| args[0]),
                None,
            );
        });
        let result = Behavior::parse(
            "opaque(v(a))",
            Environment::new(bindings),
            BuildOptions::default().with_hook(hook),
        );
        assert!(matches!(
            result,
            Err(BehaviorError::Expression(
                ExpressionError::UndifferentiableFunction(_)
            ))
        ));
    }

    #[test]
    fn test_small_signal() {
        let operating_point = Bindings::default()
            .with(&voltage("a"), Probe::new(Complex64::new(3.0, 0.0)).source())
            .with(&voltage("b"), Probe::new(Complex64::new(2.0, 0.0)).source());

        let behavior = Behavior::parse(
            "v(a) * v(b)",
            Environment::new(operating_point),
            BuildOptions::default(),
        )
        .unwrap();
        assert_eq!(behavior.backend(), Backend::Program);

        let mut excitation = Bindings::default();
        excitation
            .bind_value(&voltage("a"), Complex64::new(0.0, 1.0))
            .bind_value(&voltage("b"), Complex64::new(1.0, 0.0));
        let response = behavior.small_signal(&excitation).unwrap();
        assert_eq!(response, Complex64::new(3.0, 2.0));

        let partial = Bindings::default().with(
            &voltage("a"),
            Probe::new(Complex64::new(1.0, 0.0)).source(),
        );
        assert!(matches!(
            behavior.small_signal(&partial),
            Err(ExpressionError::UnboundVariable(_))
        ));
    }

    #[test]
    fn test_display() {
        colored::control::set_override(false);
        let bindings = Bindings::default().with(&voltage("a"), Probe::new(1.0).source());
        let behavior =
            Behavior::parse("v(a) * 2", Environment::new(bindings), BuildOptions::default())
                .unwrap();
        let text = behavior.to_string();
        assert!(text.contains("Expression: (v(a) * 2)"));
        assert!(text.contains("Targets: [v(a)]"));
        assert!(text.contains("∂/∂v(a) = 2"));
    }
}
