//! Function registration and the default function library.
//!
//! A [`FunctionTable`] maps case-insensitive names to a native implementation, an arity
//! and an optional derivative rule. Calls are resolved against the table when an artifact
//! is built, never when it is evaluated.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::derivative::{difference, negate, product, quotient, sum};
use crate::errors::ExpressionError;
use crate::node::{BinaryOp, Node};
use crate::scalar::{Elementary, Scalar};
use crate::types::{DerivativeRule, NativeFn};

/// Accepted argument counts of a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exactly(usize),
    AtLeast(usize),
}

impl Arity {
    pub fn accepts(self, count: usize) -> bool {
        match self {
            Arity::Exactly(n) => count == n,
            Arity::AtLeast(n) => count >= n,
        }
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arity::Exactly(n) => write!(f, "{n}"),
            Arity::AtLeast(n) => write!(f, "at least {n}"),
        }
    }
}

/// A registered function.
pub struct FunctionDefinition<D> {
    pub arity: Arity,
    pub implementation: NativeFn<D>,
    /// Partial derivatives with respect to each argument, if the function is differentiable
    pub derivative: Option<DerivativeRule>,
}

impl<D> Clone for FunctionDefinition<D> {
    fn clone(&self) -> Self {
        Self {
            arity: self.arity,
            implementation: self.implementation.clone(),
            derivative: self.derivative.clone(),
        }
    }
}

impl<D> fmt::Debug for FunctionDefinition<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionDefinition")
            .field("arity", &self.arity)
            .field("differentiable", &self.derivative.is_some())
            .finish()
    }
}

/// Name to function mapping, looked up case-insensitively.
pub struct FunctionTable<D> {
    functions: BTreeMap<String, FunctionDefinition<D>>,
}

impl<D> Clone for FunctionTable<D> {
    fn clone(&self) -> Self {
        Self {
            functions: self.functions.clone(),
        }
    }
}

impl<D> Default for FunctionTable<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D> fmt::Debug for FunctionTable<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.functions.iter()).finish()
    }
}

impl<D> FunctionTable<D> {
    /// An empty table.
    pub fn new() -> Self {
        Self {
            functions: BTreeMap::new(),
        }
    }

    /// Registers a function, replacing any function of the same name.
    pub fn register(
        &mut self,
        name: &str,
        arity: Arity,
        implementation: NativeFn<D>,
        derivative: Option<DerivativeRule>,
    ) -> &mut Self {
        self.functions.insert(
            name.to_lowercase(),
            FunctionDefinition {
                arity,
                implementation,
                derivative,
            },
        );
        self
    }

    pub fn remove(&mut self, name: &str) -> Option<FunctionDefinition<D>> {
        self.functions.remove(&name.to_lowercase())
    }

    pub fn get(&self, name: &str) -> Option<&FunctionDefinition<D>> {
        self.functions.get(&name.to_lowercase())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    /// Looks up `name` and checks that it accepts `count` arguments.
    pub fn resolve(&self, name: &str, count: usize) -> Result<&FunctionDefinition<D>, ExpressionError> {
        let definition = self
            .get(name)
            .ok_or_else(|| ExpressionError::UnknownFunction(name.to_string()))?;
        if !definition.arity.accepts(count) {
            return Err(ExpressionError::ArityMismatch {
                name: name.to_string(),
                expected: definition.arity.to_string(),
                got: count,
            });
        }
        Ok(definition)
    }
}

fn rule(f: impl Fn(&[Node]) -> Vec<Node> + Send + Sync + 'static) -> Option<DerivativeRule> {
    Some(Arc::new(f))
}

fn call1(name: &str, argument: &Node) -> Node {
    Node::call(name, vec![argument.clone()])
}

fn zero_partials(arguments: &[Node]) -> Vec<Node> {
    vec![Node::constant(0.0); arguments.len()]
}

/// `u(x)` as a node, 1 for a positive real part.
fn step(argument: Node) -> Node {
    Node::call("u", vec![argument])
}

/// `1 - u(x)`.
fn not_step(argument: Node) -> Node {
    difference(Node::constant(1.0), step(argument))
}

/// Derivative rule of a single-argument library function.
fn elementary_rule(function: Elementary) -> Option<DerivativeRule> {
    use Elementary::*;
    match function {
        Sgn | Floor | Ceil | Round | Step => rule(zero_partials),
        Abs => rule(|a| vec![call1("sgn", &a[0])]),
        Sqrt => rule(|a| vec![quotient(Node::constant(0.5), call1("sqrt", &a[0]))]),
        Exp => rule(|a| vec![call1("exp", &a[0])]),
        Ln => rule(|a| vec![quotient(Node::constant(1.0), a[0].clone())]),
        Log10 => rule(|a| {
            vec![quotient(
                Node::constant(1.0),
                product(a[0].clone(), Node::constant(std::f64::consts::LN_10)),
            )]
        }),
        Sin => rule(|a| vec![call1("cos", &a[0])]),
        Cos => rule(|a| vec![negate(call1("sin", &a[0]))]),
        Tan => rule(|a| {
            let cos = call1("cos", &a[0]);
            vec![quotient(Node::constant(1.0), product(cos.clone(), cos))]
        }),
        Asin => rule(|a| {
            vec![quotient(
                Node::constant(1.0),
                call1("sqrt", &difference(Node::constant(1.0), product(a[0].clone(), a[0].clone()))),
            )]
        }),
        Acos => rule(|a| {
            vec![quotient(
                Node::constant(-1.0),
                call1("sqrt", &difference(Node::constant(1.0), product(a[0].clone(), a[0].clone()))),
            )]
        }),
        Atan => rule(|a| {
            vec![quotient(
                Node::constant(1.0),
                sum(Node::constant(1.0), product(a[0].clone(), a[0].clone())),
            )]
        }),
        Sinh => rule(|a| vec![call1("cosh", &a[0])]),
        Cosh => rule(|a| vec![call1("sinh", &a[0])]),
        Tanh => rule(|a| {
            let tanh = call1("tanh", &a[0]);
            vec![difference(Node::constant(1.0), product(tanh.clone(), tanh))]
        }),
    }
}

/// Partials of a left-to-right selection among `arguments`.
///
/// `later_wins(candidate, incumbent)` is the node that is 1 when `candidate` replaces the
/// current selection `incumbent`. Argument `i` is selected when it beats every earlier
/// argument and no later argument beats it.
fn selection_partials(arguments: &[Node], later_wins: fn(&Node, &Node) -> Node) -> Vec<Node> {
    (0..arguments.len())
        .map(|i| {
            let mut partial = Node::constant(1.0);
            for (j, other) in arguments.iter().enumerate() {
                let factor = if j < i {
                    later_wins(&arguments[i], other)
                } else if j > i {
                    difference(Node::constant(1.0), later_wins(other, &arguments[i]))
                } else {
                    continue;
                };
                partial = product(partial, factor);
            }
            partial
        })
        .collect()
}

fn below(candidate: &Node, incumbent: &Node) -> Node {
    step(difference(incumbent.clone(), candidate.clone()))
}

fn above(candidate: &Node, incumbent: &Node) -> Node {
    step(difference(candidate.clone(), incumbent.clone()))
}

const ELEMENTARY: [(&str, Elementary); 20] = [
    ("abs", Elementary::Abs),
    ("sgn", Elementary::Sgn),
    ("sqrt", Elementary::Sqrt),
    ("exp", Elementary::Exp),
    ("log", Elementary::Ln),
    ("ln", Elementary::Ln),
    ("log10", Elementary::Log10),
    ("sin", Elementary::Sin),
    ("cos", Elementary::Cos),
    ("tan", Elementary::Tan),
    ("asin", Elementary::Asin),
    ("acos", Elementary::Acos),
    ("atan", Elementary::Atan),
    ("sinh", Elementary::Sinh),
    ("cosh", Elementary::Cosh),
    ("tanh", Elementary::Tanh),
    ("floor", Elementary::Floor),
    ("ceil", Elementary::Ceil),
    ("round", Elementary::Round),
    ("u", Elementary::Step),
];

impl<D: Scalar> FunctionTable<D> {
    /// The default library: elementary functions, `min`, `max`, `pow`, `pwr` and `limit`.
    ///
    /// Selections (`min`, `max`, `limit`, `u`) compare real parts, so the same table works for
    /// complex values. Their derivative rules are built from `u`, never from ordering
    /// operators.
    pub fn defaults() -> Self {
        let mut table = Self::new();

        for (name, function) in ELEMENTARY {
            table.register(
                name,
                Arity::Exactly(1),
                Arc::new(move |args: &[D]| args[0].elementary(function)),
                elementary_rule(function),
            );
        }

        table.register(
            "min",
            Arity::AtLeast(1),
            Arc::new(|args: &[D]| {
                args.iter()
                    .skip(1)
                    .fold(args[0], |acc, &x| if x.real() < acc.real() { x } else { acc })
            }),
            rule(|a| selection_partials(a, below)),
        );
        table.register(
            "max",
            Arity::AtLeast(1),
            Arc::new(|args: &[D]| {
                args.iter()
                    .skip(1)
                    .fold(args[0], |acc, &x| if x.real() > acc.real() { x } else { acc })
            }),
            rule(|a| selection_partials(a, above)),
        );

        table.register(
            "pow",
            Arity::Exactly(2),
            Arc::new(|args: &[D]| args[0].power(args[1])),
            rule(|a| {
                let (base, exponent) = (&a[0], &a[1]);
                vec![
                    product(
                        product(
                            exponent.clone(),
                            Node::binary(
                                BinaryOp::Pow,
                                base.clone(),
                                difference(exponent.clone(), Node::constant(1.0)),
                            ),
                        ),
                        call1("sgn", base),
                    ),
                    product(
                        Node::binary(BinaryOp::Pow, base.clone(), exponent.clone()),
                        call1("log", &call1("abs", base)),
                    ),
                ]
            }),
        );
        table.register(
            "pwr",
            Arity::Exactly(2),
            Arc::new(|args: &[D]| args[0].elementary(Elementary::Sgn) * args[0].power(args[1])),
            rule(|a| {
                let (base, exponent) = (&a[0], &a[1]);
                vec![
                    product(
                        exponent.clone(),
                        Node::binary(
                            BinaryOp::Pow,
                            base.clone(),
                            difference(exponent.clone(), Node::constant(1.0)),
                        ),
                    ),
                    product(
                        Node::call("pwr", vec![base.clone(), exponent.clone()]),
                        call1("log", &call1("abs", base)),
                    ),
                ]
            }),
        );

        table.register(
            "limit",
            Arity::Exactly(3),
            Arc::new(|args: &[D]| {
                let (x, low, high) = (args[0], args[1], args[2]);
                if x.real() <= low.real() {
                    low
                } else if x.real() > high.real() {
                    high
                } else {
                    x
                }
            }),
            rule(|a| {
                let (x, low, high) = (&a[0], &a[1], &a[2]);
                let above_low = step(difference(x.clone(), low.clone()));
                let above_high = step(difference(x.clone(), high.clone()));
                vec![
                    product(above_low.clone(), not_step(difference(x.clone(), high.clone()))),
                    not_step(difference(x.clone(), low.clone())),
                    product(above_low, above_high),
                ]
            }),
        );

        table
    }
}
