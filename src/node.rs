//! Node module for representing behavioral expressions.
//!
//! This module defines the expression tree consumed by every backend of the crate:
//!
//! - `Node`: An enum representing the different kinds of expression nodes
//! - `Variable`: A reference to a circuit unknown or a parameter
//! - `UnaryOp` / `BinaryOp`: The operator vocabulary of the expression language
//!
//! The tree is built recursively using `Box<Node>` for nested expressions and is never
//! mutated once constructed. It can be:
//! - Evaluated by the tree-walking [`Interpreter`](crate::interpreter::Interpreter)
//! - Flattened into a [`Program`](crate::program::Program)
//! - JIT compiled into machine code using Cranelift
//! - Symbolically differentiated to compute Jacobian entries
//!
//! # Expression Tree Structure
//! - Leaf nodes: Constants and Variables
//! - Unary operations: Plus, Minus, Not
//! - Binary operations: arithmetic, relational, equality, logical and power
//! - Ternary conditionals and function calls
//! - Extension nodes that only a configured interpreter understands

use std::collections::HashSet;
use std::fmt;

use crate::binding::{NameComparison, VariableKey};

/// The kind of circuit quantity a variable refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum VariableKind {
    /// A node voltage, written `v(node)` in expressions
    Voltage,
    /// A branch current, written `i(name)` in expressions
    Current,
    /// Any other named quantity
    Parameter,
}

/// Qualifies which part of a (possibly complex) quantity is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum Quantity {
    /// The quantity itself
    #[default]
    Value,
    /// Real part (`vr`, `ir`)
    Real,
    /// Imaginary part (`vi`, `ii`)
    Imaginary,
    /// Magnitude (`vm`, `im`)
    Magnitude,
    /// Phase (`vp`, `ip`)
    Phase,
    /// Magnitude in decibels (`vdb`, `idb`)
    Decibels,
}

/// A reference to a value that is looked up in the binding map at build time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Variable {
    pub name: String,
    pub kind: VariableKind,
    pub quantity: Quantity,
}

impl Variable {
    pub fn new(name: impl Into<String>, kind: VariableKind) -> Self {
        Self {
            name: name.into(),
            kind,
            quantity: Quantity::Value,
        }
    }

    pub fn voltage(name: impl Into<String>) -> Self {
        Self::new(name, VariableKind::Voltage)
    }

    pub fn current(name: impl Into<String>) -> Self {
        Self::new(name, VariableKind::Current)
    }

    pub fn parameter(name: impl Into<String>) -> Self {
        Self::new(name, VariableKind::Parameter)
    }

    pub fn with_quantity(mut self, quantity: Quantity) -> Self {
        self.quantity = quantity;
        self
    }

    /// Returns true for voltages and currents, the unknowns a solver needs derivatives for.
    pub fn is_unknown(&self) -> bool {
        matches!(self.kind, VariableKind::Voltage | VariableKind::Current)
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let suffix = match self.quantity {
            Quantity::Value => "",
            Quantity::Real => "r",
            Quantity::Imaginary => "i",
            Quantity::Magnitude => "m",
            Quantity::Phase => "p",
            Quantity::Decibels => "db",
        };
        match self.kind {
            VariableKind::Voltage => write!(f, "v{suffix}({})", self.name),
            VariableKind::Current => write!(f, "i{suffix}({})", self.name),
            VariableKind::Parameter => write!(f, "{}", self.name),
        }
    }
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Plus,
    Minus,
    Not,
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
    And,
    Or,
    Xor,
    Pow,
}

impl BinaryOp {
    /// The infix symbol used when displaying the operator.
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Lt => "<",
            BinaryOp::Gt => ">",
            BinaryOp::Le => "<=",
            BinaryOp::Ge => ">=",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
            BinaryOp::Xor => "^^",
            BinaryOp::Pow => "^",
        }
    }

    /// Ordering comparisons, which need a totally ordered domain.
    pub fn is_ordering(self) -> bool {
        matches!(self, BinaryOp::Lt | BinaryOp::Gt | BinaryOp::Le | BinaryOp::Ge)
    }

    /// Operators whose result is a `1.0`/`0.0` flag.
    pub fn is_logical(self) -> bool {
        matches!(
            self,
            BinaryOp::Lt
                | BinaryOp::Gt
                | BinaryOp::Le
                | BinaryOp::Ge
                | BinaryOp::Eq
                | BinaryOp::Ne
                | BinaryOp::And
                | BinaryOp::Or
                | BinaryOp::Xor
        )
    }
}

/// An expression tree node.
///
/// Trees are plain values: children are owned through `Box`/`Vec`, so a tree has no cycles
/// and no shared mutable parts.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// A literal value
    Constant(f64),
    /// A circuit unknown or parameter
    Variable(Variable),
    /// A unary operation
    Unary(UnaryOp, Box<Node>),
    /// A binary operation
    Binary(BinaryOp, Box<Node>, Box<Node>),
    /// `condition ? if_true : if_false`
    Ternary(Box<Node>, Box<Node>, Box<Node>),
    /// A call to a function of the function table
    Call(String, Vec<Node>),
    /// A node kind the core does not know; see [`crate::interpreter::ExtensionHandler`]
    Extension(String, Vec<Node>),
}

impl Node {
    pub fn constant(value: f64) -> Node {
        Node::Constant(value)
    }

    pub fn var(variable: Variable) -> Node {
        Node::Variable(variable)
    }

    pub fn unary(op: UnaryOp, operand: Node) -> Node {
        Node::Unary(op, Box::new(operand))
    }

    pub fn binary(op: BinaryOp, left: Node, right: Node) -> Node {
        Node::Binary(op, Box::new(left), Box::new(right))
    }

    pub fn ternary(condition: Node, if_true: Node, if_false: Node) -> Node {
        Node::Ternary(Box::new(condition), Box::new(if_true), Box::new(if_false))
    }

    pub fn call(name: impl Into<String>, arguments: Vec<Node>) -> Node {
        Node::Call(name.into(), arguments)
    }

    /// Returns the literal value if this node is a constant.
    pub fn as_constant(&self) -> Option<f64> {
        match self {
            Node::Constant(value) => Some(*value),
            _ => None,
        }
    }

    /// Returns true if this node is the constant `value`.
    pub fn is_constant_value(&self, value: f64) -> bool {
        self.as_constant() == Some(value)
    }

    /// Direct children of this node, in evaluation order.
    pub fn children(&self) -> Vec<&Node> {
        match self {
            Node::Constant(_) | Node::Variable(_) => Vec::new(),
            Node::Unary(_, operand) => vec![operand],
            Node::Binary(_, left, right) => vec![left, right],
            Node::Ternary(condition, if_true, if_false) => vec![condition, if_true, if_false],
            Node::Call(_, arguments) | Node::Extension(_, arguments) => arguments.iter().collect(),
        }
    }

    /// Returns the unique variables of the tree in first-seen order (left to right).
    ///
    /// Uniqueness follows `comparison`, so with the default case-insensitive comparer
    /// `v(OUT)` and `v(out)` are reported once.
    pub fn variables(&self, comparison: NameComparison) -> Vec<Variable> {
        let mut seen: HashSet<VariableKey> = HashSet::new();
        let mut found = Vec::new();
        self.collect_variables(comparison, &mut seen, &mut found);
        found
    }

    fn collect_variables(
        &self,
        comparison: NameComparison,
        seen: &mut HashSet<VariableKey>,
        found: &mut Vec<Variable>,
    ) {
        if let Node::Variable(variable) = self {
            if seen.insert(comparison.key(variable)) {
                found.push(variable.clone());
            }
            return;
        }
        for child in self.children() {
            child.collect_variables(comparison, seen, found);
        }
    }

    /// Names of the voltage nodes referenced by the expression.
    pub fn voltage_nodes(&self, comparison: NameComparison) -> Vec<String> {
        self.variables(comparison)
            .into_iter()
            .filter(|v| v.kind == VariableKind::Voltage)
            .map(|v| v.name)
            .collect()
    }

    /// Names of the branches whose current is referenced by the expression.
    pub fn current_nodes(&self, comparison: NameComparison) -> Vec<String> {
        self.variables(comparison)
            .into_iter()
            .filter(|v| v.kind == VariableKind::Current)
            .map(|v| v.name)
            .collect()
    }

    /// Returns true if `variable` occurs anywhere in the tree.
    pub fn depends_on(&self, variable: &Variable, comparison: NameComparison) -> bool {
        match self {
            Node::Variable(v) => comparison.same(v, variable),
            _ => self
                .children()
                .into_iter()
                .any(|child| child.depends_on(variable, comparison)),
        }
    }

    /// Returns true if the tree contains no variables, calls or extension nodes.
    pub fn is_constant(&self) -> bool {
        match self {
            Node::Constant(_) => true,
            Node::Variable(_) | Node::Call(..) | Node::Extension(..) => false,
            _ => self.children().into_iter().all(Node::is_constant),
        }
    }

    /// Number of nodes in the tree.
    pub fn size(&self) -> usize {
        1 + self.children().into_iter().map(Node::size).sum::<usize>()
    }
}

/// Implements string formatting for nodes.
///
/// - Constants are formatted as numbers
/// - Variables use their circuit notation (`v(a)`, `i(r1)`, `x`)
/// - Unary and binary operations are wrapped in parentheses
/// - Ternaries use `c ? a : b`
/// - Calls and extensions use function call notation
impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::Constant(value) => write!(f, "{value}"),
            Node::Variable(variable) => write!(f, "{variable}"),
            Node::Unary(UnaryOp::Plus, operand) => write!(f, "+({operand})"),
            Node::Unary(UnaryOp::Minus, operand) => write!(f, "-({operand})"),
            Node::Unary(UnaryOp::Not, operand) => write!(f, "!({operand})"),
            Node::Binary(op, left, right) => write!(f, "({left} {} {right})", op.symbol()),
            Node::Ternary(condition, if_true, if_false) => {
                write!(f, "({condition} ? {if_true} : {if_false})")
            }
            Node::Call(name, arguments) | Node::Extension(name, arguments) => {
                write!(f, "{name}(")?;
                for (i, argument) in arguments.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{argument}")?;
                }
                write!(f, ")")
            }
        }
    }
}
