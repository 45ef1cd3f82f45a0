//! Conversion module for transforming expression text into our node representation.
//!
//! Parsing is delegated to evalexpr; this module handles what evalexpr does not know about:
//!
//! - SPICE numeric literals such as `10k`, `2.2u`, `1meg` or `5mA`. They are lifted out of
//!   the text before parsing and restored as exact constants afterwards.
//! - Circuit references `v(a)`, `v(a, b)`, `i(r1)` and their qualified forms
//!   (`vr vi vm vp vdb ir ii im ip idb`). Node names may be numeric, so references are
//!   lifted out as well.
//! - `if(c, a, b)` becomes a ternary and `xor(a, b)` a logical xor.
//!
//! Every other identifier is a parameter variable and every other call a function call.
//!
//! The main entry point is [`parse`]. [`ExpressionCache`] keeps the parsed tree of a
//! component's expression and reparses only after the text changed.

use evalexpr::{build_operator_tree, DefaultNumericTypes, Operator, Value};
use tracing::trace;

use crate::{
    errors::ConvertError,
    node::{BinaryOp, Node, Quantity, UnaryOp, Variable, VariableKind},
};

type ParseNode = evalexpr::Node<DefaultNumericTypes>;

const LITERAL_PREFIX: &str = "__lit";
const REFERENCE_PREFIX: &str = "__ref";

/// Text handed to evalexpr, with the lifted literals and references.
#[derive(Debug, Default)]
struct Lifted {
    text: String,
    literals: Vec<f64>,
    references: Vec<Node>,
}

/// Parses expression text into a node tree.
///
/// # Examples of supported syntax:
/// * Arithmetic: `+ - * / % ^`, unary minus
/// * Comparison and logic: `< > <= >= == != && || !`, `xor(a, b)`
/// * Conditionals: `if(condition, a, b)`
/// * Circuit references: `v(out)`, `v(in, ref)`, `i(vsense)`, `vdb(out)`
/// * Literals with SI suffixes: `4.7k`, `100n`, `1meg`
pub fn parse(text: &str) -> Result<Node, ConvertError> {
    let lifted = lift(text)?;
    trace!(text = %lifted.text, "parsing");
    let tree = build_operator_tree::<DefaultNumericTypes>(&lifted.text)?;
    build_node(&tree, &lifted)
}

fn is_identifier_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

fn is_identifier_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn reference_kind(word: &str) -> Option<(VariableKind, Quantity)> {
    let lower = word.to_lowercase();
    let (kind, qualifier) = match lower.chars().next()? {
        'v' => (VariableKind::Voltage, &lower[1..]),
        'i' => (VariableKind::Current, &lower[1..]),
        _ => return None,
    };
    let quantity = match qualifier {
        "" => Quantity::Value,
        "r" => Quantity::Real,
        "i" => Quantity::Imaginary,
        "m" => Quantity::Magnitude,
        "p" => Quantity::Phase,
        "db" => Quantity::Decibels,
        _ => return None,
    };
    Some((kind, quantity))
}

fn reference_node(
    kind: VariableKind,
    quantity: Quantity,
    arguments: &str,
) -> Result<Node, ConvertError> {
    let names: Vec<&str> = arguments.split(',').map(str::trim).collect();
    let variable = |name: &str| Node::var(Variable::new(name, kind).with_quantity(quantity));
    match (kind, names.as_slice()) {
        (_, [name]) if !name.is_empty() => Ok(variable(*name)),
        (VariableKind::Voltage, [positive, negative]) if !positive.is_empty() && !negative.is_empty() => {
            Ok(Node::binary(BinaryOp::Sub, variable(*positive), variable(*negative)))
        }
        _ => Err(ConvertError::Reference(arguments.to_string())),
    }
}

/// Scans a numeric literal starting at `start`, returning its value and the end index.
fn scan_number(chars: &[char], start: usize) -> Result<(f64, usize), ConvertError> {
    let mut end = start;
    while end < chars.len() && (chars[end].is_ascii_digit() || chars[end] == '.') {
        end += 1;
    }
    if end < chars.len() && matches!(chars[end], 'e' | 'E') {
        let mut exponent = end + 1;
        if exponent < chars.len() && matches!(chars[exponent], '+' | '-') {
            exponent += 1;
        }
        if exponent < chars.len() && chars[exponent].is_ascii_digit() {
            end = exponent;
            while end < chars.len() && chars[end].is_ascii_digit() {
                end += 1;
            }
        }
    }
    let mantissa: String = chars[start..end].iter().collect();
    let value: f64 = mantissa
        .parse()
        .map_err(|_| ConvertError::Literal(mantissa.clone()))?;

    let suffix_start = end;
    while end < chars.len() && chars[end].is_alphabetic() {
        end += 1;
    }
    let suffix: String = chars[suffix_start..end].iter().collect::<String>().to_lowercase();
    let multiplier = if suffix.starts_with("meg") {
        1e6
    } else if suffix.starts_with("mil") {
        25.4e-6
    } else {
        match suffix.chars().next() {
            Some('f') => 1e-15,
            Some('p') => 1e-12,
            Some('n') => 1e-9,
            Some('u') => 1e-6,
            Some('m') => 1e-3,
            Some('k') => 1e3,
            Some('g') => 1e9,
            Some('t') => 1e12,
            _ => 1.0,
        }
    };
    Ok((value * multiplier, end))
}

/// Replaces literals and circuit references with placeholder identifiers.
fn lift(text: &str) -> Result<Lifted, ConvertError> {
    let chars: Vec<char> = text.chars().collect();
    let mut lifted = Lifted::default();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if is_identifier_start(c) {
            let start = i;
            while i < chars.len() && is_identifier_char(chars[i]) {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();

            let mut open = i;
            while open < chars.len() && chars[open].is_whitespace() {
                open += 1;
            }
            if let (Some('('), Some((kind, quantity))) = (chars.get(open), reference_kind(&word)) {
                let close = chars[open..]
                    .iter()
                    .position(|&c| c == ')')
                    .map(|offset| open + offset)
                    .ok_or_else(|| ConvertError::Reference(word.clone()))?;
                let arguments: String = chars[open + 1..close].iter().collect();
                let node = reference_node(kind, quantity, &arguments)?;
                lifted.text.push_str(&format!("{REFERENCE_PREFIX}{}", lifted.references.len()));
                lifted.references.push(node);
                i = close + 1;
                continue;
            }
            lifted.text.push_str(&word);
        } else if c.is_ascii_digit()
            || (c == '.' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit()))
        {
            let (value, end) = scan_number(&chars, i)?;
            lifted.text.push_str(&format!("{LITERAL_PREFIX}{}", lifted.literals.len()));
            lifted.literals.push(value);
            i = end;
        } else {
            lifted.text.push(c);
            i += 1;
        }
    }
    Ok(lifted)
}

fn placeholder(identifier: &str, prefix: &str) -> Option<usize> {
    identifier.strip_prefix(prefix)?.parse().ok()
}

/// Flattens the argument list of an evalexpr function node.
fn arguments<'a>(node: &'a ParseNode) -> Vec<&'a ParseNode> {
    match node.operator() {
        Operator::RootNode if node.children().len() == 1 => arguments(&node.children()[0]),
        Operator::RootNode if node.children().is_empty() => Vec::new(),
        Operator::Tuple => node.children().iter().collect(),
        _ => vec![node],
    }
}

fn operands<'a>(
    node: &'a ParseNode,
    operator: &str,
    expected: usize,
) -> Result<Vec<&'a ParseNode>, ConvertError> {
    let children = node.children();
    if children.len() != expected {
        return Err(ConvertError::Operands {
            operator: operator.to_string(),
            expected,
            got: children.len(),
        });
    }
    Ok(children.iter().collect())
}

fn negate(node: Node, times: usize) -> Node {
    (0..times).fold(node, |operand, _| Node::unary(UnaryOp::Minus, operand))
}

/// Collects the operands of an unparenthesized `^` chain, leftmost base first.
fn power_chain<'a>(node: &'a ParseNode, chain: &mut Vec<&'a ParseNode>) -> Result<(), ConvertError> {
    let children = operands(node, "^", 2)?;
    if children[0].operator() == &Operator::Exp {
        power_chain(children[0], chain)?;
    } else {
        chain.push(children[0]);
    }
    chain.push(children[1]);
    Ok(())
}

/// Builds `^` right-associative, with `negations` unary minuses applied to the base.
///
/// evalexpr associates `^` to the left and binds it tighter than unary minus, so
/// `2^3^2` and `-2^2` arrive as `(2^3)^2` and `-(2^2)`. Parenthesized groups stay behind
/// a root node and are not part of the chain.
fn build_power(node: &ParseNode, lifted: &Lifted, negations: usize) -> Result<Node, ConvertError> {
    let mut chain = Vec::new();
    power_chain(node, &mut chain)?;
    let factors = chain
        .into_iter()
        .enumerate()
        .map(|(index, operand)| -> Result<Node, ConvertError> {
            let built = build_node(operand, lifted)?;
            Ok(if index == 0 { negate(built, negations) } else { built })
        })
        .collect::<Result<Vec<_>, _>>()?;
    factors
        .into_iter()
        .rev()
        .reduce(|exponent, base| Node::binary(BinaryOp::Pow, base, exponent))
        .ok_or_else(|| ConvertError::Operands {
            operator: "^".to_string(),
            expected: 2,
            got: 0,
        })
}

/// Converts an evalexpr operator tree into a node tree.
///
/// This function recursively traverses the evalexpr tree, restoring the literals and
/// references that [`lift`] replaced.
fn build_node(node: &ParseNode, lifted: &Lifted) -> Result<Node, ConvertError> {
    let binary = |op: BinaryOp, symbol: &str| -> Result<Node, ConvertError> {
        let children = operands(node, symbol, 2)?;
        Ok(Node::binary(
            op,
            build_node(children[0], lifted)?,
            build_node(children[1], lifted)?,
        ))
    };

    match node.operator() {
        Operator::RootNode => {
            let children = node.children();
            if children.len() == 1 {
                build_node(&children[0], lifted)
            } else {
                Err(ConvertError::RootNode(format!("{} children", children.len())))
            }
        }
        // Add and Mul may carry more than two children; fold them left to right
        Operator::Add | Operator::Mul => {
            let (op, symbol) = match node.operator() {
                Operator::Add => (BinaryOp::Add, "+"),
                _ => (BinaryOp::Mul, "*"),
            };
            let children = node.children();
            if children.len() < 2 {
                return Err(ConvertError::Operands {
                    operator: symbol.to_string(),
                    expected: 2,
                    got: children.len(),
                });
            }
            children
                .iter()
                .skip(1)
                .try_fold(build_node(&children[0], lifted)?, |acc, child| -> Result<Node, ConvertError> {
                    Ok(Node::binary(op, acc, build_node(child, lifted)?))
                })
        }
        Operator::Sub => binary(BinaryOp::Sub, "-"),
        Operator::Div => binary(BinaryOp::Div, "/"),
        Operator::Mod => binary(BinaryOp::Mod, "%"),
        Operator::Exp => build_power(node, lifted, 0),
        Operator::Eq => binary(BinaryOp::Eq, "=="),
        Operator::Neq => binary(BinaryOp::Ne, "!="),
        Operator::Gt => binary(BinaryOp::Gt, ">"),
        Operator::Lt => binary(BinaryOp::Lt, "<"),
        Operator::Geq => binary(BinaryOp::Ge, ">="),
        Operator::Leq => binary(BinaryOp::Le, "<="),
        Operator::And => binary(BinaryOp::And, "&&"),
        Operator::Or => binary(BinaryOp::Or, "||"),
        Operator::Neg => {
            let mut negations = 1;
            let mut operand = operands(node, "-", 1)?[0];
            while operand.operator() == &Operator::Neg {
                negations += 1;
                operand = operands(operand, "-", 1)?[0];
            }
            if operand.operator() == &Operator::Exp {
                build_power(operand, lifted, negations)
            } else {
                Ok(negate(build_node(operand, lifted)?, negations))
            }
        }
        Operator::Not => {
            let children = operands(node, "!", 1)?;
            Ok(Node::unary(UnaryOp::Not, build_node(children[0], lifted)?))
        }
        Operator::Const { value } => match value {
            Value::Float(f) => Ok(Node::constant(*f)),
            Value::Int(i) => Ok(Node::constant(*i as f64)),
            Value::Boolean(b) => Ok(Node::constant(if *b { 1.0 } else { 0.0 })),
            _ => Err(ConvertError::ConstOperator(format!("{value:?}"))),
        },
        Operator::VariableIdentifierRead { identifier } => {
            if let Some(index) = placeholder(identifier, LITERAL_PREFIX) {
                return lifted
                    .literals
                    .get(index)
                    .map(|value| Node::constant(*value))
                    .ok_or_else(|| ConvertError::Literal(identifier.to_string()));
            }
            if let Some(index) = placeholder(identifier, REFERENCE_PREFIX) {
                return lifted
                    .references
                    .get(index)
                    .cloned()
                    .ok_or_else(|| ConvertError::Reference(identifier.to_string()));
            }
            Ok(Node::var(Variable::parameter(identifier.as_str())))
        }
        Operator::FunctionIdentifier { identifier } => {
            let args = match node.children().first() {
                Some(child) => arguments(child),
                None => Vec::new(),
            };
            let converted = args
                .into_iter()
                .map(|argument| build_node(argument, lifted))
                .collect::<Result<Vec<_>, _>>()?;
            let got = converted.len();
            let operands_error = |operator: &str, expected: usize| ConvertError::Operands {
                operator: operator.to_string(),
                expected,
                got,
            };

            match identifier.to_lowercase().as_str() {
                "if" => {
                    let [condition, if_true, if_false]: [Node; 3] =
                        converted.try_into().map_err(|_| operands_error("if", 3))?;
                    Ok(Node::ternary(condition, if_true, if_false))
                }
                "xor" => {
                    let [left, right]: [Node; 2] =
                        converted.try_into().map_err(|_| operands_error("xor", 2))?;
                    Ok(Node::binary(BinaryOp::Xor, left, right))
                }
                _ => Ok(Node::call(identifier.as_str(), converted)),
            }
        }
        other => Err(ConvertError::UnsupportedOperator(format!("{other:?}"))),
    }
}

/// Holds the text of an expression and the tree parsed from it.
///
/// Setting the same text again keeps the parsed tree; changing it marks the cache dirty
/// and the next [`ExpressionCache::node`] reparses.
#[derive(Debug, Default, Clone)]
pub struct ExpressionCache {
    text: Option<String>,
    node: Option<Node>,
}

impl ExpressionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the expression text. Returns true if the text changed.
    pub fn set_text(&mut self, text: &str) -> bool {
        if self.text.as_deref() == Some(text) {
            return false;
        }
        self.text = Some(text.to_string());
        self.node = None;
        true
    }

    pub fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }

    /// Returns true if the next read reparses.
    pub fn is_dirty(&self) -> bool {
        self.text.is_some() && self.node.is_none()
    }

    /// Returns the parsed tree, parsing the current text if needed.
    ///
    /// Returns `Ok(None)` when no text has been set.
    pub fn node(&mut self) -> Result<Option<&Node>, ConvertError> {
        if self.node.is_none() {
            if let Some(text) = &self.text {
                let node = parse(text)?;
                self.node = Some(node);
            }
        }
        Ok(self.node.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(name: &str) -> Node {
        Node::var(Variable::voltage(name))
    }

    #[test]
    fn test_arithmetic() {
        let node = parse("2*x + y^2").unwrap();
        assert_eq!(
            node,
            Node::binary(
                BinaryOp::Add,
                Node::binary(
                    BinaryOp::Mul,
                    Node::constant(2.0),
                    Node::var(Variable::parameter("x"))
                ),
                Node::binary(
                    BinaryOp::Pow,
                    Node::var(Variable::parameter("y")),
                    Node::constant(2.0)
                ),
            )
        );
    }

    #[test]
    fn test_power_binds_right_and_below_unary_minus() {
        let two = || Node::constant(2.0);
        let three = || Node::constant(3.0);
        let pow = |base, exponent| Node::binary(BinaryOp::Pow, base, exponent);
        let minus = |operand| Node::unary(UnaryOp::Minus, operand);

        assert_eq!(parse("2^3^2").unwrap(), pow(two(), pow(three(), two())));
        assert_eq!(parse("(2^3)^2").unwrap(), pow(pow(two(), three()), two()));
        assert_eq!(parse("-2^2").unwrap(), pow(minus(two()), two()));
        assert_eq!(parse("-(2^2)").unwrap(), minus(pow(two(), two())));
        assert_eq!(
            parse("-2^3^2").unwrap(),
            pow(minus(two()), pow(three(), two()))
        );
        assert_eq!(
            parse("1 - v(a)^2").unwrap(),
            Node::binary(BinaryOp::Sub, Node::constant(1.0), pow(v("a"), two()))
        );
    }

    #[test]
    fn test_dangling_operators_are_errors() {
        for text in ["v(a) +", "v(a) *", "* v(a)"] {
            assert!(parse(text).is_err(), "{text}");
        }
    }

    #[test]
    fn test_si_literals() {
        let cases = [
            ("10k", 10e3),
            ("2.2u", 2.2e-6),
            ("1meg", 1e6),
            ("5mA", 5e-3),
            ("3.3V", 3.3),
            ("1e-3", 1e-3),
            ("47p", 47e-12),
            (".5", 0.5),
        ];
        for (text, expected) in cases {
            let node = parse(text).unwrap();
            let value = node.as_constant().unwrap();
            assert!((value - expected).abs() <= 1e-15 * expected.abs(), "{text}: {value}");
        }
    }

    #[test]
    fn test_circuit_references() {
        assert_eq!(parse("v(out)").unwrap(), v("out"));
        assert_eq!(
            parse("V(in, 0) * 2").unwrap(),
            Node::binary(
                BinaryOp::Mul,
                Node::binary(BinaryOp::Sub, v("in"), v("0")),
                Node::constant(2.0)
            )
        );
        assert_eq!(parse("i(R1)").unwrap(), Node::var(Variable::current("R1")));
        assert_eq!(
            parse("vdb(out)").unwrap(),
            Node::var(Variable::voltage("out").with_quantity(Quantity::Decibels))
        );
        assert_eq!(
            parse("ir(vsense)").unwrap(),
            Node::var(Variable::current("vsense").with_quantity(Quantity::Real))
        );
        assert!(matches!(parse("i(a, b)"), Err(ConvertError::Reference(_))));
    }

    #[test]
    fn test_conditionals_and_calls() {
        let node = parse("if(v(a) > 1, exp(v(a)), xor(v(a), 0))").unwrap();
        match node {
            Node::Ternary(condition, if_true, if_false) => {
                assert_eq!(
                    *condition,
                    Node::binary(BinaryOp::Gt, v("a"), Node::constant(1.0))
                );
                assert_eq!(*if_true, Node::call("exp", vec![v("a")]));
                assert_eq!(
                    *if_false,
                    Node::binary(BinaryOp::Xor, v("a"), Node::constant(0.0))
                );
            }
            other => panic!("expected a ternary, got {other}"),
        }

        assert_eq!(
            parse("max(v(a), 1, 2)").unwrap(),
            Node::call("max", vec![v("a"), Node::constant(1.0), Node::constant(2.0)])
        );
        assert!(matches!(parse("if(1, 2)"), Err(ConvertError::Operands { .. })));
    }

    #[test]
    fn test_logic_operators() {
        let node = parse("!(v(a) >= 1) && v(b) != 2 || v(c) == 3").unwrap();
        assert_eq!(node.variables(Default::default()).len(), 3);
        assert!(parse("v(a) +").is_err());
    }

    #[test]
    fn test_expression_cache() {
        let mut cache = ExpressionCache::new();
        assert!(cache.node().unwrap().is_none());

        assert!(cache.set_text("v(a) * 2"));
        assert!(cache.is_dirty());
        assert!(cache.node().unwrap().is_some());
        assert!(!cache.is_dirty());

        assert!(!cache.set_text("v(a) * 2"));
        assert!(!cache.is_dirty());

        assert!(cache.set_text("v(b)"));
        assert!(cache.is_dirty());
        assert_eq!(cache.node().unwrap(), Some(&v("b")));
    }
}
