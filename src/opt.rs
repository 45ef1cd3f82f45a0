//! Lightweight tree optimiser shared by the compiled backends.
//!
//! Pass pipeline
//! -------------
//!  1. **fold_constants**   – evaluate constant sub-trees with the domain primitives and
//!                            pick the taken side of ternaries with a constant condition.
//!  2. **drop_neutral**     – remove `+ 0`, `- 0` and `* 1`.
//!
//! Both passes evaluate through [`Scalar`], so a folded tree computes exactly what the
//! interpreter computes on the unfolded one. Calls are never folded: a registered function
//! may read state. Ordering comparisons in unordered domains are left in place so that
//! validation still reports them.

use crate::node::{BinaryOp, Node, UnaryOp};
use crate::numeric::Tolerances;
use crate::scalar::Scalar;

/// Run all passes on `node`.
pub fn optimize<D: Scalar>(node: &Node, tolerances: &Tolerances) -> Node {
    drop_neutral(fold_constants::<D>(node, tolerances))
}

/// Converts a domain value back to a literal, if it is representable as one.
fn literal<D: Scalar>(value: D) -> Option<Node> {
    let real = value.real();
    (D::from_real(real) == value).then_some(Node::Constant(real))
}

// ────────────────────────────────────────────────────────────────────────────
//  Pass 1 – constant folding
// ────────────────────────────────────────────────────────────────────────────
pub fn fold_constants<D: Scalar>(node: &Node, tolerances: &Tolerances) -> Node {
    match node {
        Node::Constant(_) | Node::Variable(_) => node.clone(),

        Node::Unary(op, operand) => {
            let operand = fold_constants::<D>(operand, tolerances);
            if let Some(value) = operand.as_constant() {
                let value = D::from_real(value);
                let folded = match op {
                    UnaryOp::Plus => value,
                    UnaryOp::Minus => -value,
                    UnaryOp::Not => D::from_bool(!value.is_true()),
                };
                if let Some(literal) = literal(folded) {
                    return literal;
                }
            }
            Node::unary(*op, operand)
        }

        Node::Binary(op, left, right) => {
            let left = fold_constants::<D>(left, tolerances);
            let right = fold_constants::<D>(right, tolerances);
            if let (Some(l), Some(r)) = (left.as_constant(), right.as_constant()) {
                if let Some(literal) = fold_binary::<D>(*op, D::from_real(l), D::from_real(r), tolerances)
                    .and_then(literal)
                {
                    return literal;
                }
            }
            Node::binary(*op, left, right)
        }

        Node::Ternary(condition, if_true, if_false) => {
            let condition = fold_constants::<D>(condition, tolerances);
            match condition.as_constant() {
                Some(value) if D::from_real(value).is_true() => fold_constants::<D>(if_true, tolerances),
                Some(_) => fold_constants::<D>(if_false, tolerances),
                None => Node::ternary(
                    condition,
                    fold_constants::<D>(if_true, tolerances),
                    fold_constants::<D>(if_false, tolerances),
                ),
            }
        }

        Node::Call(name, arguments) => Node::Call(
            name.clone(),
            arguments
                .iter()
                .map(|argument| fold_constants::<D>(argument, tolerances))
                .collect(),
        ),
        Node::Extension(name, arguments) => Node::Extension(
            name.clone(),
            arguments
                .iter()
                .map(|argument| fold_constants::<D>(argument, tolerances))
                .collect(),
        ),
    }
}

fn fold_binary<D: Scalar>(op: BinaryOp, left: D, right: D, tolerances: &Tolerances) -> Option<D> {
    Some(match op {
        BinaryOp::Add => left + right,
        BinaryOp::Sub => left - right,
        BinaryOp::Mul => left * right,
        BinaryOp::Div => left.safe_divide(right, tolerances.fudge_factor),
        BinaryOp::Mod => left.modulo(right),
        BinaryOp::Pow => left.power(right),
        BinaryOp::Lt | BinaryOp::Gt | BinaryOp::Le | BinaryOp::Ge => {
            D::from_bool(D::compare(op, left, right).ok()?)
        }
        BinaryOp::Eq => D::from_bool(left.fuzzy_equals(right, tolerances)),
        BinaryOp::Ne => D::from_bool(!left.fuzzy_equals(right, tolerances)),
        BinaryOp::And => D::from_bool(left.is_true() && right.is_true()),
        BinaryOp::Or => D::from_bool(left.is_true() || right.is_true()),
        BinaryOp::Xor => D::from_bool(left.is_true() != right.is_true()),
    })
}

// ────────────────────────────────────────────────────────────────────────────
//  Pass 2 – neutral element elimination
// ────────────────────────────────────────────────────────────────────────────
pub fn drop_neutral(node: Node) -> Node {
    match node {
        Node::Binary(op, left, right) => {
            let left = drop_neutral(*left);
            let right = drop_neutral(*right);
            match op {
                BinaryOp::Add if right.is_constant_value(0.0) => left,
                BinaryOp::Add if left.is_constant_value(0.0) => right,
                BinaryOp::Sub if right.is_constant_value(0.0) => left,
                BinaryOp::Mul if right.is_constant_value(1.0) => left,
                BinaryOp::Mul if left.is_constant_value(1.0) => right,
                _ => Node::binary(op, left, right),
            }
        }
        Node::Unary(op, operand) => Node::unary(op, drop_neutral(*operand)),
        Node::Ternary(condition, if_true, if_false) => Node::ternary(
            drop_neutral(*condition),
            drop_neutral(*if_true),
            drop_neutral(*if_false),
        ),
        Node::Call(name, arguments) => {
            Node::Call(name, arguments.into_iter().map(drop_neutral).collect())
        }
        Node::Extension(name, arguments) => {
            Node::Extension(name, arguments.into_iter().map(drop_neutral).collect())
        }
        leaf => leaf,
    }
}
