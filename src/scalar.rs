//! Scalar domains evaluated by the crate.
//!
//! Every evaluator is generic over a [`Scalar`]: `f64` for the DC/transient operating point
//! and [`Complex64`] for small-signal analysis. The trait carries the arithmetic, the
//! numeric safety primitives and the domain policy (truthiness, ordering), so the
//! interpreter and the flattened program never special-case a domain.

use std::fmt;
use std::ops::{Add, Mul, Neg, Sub};

use num_complex::Complex64;

use crate::callable::Callable;
use crate::errors::{BehaviorError, ExpressionError};
use crate::interpreter::Environment;
use crate::node::{BinaryOp, Node};
use crate::numeric::{self, Tolerances};

/// Single-argument functions of the default library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Elementary {
    Abs,
    Sgn,
    Sqrt,
    Exp,
    Ln,
    Log10,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Sinh,
    Cosh,
    Tanh,
    Floor,
    Ceil,
    Round,
    Step,
}

/// A value domain the evaluators can work in.
pub trait Scalar:
    Copy
    + fmt::Debug
    + fmt::Display
    + PartialEq
    + Send
    + Sync
    + 'static
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Neg<Output = Self>
{
    /// Name used in error messages.
    const DOMAIN: &'static str;
    /// Whether `<`, `>`, `<=` and `>=` are defined.
    const ORDERED: bool;

    fn from_real(value: f64) -> Self;

    /// The real part, used for truthiness and for selections such as `min` and `u`.
    fn real(self) -> f64;

    fn is_true(self) -> bool {
        self.real() > 0.5
    }

    fn from_bool(flag: bool) -> Self {
        Self::from_real(if flag { 1.0 } else { 0.0 })
    }

    fn safe_divide(self, denominator: Self, fudge: f64) -> Self;

    fn power(self, exponent: Self) -> Self;

    fn fuzzy_equals(self, other: Self, tolerances: &Tolerances) -> bool;

    fn modulo(self, other: Self) -> Self;

    /// Evaluates an ordering comparison, failing for unordered domains.
    fn compare(op: BinaryOp, left: Self, right: Self) -> Result<bool, ExpressionError>;

    fn elementary(self, function: Elementary) -> Self;

    /// Compiles `node` to native code, if the domain has a native backend.
    ///
    /// Returns `None` when the domain only supports the portable backends.
    fn compile_native(
        _node: &Node,
        _environment: &Environment<Self>,
    ) -> Option<Result<Box<dyn Callable<Self>>, BehaviorError>> {
        None
    }
}

pub(crate) fn unsupported_for<D: Scalar>(op: BinaryOp) -> ExpressionError {
    ExpressionError::UnsupportedOperatorForDomain {
        operator: op.symbol().to_string(),
        domain: D::DOMAIN,
    }
}

fn sign(value: f64) -> f64 {
    if value > 0.0 {
        1.0
    } else if value < 0.0 {
        -1.0
    } else {
        0.0
    }
}

impl Scalar for f64 {
    const DOMAIN: &'static str = "real";
    const ORDERED: bool = true;

    fn from_real(value: f64) -> Self {
        value
    }

    fn real(self) -> f64 {
        self
    }

    fn safe_divide(self, denominator: Self, fudge: f64) -> Self {
        numeric::safe_divide(self, denominator, fudge)
    }

    fn power(self, exponent: Self) -> Self {
        numeric::power(self, exponent)
    }

    fn fuzzy_equals(self, other: Self, tolerances: &Tolerances) -> bool {
        numeric::fuzzy_equals(
            self,
            other,
            tolerances.relative_tolerance,
            tolerances.absolute_tolerance,
        )
    }

    fn modulo(self, other: Self) -> Self {
        numeric::modulo(self, other)
    }

    fn compare(op: BinaryOp, left: Self, right: Self) -> Result<bool, ExpressionError> {
        match op {
            BinaryOp::Lt => Ok(left < right),
            BinaryOp::Gt => Ok(left > right),
            BinaryOp::Le => Ok(left <= right),
            BinaryOp::Ge => Ok(left >= right),
            _ => Err(ExpressionError::UnrecognizedNode(format!(
                "'{}' is not an ordering comparison",
                op.symbol()
            ))),
        }
    }

    fn elementary(self, function: Elementary) -> Self {
        match function {
            Elementary::Abs => self.abs(),
            Elementary::Sgn => sign(self),
            Elementary::Sqrt => self.sqrt(),
            Elementary::Exp => self.exp(),
            Elementary::Ln => self.ln(),
            Elementary::Log10 => self.log10(),
            Elementary::Sin => self.sin(),
            Elementary::Cos => self.cos(),
            Elementary::Tan => self.tan(),
            Elementary::Asin => self.asin(),
            Elementary::Acos => self.acos(),
            Elementary::Atan => self.atan(),
            Elementary::Sinh => self.sinh(),
            Elementary::Cosh => self.cosh(),
            Elementary::Tanh => self.tanh(),
            Elementary::Floor => self.floor(),
            Elementary::Ceil => self.ceil(),
            Elementary::Round => self.round(),
            Elementary::Step => Self::from_bool(self > 0.0),
        }
    }

    fn compile_native(
        node: &Node,
        environment: &Environment<Self>,
    ) -> Option<Result<Box<dyn Callable<Self>>, BehaviorError>> {
        Some(
            crate::builder::compile(node, environment)
                .map(|compiled| Box::new(compiled) as Box<dyn Callable<f64>>),
        )
    }
}

/// Reflects a complex base into the right half-plane, the complex analogue of `|x|`.
fn reflect(base: Complex64) -> Complex64 {
    if base.re >= 0.0 {
        base
    } else {
        -base
    }
}

impl Scalar for Complex64 {
    const DOMAIN: &'static str = "complex";
    const ORDERED: bool = false;

    fn from_real(value: f64) -> Self {
        Complex64::new(value, 0.0)
    }

    fn real(self) -> f64 {
        self.re
    }

    fn safe_divide(self, denominator: Self, fudge: f64) -> Self {
        let re = if denominator.re >= 0.0 {
            denominator.re + fudge
        } else {
            denominator.re - fudge
        };
        let adjusted = Complex64::new(re, denominator.im);
        if adjusted.re == 0.0 && adjusted.im == 0.0 {
            Complex64::new(f64::INFINITY, 0.0)
        } else {
            self / adjusted
        }
    }

    fn power(self, exponent: Self) -> Self {
        if exponent.im == 0.0 {
            if exponent.re == 0.0 {
                return Complex64::new(1.0, 0.0);
            } else if exponent.re == 1.0 {
                return reflect(self);
            } else if exponent.re == 2.0 {
                return self * self;
            }
        }
        reflect(self).powc(exponent)
    }

    fn fuzzy_equals(self, other: Self, tolerances: &Tolerances) -> bool {
        let scale = self.norm().max(other.norm());
        (self - other).norm()
            <= (tolerances.relative_tolerance * scale).max(tolerances.absolute_tolerance)
    }

    fn modulo(self, other: Self) -> Self {
        self % other
    }

    fn compare(op: BinaryOp, _left: Self, _right: Self) -> Result<bool, ExpressionError> {
        Err(unsupported_for::<Self>(op))
    }

    fn elementary(self, function: Elementary) -> Self {
        match function {
            Elementary::Abs => Complex64::new(self.norm(), 0.0),
            Elementary::Sgn => Complex64::new(sign(self.re), 0.0),
            Elementary::Sqrt => self.sqrt(),
            Elementary::Exp => self.exp(),
            Elementary::Ln => self.ln(),
            Elementary::Log10 => self.log10(),
            Elementary::Sin => self.sin(),
            Elementary::Cos => self.cos(),
            Elementary::Tan => self.tan(),
            Elementary::Asin => self.asin(),
            Elementary::Acos => self.acos(),
            Elementary::Atan => self.atan(),
            Elementary::Sinh => self.sinh(),
            Elementary::Cosh => self.cosh(),
            Elementary::Tanh => self.tanh(),
            Elementary::Floor => Complex64::new(self.re.floor(), self.im.floor()),
            Elementary::Ceil => Complex64::new(self.re.ceil(), self.im.ceil()),
            Elementary::Round => Complex64::new(self.re.round(), self.im.round()),
            Elementary::Step => Self::from_bool(self.re > 0.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_real_truthiness() {
        assert!(1.0f64.is_true());
        assert!(0.51f64.is_true());
        assert!(!0.5f64.is_true());
        assert!(!(-3.0f64).is_true());
    }

    #[test]
    fn test_complex_truthiness_uses_real_part() {
        assert!(Complex64::new(1.0, -5.0).is_true());
        assert!(!Complex64::new(0.0, 10.0).is_true());
    }

    #[test]
    fn test_complex_ordering_is_unsupported() {
        let one = Complex64::new(1.0, 0.0);
        let err = Complex64::compare(BinaryOp::Lt, one, one).unwrap_err();
        assert_eq!(
            err,
            ExpressionError::UnsupportedOperatorForDomain {
                operator: "<".to_string(),
                domain: "complex",
            }
        );
    }

    #[test]
    fn test_complex_power_matches_real_axis() {
        for (base, exponent) in [(-2.0, 2.0), (-2.0, 3.0), (3.0, 0.5), (-3.0, 1.0), (5.0, 0.0)] {
            let real = base.power(exponent);
            let complex = Complex64::from_real(base).power(Complex64::from_real(exponent));
            assert!((complex.re - real).abs() < 1e-12, "{base}^{exponent}");
            assert!(complex.im.abs() < 1e-12);
        }
    }

    #[test]
    fn test_complex_safe_divide() {
        let zero = Complex64::new(0.0, 0.0);
        let one = Complex64::new(1.0, 0.0);
        assert_eq!(one.safe_divide(zero, 0.0), Complex64::new(f64::INFINITY, 0.0));

        let quotient = Complex64::new(2.0, 2.0).safe_divide(Complex64::new(0.0, 2.0), 0.0);
        assert!((quotient - Complex64::new(1.0, -1.0)).norm() < 1e-15);
    }

    #[test]
    fn test_complex_fuzzy_equals() {
        let tolerances = Tolerances::default();
        let a = Complex64::new(3.0, 4.0);
        assert!(a.fuzzy_equals(Complex64::new(3.0, 4.0 + 1e-7), &tolerances));
        assert!(!a.fuzzy_equals(Complex64::new(3.0, 4.1), &tolerances));
    }

    #[test]
    fn test_elementary() {
        assert_eq!((-2.0f64).elementary(Elementary::Sgn), -1.0);
        assert_eq!(0.0f64.elementary(Elementary::Step), 0.0);
        assert_eq!(
            Complex64::new(3.0, 4.0).elementary(Elementary::Abs),
            Complex64::new(5.0, 0.0)
        );
    }
}
