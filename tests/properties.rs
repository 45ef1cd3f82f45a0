//! Property-based tests: every backend agrees with the interpreter, and symbolic
//! derivatives agree with finite differences.
use behave_jit::prelude::*;
use proptest::prelude::*;

const OPERATORS: [BinaryOp; 15] = [
    BinaryOp::Add,
    BinaryOp::Sub,
    BinaryOp::Mul,
    BinaryOp::Div,
    BinaryOp::Mod,
    BinaryOp::Lt,
    BinaryOp::Gt,
    BinaryOp::Le,
    BinaryOp::Ge,
    BinaryOp::Eq,
    BinaryOp::Ne,
    BinaryOp::And,
    BinaryOp::Or,
    BinaryOp::Xor,
    BinaryOp::Pow,
];

fn unknowns() -> Vec<Variable> {
    vec![
        Variable::voltage("a"),
        Variable::voltage("b"),
        Variable::current("r1"),
    ]
}

fn environment(values: [f64; 3]) -> Environment<f64> {
    let mut bindings = Bindings::default();
    for (variable, value) in unknowns().iter().zip(values) {
        bindings.bind_value(variable, value);
    }
    Environment::new(bindings)
}

fn close(expected: f64, actual: f64, relative: f64) -> bool {
    if expected.is_nan() || actual.is_nan() {
        return expected.is_nan() && actual.is_nan();
    }
    if expected == actual {
        return true;
    }
    (expected - actual).abs() <= relative * expected.abs().max(actual.abs())
}

mod strategies {
    use super::*;

    fn leaf() -> impl Strategy<Value = Node> {
        prop_oneof![
            (-10.0f64..10.0).prop_map(Node::constant),
            prop::sample::select(vec![0.0, 1.0, 2.0, 0.5]).prop_map(Node::constant),
            prop::sample::select(unknowns()).prop_map(Node::var),
        ]
    }

    /// Arbitrary trees over every operator and a handful of library functions.
    pub fn any_tree() -> impl Strategy<Value = Node> {
        leaf().prop_recursive(4, 32, 3, |inner| {
            prop_oneof![
                inner
                    .clone()
                    .prop_map(|operand| Node::unary(UnaryOp::Minus, operand)),
                inner
                    .clone()
                    .prop_map(|operand| Node::unary(UnaryOp::Not, operand)),
                (prop::sample::select(OPERATORS.to_vec()), inner.clone(), inner.clone())
                    .prop_map(|(op, left, right)| Node::binary(op, left, right)),
                (inner.clone(), inner.clone(), inner.clone())
                    .prop_map(|(c, t, f)| Node::ternary(c, t, f)),
                (
                    prop::sample::select(vec!["sin", "abs", "sqrt", "exp", "sgn", "floor"]),
                    inner.clone()
                )
                    .prop_map(|(name, argument)| Node::call(name, vec![argument])),
                (inner.clone(), inner.clone())
                    .prop_map(|(left, right)| Node::call("max", vec![left, right])),
                (inner.clone(), inner.clone(), inner)
                    .prop_map(|(x, lo, hi)| Node::call("limit", vec![x, lo, hi])),
            ]
        })
    }

    /// Trees that are smooth everywhere, for comparison against finite differences.
    pub fn smooth_tree() -> impl Strategy<Value = Node> {
        leaf().prop_recursive(3, 16, 2, |inner| {
            prop_oneof![
                inner
                    .clone()
                    .prop_map(|operand| Node::unary(UnaryOp::Minus, operand)),
                (
                    prop::sample::select(vec![BinaryOp::Add, BinaryOp::Sub, BinaryOp::Mul]),
                    inner.clone(),
                    inner.clone()
                )
                    .prop_map(|(op, left, right)| Node::binary(op, left, right)),
                (prop::sample::select(vec!["sin", "cos", "atan"]), inner)
                    .prop_map(|(name, argument)| Node::call(name, vec![argument])),
            ]
        })
    }

    pub fn values() -> impl Strategy<Value = [f64; 3]> {
        [-3.0f64..3.0, -3.0f64..3.0, -3.0f64..3.0]
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn test_backends_agree(node in strategies::any_tree(), values in strategies::values()) {
        let env = environment(values);
        let expected = Interpreter::new(&env).evaluate(&node).unwrap();

        for backend in [Backend::Program, Backend::Jit] {
            let callable = build_callable(&node, &env, backend).unwrap();
            let actual = callable.call();
            prop_assert!(
                close(expected, actual, 1e-12),
                "{backend} gave {actual}, interpreter gave {expected} for {node}"
            );
        }
    }

    #[test]
    fn test_derivative_matches_finite_difference(
        node in strategies::smooth_tree(),
        values in strategies::values(),
    ) {
        let derivatives = Differentiator::new(&FunctionTable::<f64>::defaults(), NameComparison::default())
            .derive_all(&node, &unknowns())
            .unwrap();

        for (index, variable) in unknowns().iter().enumerate() {
            let h = 1e-5;
            let mut above = values;
            above[index] += h;
            let mut below = values;
            below[index] -= h;
            let upper = Interpreter::new(&environment(above)).evaluate(&node).unwrap();
            let lower = Interpreter::new(&environment(below)).evaluate(&node).unwrap();
            let numeric = (upper - lower) / (2.0 * h);

            let symbolic = Interpreter::new(&environment(values))
                .evaluate(derivatives.get(variable).unwrap())
                .unwrap();
            prop_assert!(
                (symbolic - numeric).abs() <= 1e-4 * (1.0 + symbolic.abs() + 1e-3 * upper.abs()),
                "d/d{variable} of {node}: symbolic {symbolic}, numeric {numeric}"
            );
        }
    }

    #[test]
    fn test_absent_variable_has_zero_derivative(node in strategies::any_tree()) {
        let absent = Variable::voltage("unused");
        let derivative = Differentiator::new(&FunctionTable::<f64>::defaults(), NameComparison::default())
            .derive(&node, &absent)
            .unwrap();
        prop_assert_eq!(derivative, Node::constant(0.0));
    }
}
