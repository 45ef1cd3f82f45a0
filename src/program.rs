//! Flattened stack program, the portable compiled backend.
//!
//! A node tree is walked once into a post-order vector of [`Op`]s which is then executed
//! by a tight loop over a reusable value stack. Ternaries become conditional jumps, so
//! only the taken branch executes. Variables and functions are resolved while assembling:
//! a built program never fails.
//!
//! Emission happens on an [`Assembler`]; [`Assembler::finish`] consumes it and returns the
//! sealed [`Program`], which has no way to append instructions.

use std::cell::RefCell;
use std::fmt;

use tracing::debug;

use crate::callable::{Backend, Callable};
use crate::errors::ExpressionError;
use crate::interpreter::{Environment, Interpreter};
use crate::node::{BinaryOp, Node, UnaryOp};
use crate::numeric::Tolerances;
use crate::opt;
use crate::scalar::Scalar;
use crate::types::{NativeFn, Source};

/// A single stack machine instruction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Op<D> {
    /// Push a constant
    Const(D),
    /// Push the current value of the source in capture slot `n`
    Load(usize),
    Neg,
    Not,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    /// Ordering comparison (`<`, `>`, `<=`, `>=`)
    Compare(BinaryOp),
    /// Tolerant equality, inverted for `!=`
    Equals { negate: bool },
    And,
    Or,
    Xor,
    /// Pop `argc` arguments, call the function in capture slot `function`, push the result
    Call { function: usize, argc: usize },
    /// Pop the condition and jump to the absolute target if it is false
    JumpIfFalse(usize),
    /// Jump to the absolute target
    Jump(usize),
}

/// External references captured by a compiled unit.
///
/// Each distinct source or function is stored once. Identity is the `Arc` allocation, so a
/// variable that occurs many times in an expression occupies a single slot.
pub struct Captures<D> {
    sources: Vec<Source<D>>,
    functions: Vec<NativeFn<D>>,
}

impl<D> Default for Captures<D> {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            functions: Vec::new(),
        }
    }
}

impl<D> Captures<D> {
    /// Returns the slot of `source`, capturing it if it is new.
    pub fn source_slot(&mut self, source: &Source<D>) -> usize {
        slot_of(&mut self.sources, source)
    }

    /// Returns the slot of `function`, capturing it if it is new.
    pub fn function_slot(&mut self, function: &NativeFn<D>) -> usize {
        slot_of(&mut self.functions, function)
    }

    pub fn sources(&self) -> &[Source<D>] {
        &self.sources
    }

    pub fn functions(&self) -> &[NativeFn<D>] {
        &self.functions
    }
}

fn slot_of<T: ?Sized>(slots: &mut Vec<std::sync::Arc<T>>, item: &std::sync::Arc<T>) -> usize {
    let address = std::sync::Arc::as_ptr(item);
    if let Some(slot) = slots
        .iter()
        .position(|captured| std::ptr::addr_eq(std::sync::Arc::as_ptr(captured), address))
    {
        return slot;
    }
    slots.push(item.clone());
    slots.len() - 1
}

impl<D> fmt::Debug for Captures<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Captures")
            .field("sources", &self.sources.len())
            .field("functions", &self.functions.len())
            .finish()
    }
}

/// Emits instructions for one node tree.
pub struct Assembler<'e, D> {
    environment: &'e Environment<D>,
    ops: Vec<Op<D>>,
    captures: Captures<D>,
    depth: usize,
    max_depth: usize,
}

impl<'e, D: Scalar> Assembler<'e, D> {
    pub fn new(environment: &'e Environment<D>) -> Self {
        Self {
            environment,
            ops: Vec::new(),
            captures: Captures::default(),
            depth: 0,
            max_depth: 0,
        }
    }

    fn push(&mut self, op: Op<D>, pops: usize, pushes: usize) {
        self.depth = self.depth - pops + pushes;
        self.max_depth = self.max_depth.max(self.depth);
        self.ops.push(op);
    }

    /// Emits the instructions computing `node`, leaving its value on the stack.
    pub fn emit(&mut self, node: &Node) -> Result<(), ExpressionError> {
        match node {
            Node::Constant(value) => self.push(Op::Const(D::from_real(*value)), 0, 1),
            Node::Variable(variable) => {
                let source = self
                    .environment
                    .bindings
                    .get(variable)
                    .ok_or_else(|| ExpressionError::UnboundVariable(variable.to_string()))?;
                let slot = self.captures.source_slot(source);
                self.push(Op::Load(slot), 0, 1);
            }
            Node::Unary(op, operand) => {
                self.emit(operand)?;
                match op {
                    UnaryOp::Plus => {}
                    UnaryOp::Minus => self.push(Op::Neg, 1, 1),
                    UnaryOp::Not => self.push(Op::Not, 1, 1),
                }
            }
            Node::Binary(op, left, right) => {
                if op.is_ordering() && !D::ORDERED {
                    return Err(crate::scalar::unsupported_for::<D>(*op));
                }
                self.emit(left)?;
                self.emit(right)?;
                let instruction = match op {
                    BinaryOp::Add => Op::Add,
                    BinaryOp::Sub => Op::Sub,
                    BinaryOp::Mul => Op::Mul,
                    BinaryOp::Div => Op::Div,
                    BinaryOp::Mod => Op::Mod,
                    BinaryOp::Pow => Op::Pow,
                    BinaryOp::Lt | BinaryOp::Gt | BinaryOp::Le | BinaryOp::Ge => Op::Compare(*op),
                    BinaryOp::Eq => Op::Equals { negate: false },
                    BinaryOp::Ne => Op::Equals { negate: true },
                    BinaryOp::And => Op::And,
                    BinaryOp::Or => Op::Or,
                    BinaryOp::Xor => Op::Xor,
                };
                self.push(instruction, 2, 1);
            }
            Node::Ternary(condition, if_true, if_false) => {
                self.emit(condition)?;
                let branch = self.ops.len();
                self.push(Op::JumpIfFalse(usize::MAX), 1, 0);
                let base = self.depth;

                self.emit(if_true)?;
                let exit = self.ops.len();
                self.push(Op::Jump(usize::MAX), 0, 0);

                self.depth = base;
                self.ops[branch] = Op::JumpIfFalse(self.ops.len());
                self.emit(if_false)?;
                self.ops[exit] = Op::Jump(self.ops.len());
            }
            Node::Call(name, arguments) => {
                let definition = self.environment.functions.resolve(name, arguments.len())?;
                let function = self.captures.function_slot(&definition.implementation);
                for argument in arguments {
                    self.emit(argument)?;
                }
                let argc = arguments.len();
                self.push(Op::Call { function, argc }, argc, 1);
            }
            Node::Extension(..) => return Err(ExpressionError::UnrecognizedNode(node.to_string())),
        }
        Ok(())
    }

    /// Seals the emitted instructions into a callable program.
    pub fn finish(self) -> Program<D> {
        debug!(
            ops = self.ops.len(),
            sources = self.captures.sources.len(),
            functions = self.captures.functions.len(),
            stack = self.max_depth,
            "assembled program"
        );
        Program {
            ops: self.ops,
            captures: self.captures,
            tolerances: self.environment.tolerances,
            stack: RefCell::new(Vec::with_capacity(self.max_depth)),
        }
    }
}

/// A sealed instruction sequence with its captured references.
///
/// The scratch stack is owned by the program, so a program is `Send` but not `Sync`.
pub struct Program<D> {
    ops: Vec<Op<D>>,
    captures: Captures<D>,
    tolerances: Tolerances,
    stack: RefCell<Vec<D>>,
}

impl<D: Scalar> Program<D> {
    /// Validates, folds and assembles `node`.
    pub fn compile(node: &Node, environment: &Environment<D>) -> Result<Self, ExpressionError> {
        Interpreter::new(environment).validate(node)?;
        let optimized = opt::optimize::<D>(node, &environment.tolerances);
        let mut assembler = Assembler::new(environment);
        assembler.emit(&optimized)?;
        Ok(assembler.finish())
    }

    pub fn ops(&self) -> &[Op<D>] {
        &self.ops
    }

    pub fn captures(&self) -> &Captures<D> {
        &self.captures
    }

    /// Executes the program against the current values of the captured sources.
    pub fn run(&self) -> D {
        let mut stack = self.stack.borrow_mut();
        stack.clear();
        let tolerances = &self.tolerances;
        let mut pc = 0;

        macro_rules! binary {
            (|$l:ident, $r:ident| $body:expr) => {{
                let $r = stack.pop().unwrap_or(D::from_real(f64::NAN));
                let $l = stack.pop().unwrap_or(D::from_real(f64::NAN));
                stack.push($body);
            }};
        }

        while let Some(op) = self.ops.get(pc) {
            pc += 1;
            match *op {
                Op::Const(value) => stack.push(value),
                Op::Load(slot) => stack.push((self.captures.sources[slot])()),
                Op::Neg => {
                    if let Some(top) = stack.last_mut() {
                        *top = -*top;
                    }
                }
                Op::Not => {
                    if let Some(top) = stack.last_mut() {
                        *top = D::from_bool(!top.is_true());
                    }
                }
                Op::Add => binary!(|l, r| l + r),
                Op::Sub => binary!(|l, r| l - r),
                Op::Mul => binary!(|l, r| l * r),
                Op::Div => binary!(|l, r| l.safe_divide(r, tolerances.fudge_factor)),
                Op::Mod => binary!(|l, r| l.modulo(r)),
                Op::Pow => binary!(|l, r| l.power(r)),
                Op::Compare(op) => binary!(|l, r| D::from_bool(D::compare(op, l, r).unwrap_or(false))),
                Op::Equals { negate } => binary!(|l, r| D::from_bool(l.fuzzy_equals(r, tolerances) != negate)),
                Op::And => binary!(|l, r| D::from_bool(l.is_true() && r.is_true())),
                Op::Or => binary!(|l, r| D::from_bool(l.is_true() || r.is_true())),
                Op::Xor => binary!(|l, r| D::from_bool(l.is_true() != r.is_true())),
                Op::Call { function, argc } => {
                    let start = stack.len() - argc;
                    let value = (self.captures.functions[function])(&stack[start..]);
                    stack.truncate(start);
                    stack.push(value);
                }
                Op::JumpIfFalse(target) => {
                    let condition = stack.pop().unwrap_or(D::from_real(0.0));
                    if !condition.is_true() {
                        pc = target;
                    }
                }
                Op::Jump(target) => pc = target,
            }
        }

        stack.pop().unwrap_or(D::from_real(f64::NAN))
    }
}

impl<D: Scalar> Callable<D> for Program<D> {
    fn call(&self) -> D {
        self.run()
    }

    fn backend(&self) -> Backend {
        Backend::Program
    }
}

impl<D: fmt::Debug> fmt::Debug for Program<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Program")
            .field("ops", &self.ops)
            .field("captures", &self.captures)
            .finish()
    }
}
