//! Lowering of node trees to Cranelift IR.
//!
//! The generated function has the signature `(inputs: *const f64, table: *const NativeFn)
//! -> f64`. `inputs` holds the current value of every captured source, indexed by capture
//! slot; `table` is the captured function table handed to the native-call trampoline.
//!
//! Lowering rules:
//! - `+ - *` and negation are native float instructions
//! - `/ % ^ == !=` call the shims of [`crate::operators`], which share their
//!   implementation with the interpreter
//! - ordering comparisons are `fcmp` followed by a `select` of `1.0`/`0.0`
//! - truthiness is `value > 0.5`
//! - ternaries branch with `brif`; each arm stores its value to a stack slot that the
//!   merge block reads back, so only the taken arm runs

use cranelift::prelude::*;
use cranelift_codegen::ir::immediates::Offset32;
use cranelift_codegen::ir::{StackSlotData, StackSlotKind};
use cranelift_module::{FuncId, Module};
use tracing::trace;

use crate::errors::{BehaviorError, BuilderError, ExpressionError};
use crate::interpreter::Environment;
use crate::node::{BinaryOp, Node, UnaryOp};
use crate::operators::{divide, equality, native, pow};
use crate::program::Captures;

/// Function ids of the shims declared in the module.
pub(crate) struct Imports {
    safe_divide: FuncId,
    modulo: FuncId,
    power: FuncId,
    fuzzy_equals: FuncId,
    call_native: FuncId,
}

impl Imports {
    pub(crate) fn link(module: &mut dyn Module) -> Result<Self, BuilderError> {
        Ok(Self {
            safe_divide: divide::link_safe_divide(module).map_err(BuilderError::DeclarationError)?,
            modulo: divide::link_modulo(module).map_err(BuilderError::DeclarationError)?,
            power: pow::link_power(module).map_err(BuilderError::DeclarationError)?,
            fuzzy_equals: equality::link_fuzzy_equals(module)
                .map_err(BuilderError::DeclarationError)?,
            call_native: native::link_call_native(module).map_err(BuilderError::DeclarationError)?,
        })
    }
}

/// Per-function lowering state.
pub(crate) struct Codegen<'a, 'b, 'e> {
    pub(crate) builder: &'a mut FunctionBuilder<'b>,
    pub(crate) module: &'a mut dyn Module,
    pub(crate) imports: &'a Imports,
    pub(crate) environment: &'e Environment<f64>,
    pub(crate) captures: Captures<f64>,
    pub(crate) inputs: Value,
    pub(crate) table: Value,
}

impl Codegen<'_, '_, '_> {
    fn truth(&mut self, value: Value) -> Value {
        let half = self.builder.ins().f64const(0.5);
        self.builder.ins().fcmp(FloatCC::GreaterThan, value, half)
    }

    fn flag_to_float(&mut self, flag: Value) -> Value {
        let one = self.builder.ins().f64const(1.0);
        let zero = self.builder.ins().f64const(0.0);
        self.builder.ins().select(flag, one, zero)
    }

    /// Emits the instructions computing `node` and returns the resulting value.
    pub(crate) fn lower(&mut self, node: &Node) -> Result<Value, BehaviorError> {
        Ok(match node {
            Node::Constant(value) => self.builder.ins().f64const(*value),

            Node::Variable(variable) => {
                let source = self
                    .environment
                    .bindings
                    .get(variable)
                    .ok_or_else(|| ExpressionError::UnboundVariable(variable.to_string()))?;
                let slot = self.captures.source_slot(source);
                trace!(%variable, slot, "load input");
                self.builder.ins().load(
                    types::F64,
                    MemFlags::trusted(),
                    self.inputs,
                    Offset32::new((slot * 8) as i32),
                )
            }

            Node::Unary(op, operand) => {
                let value = self.lower(operand)?;
                match op {
                    UnaryOp::Plus => value,
                    UnaryOp::Minus => self.builder.ins().fneg(value),
                    UnaryOp::Not => {
                        let flag = self.truth(value);
                        let one = self.builder.ins().f64const(1.0);
                        let zero = self.builder.ins().f64const(0.0);
                        self.builder.ins().select(flag, zero, one)
                    }
                }
            }

            Node::Binary(op, left, right) => {
                let lhs = self.lower(left)?;
                let rhs = self.lower(right)?;
                self.binary(*op, lhs, rhs)
            }

            Node::Ternary(condition, if_true, if_false) => {
                let condition = self.lower(condition)?;
                let flag = self.truth(condition);

                let result = self.builder.create_sized_stack_slot(StackSlotData::new(
                    StackSlotKind::ExplicitSlot,
                    8,
                    3,
                ));
                let then_block = self.builder.create_block();
                let else_block = self.builder.create_block();
                let merge_block = self.builder.create_block();
                self.builder
                    .ins()
                    .brif(flag, then_block, &[], else_block, &[]);

                self.builder.switch_to_block(then_block);
                let value = self.lower(if_true)?;
                self.builder.ins().stack_store(value, result, 0);
                self.builder.ins().jump(merge_block, &[]);

                self.builder.switch_to_block(else_block);
                let value = self.lower(if_false)?;
                self.builder.ins().stack_store(value, result, 0);
                self.builder.ins().jump(merge_block, &[]);

                self.builder.switch_to_block(merge_block);
                self.builder.ins().stack_load(types::F64, result, 0)
            }

            Node::Call(name, arguments) => {
                let definition = self
                    .environment
                    .functions
                    .resolve(name, arguments.len())?;
                let slot = self.captures.function_slot(&definition.implementation);
                trace!(function = %name, slot, "native call");
                let values = arguments
                    .iter()
                    .map(|argument| self.lower(argument))
                    .collect::<Result<Vec<_>, _>>()?;
                native::call_native(
                    self.builder,
                    self.module,
                    self.imports.call_native,
                    self.table,
                    slot,
                    &values,
                )
            }

            Node::Extension(..) => {
                return Err(ExpressionError::UnrecognizedNode(node.to_string()).into())
            }
        })
    }

    fn binary(&mut self, op: BinaryOp, lhs: Value, rhs: Value) -> Value {
        let tolerances = self.environment.tolerances;
        match op {
            BinaryOp::Add => self.builder.ins().fadd(lhs, rhs),
            BinaryOp::Sub => self.builder.ins().fsub(lhs, rhs),
            BinaryOp::Mul => self.builder.ins().fmul(lhs, rhs),
            BinaryOp::Div => divide::call_safe_divide(
                self.builder,
                self.module,
                self.imports.safe_divide,
                lhs,
                rhs,
                tolerances.fudge_factor,
            ),
            BinaryOp::Mod => {
                divide::call_modulo(self.builder, self.module, self.imports.modulo, lhs, rhs)
            }
            BinaryOp::Pow => pow::call_power(self.builder, self.module, self.imports.power, lhs, rhs),
            BinaryOp::Lt | BinaryOp::Gt | BinaryOp::Le | BinaryOp::Ge => {
                let cc = match op {
                    BinaryOp::Lt => FloatCC::LessThan,
                    BinaryOp::Gt => FloatCC::GreaterThan,
                    BinaryOp::Le => FloatCC::LessThanOrEqual,
                    _ => FloatCC::GreaterThanOrEqual,
                };
                let flag = self.builder.ins().fcmp(cc, lhs, rhs);
                self.flag_to_float(flag)
            }
            BinaryOp::Eq | BinaryOp::Ne => {
                let equal = equality::call_fuzzy_equals(
                    self.builder,
                    self.module,
                    self.imports.fuzzy_equals,
                    lhs,
                    rhs,
                    &tolerances,
                );
                if op == BinaryOp::Ne {
                    let one = self.builder.ins().f64const(1.0);
                    self.builder.ins().fsub(one, equal)
                } else {
                    equal
                }
            }
            BinaryOp::And | BinaryOp::Or | BinaryOp::Xor => {
                let l = self.truth(lhs);
                let r = self.truth(rhs);
                let flag = match op {
                    BinaryOp::And => self.builder.ins().band(l, r),
                    BinaryOp::Or => self.builder.ins().bor(l, r),
                    _ => self.builder.ins().bxor(l, r),
                };
                self.flag_to_float(flag)
            }
        }
    }
}
