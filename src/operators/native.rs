//! Calling registered native functions from JIT-compiled code.
//!
//! Registered functions are Rust closures, which have no C ABI. Compiled code therefore
//! calls a single trampoline with the address of the captured function table, the slot of
//! the function and a pointer to its arguments, which the caller spills to a stack slot.

use cranelift::prelude::FunctionBuilder;
use cranelift_codegen::ir::types::{F64, I64};
use cranelift_codegen::ir::{AbiParam, InstBuilder, StackSlotData, StackSlotKind, Value};
use cranelift_module::{FuncId, Linkage, Module};

use crate::types::NativeFn;

pub const SYMBOL: &str = "behave_call_native";

/// Trampoline called by compiled code.
///
/// # Safety
/// `table` must point to a live array holding at least `slot + 1` functions and `args` to
/// at least `argc` initialized values. Compiled code upholds both: the table is owned by the
/// [`CompiledFunction`](crate::builder::CompiledFunction) that invokes it and the argument
/// buffer is a stack slot sized for the call.
pub unsafe extern "C" fn jit_call_native(
    table: *const NativeFn<f64>,
    slot: u64,
    args: *const f64,
    argc: u64,
) -> f64 {
    let function = &*table.add(slot as usize);
    let args = std::slice::from_raw_parts(args, argc as usize);
    function(args)
}

/// Declares the trampoline, signature `(ptr, i64, ptr, i64) -> f64`.
pub fn link_call_native(module: &mut dyn Module) -> Result<FuncId, String> {
    let pointer = module.target_config().pointer_type();
    let mut sig = module.make_signature();
    sig.params.push(AbiParam::new(pointer)); // function table
    sig.params.push(AbiParam::new(I64)); // slot
    sig.params.push(AbiParam::new(pointer)); // arguments
    sig.params.push(AbiParam::new(I64)); // argument count
    sig.returns.push(AbiParam::new(F64));

    module
        .declare_function(SYMBOL, Linkage::Import, &sig)
        .map_err(|e| e.to_string())
}

/// Spills `args` to a fresh stack slot and emits a trampoline call for table slot `slot`.
pub fn call_native(
    builder: &mut FunctionBuilder,
    module: &mut dyn Module,
    func_id: FuncId,
    table: Value,
    slot: usize,
    args: &[Value],
) -> Value {
    let pointer = module.target_config().pointer_type();
    let size = (args.len().max(1) * 8) as u32;
    let buffer =
        builder.create_sized_stack_slot(StackSlotData::new(StackSlotKind::ExplicitSlot, size, 3));
    for (i, arg) in args.iter().enumerate() {
        builder.ins().stack_store(*arg, buffer, (i * 8) as i32);
    }
    let args_ptr = builder.ins().stack_addr(pointer, buffer, 0);
    let slot = builder.ins().iconst(I64, slot as i64);
    let argc = builder.ins().iconst(I64, args.len() as i64);

    let func = module.declare_func_in_func(func_id, builder.func);
    let call = builder.ins().call(func, &[table, slot, args_ptr, argc]);
    builder.inst_results(call)[0]
}
