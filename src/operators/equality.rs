//! Linking and calling tolerant equality from JIT-compiled code.
//!
//! The shim returns `1.0` or `0.0` so that the result can be used directly as an
//! expression value.

use cranelift::prelude::FunctionBuilder;
use cranelift_codegen::ir::types::F64;
use cranelift_codegen::ir::{AbiParam, InstBuilder, Value};
use cranelift_module::{FuncId, Linkage, Module};

use crate::numeric::{self, Tolerances};

pub const SYMBOL: &str = "behave_fuzzy_equals";

pub extern "C" fn jit_fuzzy_equals(a: f64, b: f64, relative: f64, absolute: f64) -> f64 {
    if numeric::fuzzy_equals(a, b, relative, absolute) {
        1.0
    } else {
        0.0
    }
}

/// Declares the equality shim, signature `(f64, f64, f64, f64) -> f64`.
pub fn link_fuzzy_equals(module: &mut dyn Module) -> Result<FuncId, String> {
    let mut sig = module.make_signature();
    sig.params.push(AbiParam::new(F64)); // a
    sig.params.push(AbiParam::new(F64)); // b
    sig.params.push(AbiParam::new(F64)); // relative tolerance
    sig.params.push(AbiParam::new(F64)); // absolute tolerance
    sig.returns.push(AbiParam::new(F64));

    module
        .declare_function(SYMBOL, Linkage::Import, &sig)
        .map_err(|e| e.to_string())
}

/// Emits `a == b` with the given tolerances baked in as immediates.
pub fn call_fuzzy_equals(
    builder: &mut FunctionBuilder,
    module: &mut dyn Module,
    func_id: FuncId,
    a: Value,
    b: Value,
    tolerances: &Tolerances,
) -> Value {
    let func = module.declare_func_in_func(func_id, builder.func);
    let relative = builder.ins().f64const(tolerances.relative_tolerance);
    let absolute = builder.ins().f64const(tolerances.absolute_tolerance);
    let call = builder.ins().call(func, &[a, b, relative, absolute]);
    builder.inst_results(call)[0]
}
