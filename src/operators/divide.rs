//! Linking and calling the division and remainder primitives from JIT-compiled code.

use cranelift::prelude::FunctionBuilder;
use cranelift_codegen::ir::types::F64;
use cranelift_codegen::ir::{AbiParam, InstBuilder, Value};
use cranelift_module::{FuncId, Linkage, Module};

use crate::numeric;

pub const DIVIDE_SYMBOL: &str = "behave_safe_divide";
pub const MODULO_SYMBOL: &str = "behave_modulo";

pub extern "C" fn jit_safe_divide(numerator: f64, denominator: f64, fudge: f64) -> f64 {
    numeric::safe_divide(numerator, denominator, fudge)
}

pub extern "C" fn jit_modulo(a: f64, b: f64) -> f64 {
    numeric::modulo(a, b)
}

/// Declares the division shim, signature `(f64, f64, f64) -> f64`.
///
/// The third parameter is the fudge factor, passed as an immediate by the caller so the
/// tolerance in effect at build time is baked into the compiled code.
pub fn link_safe_divide(module: &mut dyn Module) -> Result<FuncId, String> {
    let mut sig = module.make_signature();
    sig.params.push(AbiParam::new(F64)); // numerator
    sig.params.push(AbiParam::new(F64)); // denominator
    sig.params.push(AbiParam::new(F64)); // fudge factor
    sig.returns.push(AbiParam::new(F64));

    module
        .declare_function(DIVIDE_SYMBOL, Linkage::Import, &sig)
        .map_err(|e| e.to_string())
}

/// Declares the remainder shim, signature `(f64, f64) -> f64`.
pub fn link_modulo(module: &mut dyn Module) -> Result<FuncId, String> {
    let mut sig = module.make_signature();
    sig.params.push(AbiParam::new(F64));
    sig.params.push(AbiParam::new(F64));
    sig.returns.push(AbiParam::new(F64));

    module
        .declare_function(MODULO_SYMBOL, Linkage::Import, &sig)
        .map_err(|e| e.to_string())
}

/// Emits `numerator / denominator` through the division shim.
pub fn call_safe_divide(
    builder: &mut FunctionBuilder,
    module: &mut dyn Module,
    func_id: FuncId,
    numerator: Value,
    denominator: Value,
    fudge: f64,
) -> Value {
    let func = module.declare_func_in_func(func_id, builder.func);
    let fudge = builder.ins().f64const(fudge);
    let call = builder.ins().call(func, &[numerator, denominator, fudge]);
    builder.inst_results(call)[0]
}

pub fn call_modulo(
    builder: &mut FunctionBuilder,
    module: &mut dyn Module,
    func_id: FuncId,
    a: Value,
    b: Value,
) -> Value {
    let func = module.declare_func_in_func(func_id, builder.func);
    let call = builder.ins().call(func, &[a, b]);
    builder.inst_results(call)[0]
}
