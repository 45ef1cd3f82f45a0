//! Linking and calling the power primitive from JIT-compiled code.
//!
//! Exponentiation is never lowered to `powf` directly: compiled code calls back into
//! [`crate::numeric::power`] so that `x^1 = |x|` and the absolute-base convention hold in
//! every backend.

use cranelift::prelude::FunctionBuilder;
use cranelift_codegen::ir::types::F64;
use cranelift_codegen::ir::{AbiParam, InstBuilder, Value};
use cranelift_module::{FuncId, Linkage, Module};

use crate::numeric;

/// Symbol name the shim is registered under in the JIT module.
pub const SYMBOL: &str = "behave_power";

/// Shim called by compiled code.
pub extern "C" fn jit_power(base: f64, exponent: f64) -> f64 {
    numeric::power(base, exponent)
}

/// Declares the power shim, signature `(f64, f64) -> f64`.
///
/// # Returns
/// * `Ok(FuncId)` - The function ID used by [`call_power`]
/// * `Err(String)` - Error message if declaration fails
pub fn link_power(module: &mut dyn Module) -> Result<FuncId, String> {
    let mut sig = module.make_signature();
    sig.params.push(AbiParam::new(F64)); // base
    sig.params.push(AbiParam::new(F64)); // exponent
    sig.returns.push(AbiParam::new(F64));

    module
        .declare_function(SYMBOL, Linkage::Import, &sig)
        .map_err(|e| e.to_string())
}

/// Emits a call to the power shim and returns its result.
pub fn call_power(
    builder: &mut FunctionBuilder,
    module: &mut dyn Module,
    func_id: FuncId,
    base: Value,
    exponent: Value,
) -> Value {
    let func = module.declare_func_in_func(func_id, builder.func);
    let call = builder.ins().call(func, &[base, exponent]);
    builder.inst_results(call)[0]
}
