//! This module provides JIT compilation of node trees to native code.
//! It uses Cranelift as the backend compiler to generate native machine code.
//!
//! The main entry points are:
//! - `compile()` - Compiles a real-valued expression into a [`CompiledFunction`]
//! - `clif_ir()` - Returns the Cranelift IR that `compile()` would finalize

use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;

use crate::{
    callable::{Backend, Callable},
    codegen::{Codegen, Imports},
    errors::{BehaviorError, BuilderError},
    interpreter::{Environment, Interpreter},
    node::Node,
    operators::{divide, equality, native, pow},
    opt,
    program::Captures,
    types::{NativeFn, Source},
};
use cranelift::prelude::*;
use cranelift_codegen::Context;
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{Linkage, Module};
use isa::TargetIsa;
use tracing::debug;

/// Signature of the finalized code: `(inputs, function table) -> value`.
type RawFunction = unsafe extern "C" fn(*const f64, *const NativeFn<f64>) -> f64;

/// A natively compiled expression.
///
/// Holds the captured sources and functions the machine code refers to, plus a scratch
/// buffer for the input values. The buffer makes the type `Send` but not `Sync`.
pub struct CompiledFunction {
    function: RawFunction,
    sources: Vec<Source<f64>>,
    functions: Box<[NativeFn<f64>]>,
    inputs: RefCell<Vec<f64>>,
}

impl CompiledFunction {
    fn new(function: RawFunction, captures: Captures<f64>) -> Self {
        let sources = captures.sources().to_vec();
        let functions: Box<[NativeFn<f64>]> = captures.functions().to_vec().into_boxed_slice();
        let inputs = RefCell::new(vec![0.0; sources.len()]);
        Self {
            function,
            sources,
            functions,
            inputs,
        }
    }

    /// Number of distinct sources read on each call.
    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Number of distinct native functions the code can call.
    pub fn function_count(&self) -> usize {
        self.functions.len()
    }
}

impl Callable<f64> for CompiledFunction {
    fn call(&self) -> f64 {
        let mut inputs = self.inputs.borrow_mut();
        for (input, source) in inputs.iter_mut().zip(&self.sources) {
            *input = source();
        }
        // SAFETY: The code was compiled with the signature of `RawFunction`. It reads
        // `inputs` only at slots below `sources.len()` and calls into `functions` only at
        // slots below `functions.len()`, both of which are owned by `self`.
        unsafe { (self.function)(inputs.as_ptr(), self.functions.as_ptr()) }
    }

    fn backend(&self) -> Backend {
        Backend::Jit
    }
}

impl fmt::Debug for CompiledFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledFunction")
            .field("sources", &self.sources.len())
            .field("functions", &self.functions.len())
            .finish()
    }
}

/// Compiles a node tree to native code.
///
/// The tree is validated against `environment` first, so every unbound variable, unknown
/// function or arity mismatch is reported here and never at call time. Tolerances are
/// baked into the generated code as immediates.
///
/// # Errors
/// Returns a BehaviorError if validation or compilation fails.
pub fn compile(node: &Node, environment: &Environment<f64>) -> Result<CompiledFunction, BehaviorError> {
    Interpreter::new(environment).validate(node)?;
    let optimized = opt::optimize::<f64>(node, &environment.tolerances);

    let isa = create_isa()?;
    let (mut module, mut ctx) = create_module_and_context(isa)?;
    let imports = Imports::link(&mut module)?;
    let captures = build_function_body(&mut ctx, &optimized, environment, &mut module, &imports)?;
    let function = compile_and_finalize(&mut module, &mut ctx)?;

    debug!(
        nodes = optimized.size(),
        sources = captures.sources().len(),
        functions = captures.functions().len(),
        "compiled native function"
    );
    Ok(CompiledFunction::new(function, captures))
}

/// Returns the Cranelift IR generated for `node`, before machine code generation.
pub fn clif_ir(node: &Node, environment: &Environment<f64>) -> Result<String, BehaviorError> {
    Interpreter::new(environment).validate(node)?;
    let optimized = opt::optimize::<f64>(node, &environment.tolerances);

    let isa = create_isa()?;
    let (mut module, mut ctx) = create_module_and_context(isa)?;
    let imports = Imports::link(&mut module)?;
    build_function_body(&mut ctx, &optimized, environment, &mut module, &imports)?;
    Ok(ctx.func.display().to_string())
}

/// Creates an Instruction Set Architecture (ISA) target for code generation.
///
/// The JIT module places code and the shims it calls anywhere in the address space, so
/// neither position-independent code nor colocated libcalls are used on any host.
///
/// # Errors
/// Returns a BuilderError if:
/// - The host machine architecture is not supported
/// - Code generation configuration fails
pub(crate) fn create_isa() -> Result<Arc<dyn TargetIsa>, BuilderError> {
    let mut flag_builder = settings::builder();
    for name in ["use_colocated_libcalls", "is_pic"] {
        flag_builder
            .set(name, "false")
            .map_err(|e| BuilderError::Setting(e.to_string()))?;
    }

    let isa_builder = cranelift_native::builder()
        .map_err(|msg| BuilderError::HostMachineNotSupported(msg.to_string()))?;

    isa_builder
        .finish(settings::Flags::new(flag_builder))
        .map_err(BuilderError::CodegenError)
}

/// Creates a new JIT module and function context.
///
/// This function initializes a Cranelift JIT module and context with:
/// - Optimization settings configured for speed
/// - Debug verification enabled in debug builds
/// - The numeric shims and the native-call trampoline registered as symbols
/// - A function signature taking the input and function-table pointers and returning f64
pub(crate) fn create_module_and_context(
    isa: Arc<dyn TargetIsa>,
) -> Result<(JITModule, Context), BuilderError> {
    let mut flags_builder = settings::builder();
    let verify = if cfg!(debug_assertions) { "true" } else { "false" };
    for (name, value) in [
        ("opt_level", "speed"),
        ("enable_verifier", verify),
        ("enable_alias_analysis", verify),
    ] {
        flags_builder
            .set(name, value)
            .map_err(|e| BuilderError::Setting(e.to_string()))?;
    }

    let mut builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());

    builder.symbol(divide::DIVIDE_SYMBOL, divide::jit_safe_divide as *const u8);
    builder.symbol(divide::MODULO_SYMBOL, divide::jit_modulo as *const u8);
    builder.symbol(pow::SYMBOL, pow::jit_power as *const u8);
    builder.symbol(equality::SYMBOL, equality::jit_fuzzy_equals as *const u8);
    builder.symbol(native::SYMBOL, native::jit_call_native as *const u8);

    let module = JITModule::new(builder);
    let mut ctx = module.make_context();

    let pointer = module.target_config().pointer_type();
    let mut sig = module.make_signature();
    sig.params.push(AbiParam::new(pointer)); // inputs
    sig.params.push(AbiParam::new(pointer)); // function table
    sig.returns.push(AbiParam::new(types::F64));
    ctx.func.signature = sig;

    Ok((module, ctx))
}

/// Builds the function body by lowering the node tree into Cranelift IR.
///
/// Returns the references captured while lowering, in slot order.
fn build_function_body(
    ctx: &mut Context,
    node: &Node,
    environment: &Environment<f64>,
    module: &mut dyn Module,
    imports: &Imports,
) -> Result<Captures<f64>, BehaviorError> {
    let mut builder_ctx = FunctionBuilderContext::new();
    let mut func_builder = FunctionBuilder::new(&mut ctx.func, &mut builder_ctx);

    let entry_block = func_builder.create_block();
    func_builder.append_block_params_for_function_params(entry_block);
    func_builder.switch_to_block(entry_block);
    let inputs = func_builder.block_params(entry_block)[0];
    let table = func_builder.block_params(entry_block)[1];

    let mut codegen = Codegen {
        builder: &mut func_builder,
        module,
        imports,
        environment,
        captures: Captures::default(),
        inputs,
        table,
    };
    let result = codegen.lower(node)?;
    let captures = codegen.captures;

    func_builder.ins().return_(&[result]);
    func_builder.seal_all_blocks();
    func_builder.finalize();

    Ok(captures)
}

/// Compiles and finalizes the function, returning a callable function pointer.
///
/// # Errors
/// Returns a BuilderError if:
/// - Function declaration fails
/// - Function definition fails
/// - Module finalization fails
fn compile_and_finalize(
    module: &mut JITModule,
    ctx: &mut Context,
) -> Result<RawFunction, BuilderError> {
    let func_id = module
        .declare_function("behavior", Linkage::Local, &ctx.func.signature)
        .map_err(|msg| BuilderError::DeclarationError(msg.to_string()))?;

    module
        .define_function(func_id, ctx)
        .map_err(|msg| BuilderError::FunctionError(msg.to_string()))?;

    module.clear_context(ctx);
    module
        .finalize_definitions()
        .map_err(BuilderError::ModuleError)?;

    // SAFETY: The function was compiled with the signature of `RawFunction` and the
    // finalized code is never freed, since the module does not release its memory on drop.
    let func = unsafe {
        std::mem::transmute::<*const u8, RawFunction>(module.get_finalized_function(func_id))
    };
    Ok(func)
}
