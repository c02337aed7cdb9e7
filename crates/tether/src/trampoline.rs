//! Dynamic trampoline generation
//!
//! The runtime calls native methods through one fixed ABI ([`NativeFn`]) and
//! gives them no user-data pointer. To bind an arbitrary closure we emit a
//! small stub per registration with Cranelift. The stub bakes in the address
//! of a leaked [`Callback`] and forwards `(callback, argc, argv, receiver)` to
//! a single dispatcher, which runs the closure under
//! [`call_guarded`](crate::protect::call_guarded).
//!
//! Callbacks and stubs live for the rest of the process. Bindings are assumed
//! to be process-lifetime, so nothing here is ever freed.

use std::os::raw::c_int;
use std::slice;

use cranelift_codegen::ir::{types, AbiParam, InstBuilder, Signature};
use cranelift_codegen::settings::{self, Configurable};
use cranelift_codegen::Context;
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{FuncId, Linkage, Module};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::args::{ArgList, CallArgs};
use crate::convert::ReturnValue;
use crate::error::{Error, Result};
use crate::handle::Handle;
use crate::protect::call_guarded;
use crate::runtime::NativeFn;

const DISPATCH_SYMBOL: &str = "tether_dispatch";

/// Type-erased native method body.
pub type RawCallback = dyn Fn(&[Handle], Handle) -> Result<Handle>;

/// A leaked closure reached from exactly one stub.
pub struct Callback {
    label: String,
    body: Box<RawCallback>,
}

impl Callback {
    /// Name the callback was registered under.
    pub fn label(&self) -> &str {
        &self.label
    }
}

// ============================================================================
// Options
// ============================================================================

/// Cranelift optimisation level for stubs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptLevel {
    /// No optimisation
    None,
    /// Optimise for speed
    Speed,
    /// Optimise for speed and size
    SpeedAndSize,
}

impl OptLevel {
    fn as_str(self) -> &'static str {
        match self {
            OptLevel::None => "none",
            OptLevel::Speed => "speed",
            OptLevel::SpeedAndSize => "speed_and_size",
        }
    }
}

/// Trampoline generator configuration
#[derive(Debug, Clone)]
pub struct TrampolineOptions {
    /// Optimisation level for emitted stubs
    pub opt_level: OptLevel,

    /// Run the Cranelift IR verifier on every stub
    pub verify: bool,
}

impl Default for TrampolineOptions {
    fn default() -> Self {
        Self {
            opt_level: OptLevel::Speed,
            verify: cfg!(debug_assertions),
        }
    }
}

// ============================================================================
// JIT
// ============================================================================

struct TrampolineJit {
    module: JITModule,
    ctx: Context,
    builder_ctx: FunctionBuilderContext,
    dispatch: FuncId,
    entry_signature: Signature,
    emitted: usize,
}

// SAFETY: the module is only reached through the mutex below, and emitted
// code holds no thread-affine state.
unsafe impl Send for TrampolineJit {}

static OPTIONS: OnceCell<TrampolineOptions> = OnceCell::new();
static JIT: OnceCell<Mutex<TrampolineJit>> = OnceCell::new();

/// Set generator options. Only possible before the first stub is emitted.
pub fn configure(options: TrampolineOptions) -> Result<()> {
    if JIT.get().is_some() {
        return Err(Error::Definition(
            "trampoline options must be set before the first registration".to_string(),
        ));
    }
    OPTIONS
        .set(options)
        .map_err(|_| Error::Definition("trampoline options are already set".to_string()))
}

/// Number of stubs emitted so far.
pub fn emitted() -> usize {
    JIT.get().map_or(0, |jit| jit.lock().emitted)
}

fn codegen_error(context: &str, err: impl std::fmt::Display) -> Error {
    Error::Trampoline(format!("{context}: {err}"))
}

impl TrampolineJit {
    fn new(options: &TrampolineOptions) -> Result<Self> {
        let mut flag_builder = settings::builder();
        flag_builder
            .set("opt_level", options.opt_level.as_str())
            .map_err(|e| codegen_error("failed to set opt_level", e))?;
        flag_builder
            .set("enable_verifier", if options.verify { "true" } else { "false" })
            .map_err(|e| codegen_error("failed to set enable_verifier", e))?;
        flag_builder
            .set("use_colocated_libcalls", "false")
            .map_err(|e| codegen_error("failed to set use_colocated_libcalls", e))?;
        flag_builder
            .set("is_pic", "false")
            .map_err(|e| codegen_error("failed to set is_pic", e))?;

        let isa = cranelift_native::builder()
            .map_err(|e| codegen_error("host is not supported", e))?
            .finish(settings::Flags::new(flag_builder))
            .map_err(|e| codegen_error("failed to finish ISA", e))?;

        let mut jit_builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());
        jit_builder.symbol(DISPATCH_SYMBOL, dispatch as *const u8);
        let mut module = JITModule::new(jit_builder);

        let ptr = module.target_config().pointer_type();

        // dispatch(callback, argc, argv, receiver) -> Handle
        let mut dispatch_signature = module.make_signature();
        dispatch_signature.params.push(AbiParam::new(ptr));
        dispatch_signature.params.push(AbiParam::new(types::I32));
        dispatch_signature.params.push(AbiParam::new(ptr));
        dispatch_signature.params.push(AbiParam::new(ptr));
        dispatch_signature.returns.push(AbiParam::new(ptr));
        let dispatch = module
            .declare_function(DISPATCH_SYMBOL, Linkage::Import, &dispatch_signature)
            .map_err(|e| codegen_error("failed to declare dispatcher", e))?;

        // entry(argc, argv, receiver) -> Handle
        let mut entry_signature = module.make_signature();
        entry_signature.params.push(AbiParam::new(types::I32));
        entry_signature.params.push(AbiParam::new(ptr));
        entry_signature.params.push(AbiParam::new(ptr));
        entry_signature.returns.push(AbiParam::new(ptr));

        Ok(TrampolineJit {
            ctx: module.make_context(),
            builder_ctx: FunctionBuilderContext::new(),
            module,
            dispatch,
            entry_signature,
            emitted: 0,
        })
    }

    fn emit(&mut self, callback: *const Callback) -> Result<NativeFn> {
        let func_id = self
            .module
            .declare_anonymous_function(&self.entry_signature)
            .map_err(|e| codegen_error("failed to declare stub", e))?;
        self.build_stub(callback);
        self.define_stub(func_id)?;
        self.module
            .finalize_definitions()
            .map_err(|e| codegen_error("failed to finalize stub", e))?;

        let code = self.module.get_finalized_function(func_id);
        self.emitted += 1;
        // SAFETY: the stub was built with `entry_signature`, which is the
        // platform C ABI shape of `NativeFn`.
        Ok(unsafe { std::mem::transmute::<*const u8, NativeFn>(code) })
    }

    /// Fill the shared context with a stub forwarding to `callback`.
    fn build_stub(&mut self, callback: *const Callback) {
        let ptr = self.module.target_config().pointer_type();
        self.ctx.func.signature = self.entry_signature.clone();

        let mut builder = FunctionBuilder::new(&mut self.ctx.func, &mut self.builder_ctx);
        let block = builder.create_block();
        builder.append_block_params_for_function_params(block);
        builder.switch_to_block(block);
        builder.seal_block(block);

        let params = builder.block_params(block).to_vec();
        let captured = builder.ins().iconst(ptr, callback as usize as i64);
        let dispatch = self.module.declare_func_in_func(self.dispatch, builder.func);
        let call = builder
            .ins()
            .call(dispatch, &[captured, params[0], params[1], params[2]]);
        let result = builder.inst_results(call)[0];
        builder.ins().return_(&[result]);
        builder.finalize();
    }

    /// Compile the context into `func_id`. The context is reset either way.
    fn define_stub(&mut self, func_id: FuncId) -> Result<()> {
        let defined = self.module.define_function(func_id, &mut self.ctx);
        self.module.clear_context(&mut self.ctx);
        defined
            .map(|_| ())
            .map_err(|e| codegen_error("failed to define stub", e))
    }
}

fn jit() -> Result<&'static Mutex<TrampolineJit>> {
    JIT.get_or_try_init(|| {
        let options = OPTIONS.get_or_init(TrampolineOptions::default);
        log::debug!("creating trampoline JIT ({:?})", options.opt_level);
        TrampolineJit::new(options).map(Mutex::new)
    })
}

// ============================================================================
// Dispatch
// ============================================================================

extern "C" fn dispatch(
    callback: *const Callback,
    argc: c_int,
    argv: *const Handle,
    receiver: Handle,
) -> Handle {
    call_guarded(|| {
        // SAFETY: `callback` was leaked by `alloc_callback` and is never freed.
        let callback = unsafe { &*callback };
        let args = match usize::try_from(argc) {
            Ok(0) | Err(_) => &[][..],
            // SAFETY: the runtime passes `argc` readable handles at `argv`.
            Ok(len) => unsafe { slice::from_raw_parts(argv, len) },
        };
        (callback.body)(args, receiver)
    })
}

// ============================================================================
// Registration
// ============================================================================

/// Turn a type-erased closure into a native entry point.
///
/// The closure is leaked; the returned pointer stays valid for the rest of
/// the process.
pub fn alloc_callback(label: &str, body: Box<RawCallback>) -> Result<NativeFn> {
    let callback: *const Callback = Box::into_raw(Box::new(Callback {
        label: label.to_string(),
        body,
    }));
    let entry = jit()?.lock().emit(callback)?;
    log::debug!("emitted trampoline for {label}");
    Ok(entry)
}

/// Build a native entry that parses `specs`, runs `f` and converts its result.
pub fn method_callback<S, F, R>(label: &str, specs: S, f: F) -> Result<NativeFn>
where
    S: ArgList + 'static,
    F: Fn(S::Output) -> R + 'static,
    R: ReturnValue,
{
    specs.validate().map_err(|err| match err {
        Error::Definition(message) => Error::Definition(format!("{label}: {message}")),
        other => other,
    })?;
    alloc_callback(
        label,
        Box::new(move |args, receiver| {
            let mut call = CallArgs::new(receiver, args);
            let parsed = specs.parse(&mut call)?;
            specs.finish(&call)?;
            f(parsed).into_return()
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stub_forwards_arguments() {
        let entry = alloc_callback(
            "test#forward",
            Box::new(|args, receiver| {
                let sum: usize = args.iter().map(|h| h.to_bits()).sum();
                Ok(Handle::from_bits(sum + receiver.to_bits()))
            }),
        )
        .unwrap();

        let args = [Handle::from_bits(0x100), Handle::from_bits(0x200)];
        // SAFETY: `args` holds two readable handles.
        let result = unsafe { entry(2, args.as_ptr(), Handle::from_bits(0x1000)) };
        assert_eq!(result, Handle::from_bits(0x1300));

        // SAFETY: argc 0 never reads argv.
        let result = unsafe { entry(0, std::ptr::null(), Handle::NIL) };
        assert_eq!(result, Handle::NIL);
    }

    #[test]
    fn test_each_registration_gets_its_own_stub() {
        let first = alloc_callback("test#first", Box::new(|_, _| Ok(Handle::TRUE))).unwrap();
        let second = alloc_callback("test#second", Box::new(|_, _| Ok(Handle::FALSE))).unwrap();
        assert_ne!(first as usize, second as usize);
        assert!(emitted() >= 2);

        // SAFETY: argc 0 never reads argv.
        unsafe {
            assert_eq!(first(0, std::ptr::null(), Handle::NIL), Handle::TRUE);
            assert_eq!(second(0, std::ptr::null(), Handle::NIL), Handle::FALSE);
        }
    }

    #[test]
    fn test_failure_without_runtime_returns_undef() {
        let entry = alloc_callback(
            "test#fail",
            Box::new(|_, _| Err(Error::Runtime("no runtime to deliver to".to_string()))),
        )
        .unwrap();
        // SAFETY: argc 0 never reads argv.
        let result = unsafe { entry(0, std::ptr::null(), Handle::NIL) };
        assert!(result.is_undef());
    }

    #[test]
    fn test_misplaced_splat_is_rejected_before_emission() {
        use crate::args::{arg, arg_splat};

        let err = method_callback("test#bad", (arg_splat::<Handle>(), arg::<Handle>("x")), |_| ())
            .unwrap_err();
        assert!(matches!(err, Error::Definition(_)));
        assert!(err.to_string().starts_with("test#bad: "), "{err}");
    }

    #[test]
    fn test_configure_after_first_stub_fails() {
        alloc_callback("test#warm", Box::new(|_, _| Ok(Handle::NIL))).unwrap();
        let err = configure(TrampolineOptions::default()).unwrap_err();
        assert!(matches!(err, Error::Definition(_)));
    }

    #[test]
    fn test_failed_definition_resets_context() {
        let mut jit = TrampolineJit::new(&TrampolineOptions::default()).unwrap();
        let func_id = jit
            .module
            .declare_anonymous_function(&jit.entry_signature)
            .unwrap();
        jit.build_stub(std::ptr::null());
        jit.define_stub(func_id).unwrap();

        jit.build_stub(std::ptr::null());
        let err = jit.define_stub(func_id).unwrap_err();
        assert!(matches!(err, Error::Trampoline(_)), "{err}");
        assert!(jit.ctx.func.layout.entry_block().is_none());

        let entry = jit.emit(std::ptr::null()).unwrap();
        assert_eq!(jit.emitted, 1);
        assert!(!(entry as *const u8).is_null());
    }
}
