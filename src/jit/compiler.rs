//! JIT compiler: Program -> Cranelift IR -> native code.
//!
//! Construction configures Cranelift for the host target and registers
//! every runtime symbol on the `JITBuilder`, so emitted calls resolve
//! directly to the Rust runtime entries. `compile` then declares the
//! per-library handle cells, declares and defines every user function,
//! emits the exported `fusion_main` entry, and finalizes to executable
//! memory.

use cranelift_codegen::ir::types::{F64, I32, I64};
use cranelift_codegen::ir::{AbiParam, Signature, Type};
use cranelift_codegen::settings::{self, Configurable};
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{DataDescription, DataId, FuncId, Linkage, Module};
use rustc_hash::FxHashMap;

use crate::ast::{FnDef, PrimType, Program};
use crate::error::FusionError;
use crate::layout::build_layout_map;
use crate::runtime;

use super::code::JitCode;
use super::set_last_error;
use super::translate::FunctionTranslator;

/// Pre-declared runtime entry `FuncId`s.
pub(crate) struct RuntimeFuncs {
    pub(crate) print_i64: FuncId,
    pub(crate) print_f64: FuncId,
    pub(crate) print_cstring: FuncId,
    pub(crate) read_line: FuncId,
    pub(crate) to_str_i64: FuncId,
    pub(crate) to_str_f64: FuncId,
    pub(crate) from_str_i64: FuncId,
    pub(crate) from_str_f64: FuncId,
    pub(crate) open: FuncId,
    pub(crate) close: FuncId,
    pub(crate) read_line_file: FuncId,
    pub(crate) write_file_i64: FuncId,
    pub(crate) write_file_f64: FuncId,
    pub(crate) write_file_ptr: FuncId,
    pub(crate) eof_file: FuncId,
    pub(crate) line_count_file: FuncId,
    pub(crate) panic: FuncId,
    pub(crate) dlopen: FuncId,
    pub(crate) dlsym: FuncId,
    pub(crate) dlerror_last: FuncId,
    pub(crate) ffi_sig_create: FuncId,
    pub(crate) ffi_call: FuncId,
    pub(crate) ffi_error_last: FuncId,
    pub(crate) alloc: FuncId,
}

pub struct JitCompiler {
    module: JITModule,
    runtime: RuntimeFuncs,
    ptr_type: Type,
}

impl JitCompiler {
    /// Configure Cranelift for the host and bind the runtime symbols.
    pub fn new() -> Result<Self, FusionError> {
        let mut flag_builder = settings::builder();
        flag_builder
            .set("use_colocated_libcalls", "false")
            .map_err(|e| FusionError::jit(e.to_string()))?;
        flag_builder
            .set("is_pic", "false")
            .map_err(|e| FusionError::jit(e.to_string()))?;
        flag_builder
            .set("enable_verifier", "true")
            .map_err(|e| FusionError::jit(e.to_string()))?;

        let isa_builder = cranelift_native::builder()
            .map_err(|e| FusionError::jit(format!("host target not supported: {}", e)))?;
        let isa = isa_builder
            .finish(settings::Flags::new(flag_builder))
            .map_err(|e| FusionError::jit(e.to_string()))?;

        let mut builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());

        builder.symbol("rt_print_i64", runtime::rt_print_i64 as *const u8);
        builder.symbol("rt_print_f64", runtime::rt_print_f64 as *const u8);
        builder.symbol("rt_print_cstring", runtime::rt_print_cstring as *const u8);
        builder.symbol("rt_read_line", runtime::rt_read_line as *const u8);
        builder.symbol("rt_to_str_i64", runtime::rt_to_str_i64 as *const u8);
        builder.symbol("rt_to_str_f64", runtime::rt_to_str_f64 as *const u8);
        builder.symbol("rt_from_str_i64", runtime::rt_from_str_i64 as *const u8);
        builder.symbol("rt_from_str_f64", runtime::rt_from_str_f64 as *const u8);
        builder.symbol("rt_open", runtime::rt_open as *const u8);
        builder.symbol("rt_close", runtime::rt_close as *const u8);
        builder.symbol("rt_read_line_file", runtime::rt_read_line_file as *const u8);
        builder.symbol("rt_write_file_i64", runtime::rt_write_file_i64 as *const u8);
        builder.symbol("rt_write_file_f64", runtime::rt_write_file_f64 as *const u8);
        builder.symbol("rt_write_file_ptr", runtime::rt_write_file_ptr as *const u8);
        builder.symbol("rt_eof_file", runtime::rt_eof_file as *const u8);
        builder.symbol(
            "rt_line_count_file",
            runtime::rt_line_count_file as *const u8,
        );
        builder.symbol("rt_panic", runtime::rt_panic as *const u8);
        builder.symbol("rt_dlopen", runtime::rt_dlopen as *const u8);
        builder.symbol("rt_dlsym", runtime::rt_dlsym as *const u8);
        builder.symbol("rt_dlerror_last", runtime::rt_dlerror_last as *const u8);
        builder.symbol("rt_ffi_sig_create", runtime::rt_ffi_sig_create as *const u8);
        builder.symbol("rt_ffi_call", runtime::rt_ffi_call as *const u8);
        builder.symbol("rt_ffi_error_last", runtime::rt_ffi_error_last as *const u8);
        builder.symbol("rt_alloc", runtime::rt_alloc as *const u8);

        let mut module = JITModule::new(builder);
        let ptr_type = module.target_config().pointer_type();
        let runtime = Self::declare_runtime(&mut module, ptr_type)?;

        Ok(JitCompiler {
            module,
            runtime,
            ptr_type,
        })
    }

    /// Declare the C-ABI signature of every runtime entry.
    fn declare_runtime(module: &mut JITModule, ptr: Type) -> Result<RuntimeFuncs, FusionError> {
        let make = |module: &mut JITModule, params: &[Type], ret: Option<Type>| -> Signature {
            let mut sig = module.make_signature();
            for &p in params {
                sig.params.push(AbiParam::new(p));
            }
            if let Some(r) = ret {
                sig.returns.push(AbiParam::new(r));
            }
            sig
        };
        let declare = |module: &mut JITModule,
                       name: &str,
                       params: &[Type],
                       ret: Option<Type>|
         -> Result<FuncId, FusionError> {
            let sig = make(module, params, ret);
            module
                .declare_function(name, Linkage::Import, &sig)
                .map_err(|e| FusionError::jit(format!("cannot bind runtime symbol '{}': {}", name, e)))
        };

        Ok(RuntimeFuncs {
            print_i64: declare(module, "rt_print_i64", &[I64, I64], None)?,
            print_f64: declare(module, "rt_print_f64", &[F64, I64], None)?,
            print_cstring: declare(module, "rt_print_cstring", &[ptr, I64], None)?,
            read_line: declare(module, "rt_read_line", &[], Some(ptr))?,
            to_str_i64: declare(module, "rt_to_str_i64", &[I64], Some(ptr))?,
            to_str_f64: declare(module, "rt_to_str_f64", &[F64], Some(ptr))?,
            from_str_i64: declare(module, "rt_from_str_i64", &[ptr], Some(I64))?,
            from_str_f64: declare(module, "rt_from_str_f64", &[ptr], Some(F64))?,
            open: declare(module, "rt_open", &[ptr, ptr], Some(ptr))?,
            close: declare(module, "rt_close", &[ptr], None)?,
            read_line_file: declare(module, "rt_read_line_file", &[ptr], Some(ptr))?,
            write_file_i64: declare(module, "rt_write_file_i64", &[ptr, I64], None)?,
            write_file_f64: declare(module, "rt_write_file_f64", &[ptr, F64], None)?,
            write_file_ptr: declare(module, "rt_write_file_ptr", &[ptr, ptr], None)?,
            eof_file: declare(module, "rt_eof_file", &[ptr], Some(I64))?,
            line_count_file: declare(module, "rt_line_count_file", &[ptr], Some(I64))?,
            panic: declare(module, "rt_panic", &[ptr], None)?,
            dlopen: declare(module, "rt_dlopen", &[ptr], Some(ptr))?,
            dlsym: declare(module, "rt_dlsym", &[ptr, ptr], Some(ptr))?,
            dlerror_last: declare(module, "rt_dlerror_last", &[], Some(ptr))?,
            ffi_sig_create: declare(module, "rt_ffi_sig_create", &[I32, I32, ptr], Some(ptr))?,
            ffi_call: declare(module, "rt_ffi_call", &[ptr, ptr, ptr, ptr], Some(I32))?,
            ffi_error_last: declare(module, "rt_ffi_error_last", &[], Some(ptr))?,
            alloc: declare(module, "rt_alloc", &[I64], Some(ptr))?,
        })
    }

    fn clif_type(&self, ty: PrimType) -> Type {
        match ty {
            PrimType::I32 => I32,
            PrimType::I64 => I64,
            PrimType::F32 => cranelift_codegen::ir::types::F32,
            PrimType::F64 => F64,
            PrimType::Ptr => self.ptr_type,
            PrimType::Void => I64, // never used as a value type
        }
    }

    fn translated_sig(&mut self, fndef: &FnDef) -> Signature {
        let mut sig = self.module.make_signature();
        for param in &fndef.params {
            sig.params.push(AbiParam::new(self.clif_type(param.ty)));
        }
        if fndef.return_type != PrimType::Void {
            sig.returns
                .push(AbiParam::new(self.clif_type(fndef.return_type)));
        }
        sig
    }

    /// Emit the whole program and finalize to executable code.
    pub fn compile(self, program: &Program) -> Result<JitCode, FusionError> {
        match Self::compile_inner(self, program) {
            Ok(code) => Ok(code),
            Err(e) => {
                set_last_error(&e.description());
                Err(e)
            }
        }
    }

    fn compile_inner(mut self, program: &Program) -> Result<JitCode, FusionError> {
        let layouts = build_layout_map(&program.structs);

        // One zero-initialized pointer cell per declared library; the
        // entry prologue fills them with rt_dlopen handles.
        let mut lib_cells: FxHashMap<String, DataId> = FxHashMap::default();
        for lib in &program.libs {
            let data_id = self
                .module
                .declare_data(
                    &format!("__fusion_lib_{}", lib.name),
                    Linkage::Local,
                    true,
                    false,
                )
                .map_err(|e| FusionError::codegen(e.to_string()))?;
            let mut desc = DataDescription::new();
            desc.define_zeroinit(self.ptr_type.bytes() as usize);
            self.module
                .define_data(data_id, &desc)
                .map_err(|e| FusionError::codegen(e.to_string()))?;
            lib_cells.insert(lib.name.clone(), data_id);
        }

        // Declare every user function up front so calls resolve in any
        // order, then define the bodies.
        let mut user_funcs: FxHashMap<String, FuncId> = FxHashMap::default();
        for fndef in &program.user_fns {
            let sig = self.translated_sig(fndef);
            let func_id = self
                .module
                .declare_function(&fndef.name, Linkage::Local, &sig)
                .map_err(|e| FusionError::codegen(e.to_string()))?;
            user_funcs.insert(fndef.name.clone(), func_id);
        }

        for fndef in &program.user_fns {
            self.define_user_fn(program, fndef, &layouts, &lib_cells, &user_funcs)?;
        }

        let main_id = self.define_entry(program, &layouts, &lib_cells, &user_funcs)?;

        self.module
            .finalize_definitions()
            .map_err(|e| FusionError::jit(e.to_string()))?;
        let entry = self.module.get_finalized_function(main_id);
        Ok(JitCode::new(entry, self.module))
    }

    fn define_user_fn(
        &mut self,
        program: &Program,
        fndef: &FnDef,
        layouts: &crate::layout::LayoutMap,
        lib_cells: &FxHashMap<String, DataId>,
        user_funcs: &FxHashMap<String, FuncId>,
    ) -> Result<(), FusionError> {
        let func_id = user_funcs[&fndef.name];
        let mut ctx = self.module.make_context();
        ctx.func.signature = self.translated_sig(fndef);

        let mut fb_ctx = FunctionBuilderContext::new();
        let mut builder = FunctionBuilder::new(&mut ctx.func, &mut fb_ctx);
        let mut translator = FunctionTranslator::new(
            &mut self.module,
            &self.runtime,
            program,
            layouts,
            lib_cells,
            user_funcs,
            self.ptr_type,
        );
        translator.emit_user_fn(&mut builder, fndef)?;
        builder.finalize();

        self.module
            .define_function(func_id, &mut ctx)
            .map_err(|e| FusionError::codegen(format!("in fn '{}': {}", fndef.name, e)))
    }

    /// The exported `fusion_main`: open every declared library, then
    /// run the top-level items in declaration order.
    fn define_entry(
        &mut self,
        program: &Program,
        layouts: &crate::layout::LayoutMap,
        lib_cells: &FxHashMap<String, DataId>,
        user_funcs: &FxHashMap<String, FuncId>,
    ) -> Result<FuncId, FusionError> {
        let sig = self.module.make_signature();
        let main_id = self
            .module
            .declare_function("fusion_main", Linkage::Export, &sig)
            .map_err(|e| FusionError::codegen(e.to_string()))?;

        let mut ctx = self.module.make_context();
        ctx.func.signature = sig;

        let mut fb_ctx = FunctionBuilderContext::new();
        let mut builder = FunctionBuilder::new(&mut ctx.func, &mut fb_ctx);
        let mut translator = FunctionTranslator::new(
            &mut self.module,
            &self.runtime,
            program,
            layouts,
            lib_cells,
            user_funcs,
            self.ptr_type,
        );
        translator.emit_entry(&mut builder, program)?;
        builder.finalize();

        self.module
            .define_function(main_id, &mut ctx)
            .map_err(|e| FusionError::codegen(format!("in entry: {}", e)))?;
        Ok(main_id)
    }
}
