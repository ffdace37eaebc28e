//! Program tree to Cranelift IR translation.
//!
//! `FunctionTranslator` lowers one function body at a time: the
//! exported entry (library loading plus top-level items) or a user
//! function. Variables live in explicit stack slots; scopes mirror the
//! analyzer's and carry the array-element annotation that index and
//! `for` lowering need. Indirect-call signatures come from the
//! writeback slots the analyzer filled.
//!
//! Value convention: every value is carried in the Cranelift type of
//! its primitive tag, with `Ptr` as the target pointer type (an
//! integer register), so pointer<->integer conversions are free.

use cranelift_codegen::ir::condcodes::{FloatCC, IntCC};
use cranelift_codegen::ir::types::{F32, F64, I32, I64};
use cranelift_codegen::ir::{
    AbiParam, InstBuilder, MemFlags, StackSlot, StackSlotData, StackSlotKind, TrapCode, Type,
    Value,
};
use cranelift_frontend::FunctionBuilder;
use cranelift_jit::JITModule;
use cranelift_module::{DataId, FuncId, Module};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::ast::*;
use crate::error::FusionError;
use crate::layout::LayoutMap;

use super::compiler::RuntimeFuncs;

/// Offset of the first element in a length-prefixed array.
const ARRAY_HEADER: i64 = 8;

#[derive(Clone)]
struct VarSlot {
    slot: StackSlot,
    ty: PrimType,
    elem: Option<PrimType>,
}

pub(crate) struct FunctionTranslator<'a> {
    module: &'a mut JITModule,
    runtime: &'a RuntimeFuncs,
    program: &'a Program,
    layouts: &'a LayoutMap,
    lib_cells: &'a FxHashMap<String, DataId>,
    user_funcs: &'a FxHashMap<String, FuncId>,
    ptr_type: Type,
    scopes: Vec<FxHashMap<String, VarSlot>>,
    return_type: PrimType,
}

impl<'a> FunctionTranslator<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        module: &'a mut JITModule,
        runtime: &'a RuntimeFuncs,
        program: &'a Program,
        layouts: &'a LayoutMap,
        lib_cells: &'a FxHashMap<String, DataId>,
        user_funcs: &'a FxHashMap<String, FuncId>,
        ptr_type: Type,
    ) -> Self {
        FunctionTranslator {
            module,
            runtime,
            program,
            layouts,
            lib_cells,
            user_funcs,
            ptr_type,
            scopes: Vec::new(),
            return_type: PrimType::Void,
        }
    }

    fn clif_type(&self, ty: PrimType) -> Type {
        match ty {
            PrimType::I32 => I32,
            PrimType::I64 => I64,
            PrimType::F32 => F32,
            PrimType::F64 => F64,
            PrimType::Ptr => self.ptr_type,
            PrimType::Void => I64,
        }
    }

    fn codegen_err(message: impl Into<String>) -> FusionError {
        FusionError::codegen(message)
    }

    // ------------------------------------------------------------------
    // Function shells
    // ------------------------------------------------------------------

    /// Emit `fusion_main`: load every declared library into its handle
    /// cell (panicking on failure), then run the top-level items inside
    /// one scope frame.
    pub(crate) fn emit_entry(
        &mut self,
        builder: &mut FunctionBuilder,
        program: &Program,
    ) -> Result<(), FusionError> {
        self.return_type = PrimType::Void;
        let entry = builder.create_block();
        builder.append_block_params_for_function_params(entry);
        builder.switch_to_block(entry);
        builder.seal_block(entry);

        for lib in &program.libs {
            self.emit_open_library(builder, lib)?;
        }

        self.scopes.push(FxHashMap::default());
        let mut terminated = false;
        for stmt in &program.top_level {
            if self.emit_stmt(builder, stmt)? {
                terminated = true;
                break;
            }
        }
        self.scopes.pop();

        if !terminated {
            builder.ins().return_(&[]);
        }
        Ok(())
    }

    fn emit_open_library(
        &mut self,
        builder: &mut FunctionBuilder,
        lib: &ExternLib,
    ) -> Result<(), FusionError> {
        let path = self.emit_cstring(builder, &lib.path);
        let handle = self.call_runtime(builder, self.runtime.dlopen, &[path]);
        let handle = handle.ok_or_else(|| Self::codegen_err("rt_dlopen returns a value"))?;

        let data_id = self.lib_cells[&lib.name];
        let gv = self.module.declare_data_in_func(data_id, builder.func);
        let cell = builder.ins().symbol_value(self.ptr_type, gv);
        builder.ins().store(MemFlags::trusted(), handle, cell, 0);

        let ok = builder.ins().icmp_imm(IntCC::NotEqual, handle, 0);
        self.emit_check_or_runtime_panic(builder, ok, self.runtime.dlerror_last);
        Ok(())
    }

    /// Emit one user function: spill parameters to stack slots, lower
    /// the body, and close the final block (implicit `return` for void
    /// functions, trap for paths that failed to return a value).
    pub(crate) fn emit_user_fn(
        &mut self,
        builder: &mut FunctionBuilder,
        fndef: &FnDef,
    ) -> Result<(), FusionError> {
        self.return_type = fndef.return_type;
        let entry = builder.create_block();
        builder.append_block_params_for_function_params(entry);
        builder.switch_to_block(entry);
        builder.seal_block(entry);

        let mut scope = FxHashMap::default();
        let param_vals: Vec<Value> = builder.block_params(entry).to_vec();
        for (param, value) in fndef.params.iter().zip(param_vals) {
            let slot = self.new_slot(builder);
            builder.ins().stack_store(value, slot, 0);
            scope.insert(
                param.name.clone(),
                VarSlot {
                    slot,
                    ty: param.ty,
                    elem: None,
                },
            );
        }
        self.scopes.push(scope);

        let mut terminated = false;
        for stmt in &fndef.body {
            if self.emit_stmt(builder, stmt)? {
                terminated = true;
                break;
            }
        }
        self.scopes.pop();

        if !terminated {
            if fndef.return_type == PrimType::Void {
                builder.ins().return_(&[]);
            } else {
                builder.ins().trap(TrapCode::unwrap_user(1));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Scopes and slots
    // ------------------------------------------------------------------

    /// Every variable gets an 8-byte, 8-aligned slot regardless of its
    /// type; loads and stores use the bound type.
    fn new_slot(&self, builder: &mut FunctionBuilder) -> StackSlot {
        builder.create_sized_stack_slot(StackSlotData::new(StackSlotKind::ExplicitSlot, 8, 3))
    }

    fn lookup_var(&self, name: &str) -> Option<&VarSlot> {
        self.scopes.iter().rev().find_map(|s| s.get(name))
    }

    fn bind_var(&mut self, name: &str, var: VarSlot) {
        self.scopes
            .last_mut()
            .expect("scope stack is never empty")
            .insert(name.to_string(), var);
    }

    fn update_elem_annotation(&mut self, name: &str, elem: Option<PrimType>) {
        for scope in self.scopes.iter_mut().rev() {
            if let Some(var) = scope.get_mut(name) {
                var.elem = elem;
                return;
            }
        }
    }

    /// Array element type an expression carries, mirroring the
    /// analyzer's propagation rules.
    fn elem_of_expr(&self, expr: &Expr) -> Option<PrimType> {
        match expr {
            Expr::AllocArray { elem_type, .. } => PrimType::from_name(elem_type),
            Expr::Call {
                callee, type_arg, ..
            } if callee == "range" => Some(type_arg.unwrap_or(PrimType::I64)),
            Expr::Var(name) => self.lookup_var(name).and_then(|v| v.elem),
            _ => None,
        }
    }

    fn elem_size(&self, type_name: &str) -> i64 {
        match PrimType::from_name(type_name) {
            Some(ty) => ty.size() as i64,
            None => self
                .layouts
                .get(type_name)
                .map(|l| l.size as i64)
                .unwrap_or(8),
        }
    }

    // ------------------------------------------------------------------
    // Common emission helpers
    // ------------------------------------------------------------------

    fn call_runtime(
        &mut self,
        builder: &mut FunctionBuilder,
        func_id: FuncId,
        args: &[Value],
    ) -> Option<Value> {
        let func_ref = self.module.declare_func_in_func(func_id, builder.func);
        let call = builder.ins().call(func_ref, args);
        builder.inst_results(call).first().copied()
    }

    /// Materialize a NUL-terminated string into the current frame and
    /// return its address. Stack placement sidesteps backend
    /// global-constant emission, which some JITs handle poorly.
    fn emit_cstring(&mut self, builder: &mut FunctionBuilder, text: &str) -> Value {
        let mut bytes = text.as_bytes().to_vec();
        bytes.push(0);
        while bytes.len() % 8 != 0 {
            bytes.push(0);
        }
        let slot = builder.create_sized_stack_slot(StackSlotData::new(
            StackSlotKind::ExplicitSlot,
            bytes.len() as u32,
            3,
        ));
        for (i, chunk) in bytes.chunks(8).enumerate() {
            let word = u64::from_le_bytes(chunk.try_into().expect("8-byte chunk"));
            let value = builder.ins().iconst(I64, word as i64);
            builder.ins().stack_store(value, slot, (i * 8) as i32);
        }
        builder.ins().stack_addr(self.ptr_type, slot, 0)
    }

    /// Branch to a panic block with a literal message unless `ok` is
    /// nonzero; emission continues in the surviving block.
    fn emit_check(&mut self, builder: &mut FunctionBuilder, ok: Value, message: &str) {
        let ok_block = builder.create_block();
        let panic_block = builder.create_block();
        builder.ins().brif(ok, ok_block, &[], panic_block, &[]);

        builder.switch_to_block(panic_block);
        builder.seal_block(panic_block);
        let msg = self.emit_cstring(builder, message);
        self.call_runtime(builder, self.runtime.panic, &[msg]);
        builder.ins().trap(TrapCode::unwrap_user(1));

        builder.switch_to_block(ok_block);
        builder.seal_block(ok_block);
    }

    /// Same shape, but the panic message comes from a runtime
    /// last-error entry (`rt_dlerror_last` / `rt_ffi_error_last`).
    fn emit_check_or_runtime_panic(
        &mut self,
        builder: &mut FunctionBuilder,
        ok: Value,
        error_source: FuncId,
    ) {
        let ok_block = builder.create_block();
        let panic_block = builder.create_block();
        builder.ins().brif(ok, ok_block, &[], panic_block, &[]);

        builder.switch_to_block(panic_block);
        builder.seal_block(panic_block);
        let msg = self
            .call_runtime(builder, error_source, &[])
            .expect("error source returns a pointer");
        self.call_runtime(builder, self.runtime.panic, &[msg]);
        builder.ins().trap(TrapCode::unwrap_user(1));

        builder.switch_to_block(ok_block);
        builder.seal_block(ok_block);
    }

    /// Convert between primitive tags. Ptr and I64 share a register
    /// class, so that pair is free.
    fn coerce(
        &self,
        builder: &mut FunctionBuilder,
        value: Value,
        from: PrimType,
        to: PrimType,
    ) -> Value {
        use PrimType::*;
        if from == to || to == Void || from == Void {
            return value;
        }
        match (from, to) {
            (Ptr, I64) | (I64, Ptr) => value,
            (I32, I64) | (I32, Ptr) => builder.ins().sextend(cranelift_codegen::ir::types::I64, value),
            (I64, I32) | (Ptr, I32) => builder.ins().ireduce(cranelift_codegen::ir::types::I32, value),
            (F32, F64) => builder.ins().fpromote(cranelift_codegen::ir::types::F64, value),
            (F64, F32) => builder.ins().fdemote(cranelift_codegen::ir::types::F32, value),
            (I32, F64) | (I64, F64) => builder.ins().fcvt_from_sint(cranelift_codegen::ir::types::F64, value),
            (I32, F32) | (I64, F32) => builder.ins().fcvt_from_sint(cranelift_codegen::ir::types::F32, value),
            (F64, I64) | (F32, I64) => builder.ins().fcvt_to_sint(cranelift_codegen::ir::types::I64, value),
            (F64, I32) | (F32, I32) => builder.ins().fcvt_to_sint(cranelift_codegen::ir::types::I32, value),
            (F64, Ptr) | (F32, Ptr) => builder.ins().fcvt_to_sint(cranelift_codegen::ir::types::I64, value),
            (Ptr, F64) | (Ptr, F32) => {
                let wide = builder.ins().fcvt_from_sint(cranelift_codegen::ir::types::F64, value);
                if to == F32 {
                    builder.ins().fdemote(cranelift_codegen::ir::types::F32, wide)
                } else {
                    wide
                }
            }
            _ => value,
        }
    }

    /// Lower a value to a branch condition (nonzero test).
    fn emit_condition(
        &self,
        builder: &mut FunctionBuilder,
        value: Value,
        ty: PrimType,
    ) -> Value {
        match ty {
            PrimType::F64 => {
                let zero = builder.ins().f64const(0.0);
                builder.ins().fcmp(FloatCC::NotEqual, value, zero)
            }
            PrimType::F32 => {
                let zero = builder.ins().f32const(0.0);
                builder.ins().fcmp(FloatCC::NotEqual, value, zero)
            }
            _ => builder.ins().icmp_imm(IntCC::NotEqual, value, 0),
        }
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    /// Lower one statement. Returns true when the current block was
    /// closed by a terminator (only `return` does this).
    fn emit_stmt(
        &mut self,
        builder: &mut FunctionBuilder,
        stmt: &Stmt,
    ) -> Result<bool, FusionError> {
        match stmt {
            Stmt::Return(expr) => {
                let (value, ty) = self.emit_expr(builder, expr)?;
                if self.return_type == PrimType::Void {
                    builder.ins().return_(&[]);
                } else {
                    let value = self.coerce(builder, value, ty, self.return_type);
                    builder.ins().return_(&[value]);
                }
                Ok(true)
            }
            Stmt::Let { name, init } => {
                let (value, ty) = self.emit_expr(builder, init)?;
                let elem = self.elem_of_expr(init);
                let slot = self.new_slot(builder);
                builder.ins().stack_store(value, slot, 0);
                self.bind_var(name, VarSlot { slot, ty, elem });
                Ok(false)
            }
            Stmt::Expr(expr) => {
                self.emit_expr(builder, expr)?;
                Ok(false)
            }
            Stmt::If {
                cond,
                then_body,
                else_body,
            } => {
                self.emit_if(builder, cond, then_body, else_body)?;
                Ok(false)
            }
            Stmt::For {
                var,
                iterable,
                body,
            } => {
                self.emit_for(builder, var, iterable, body)?;
                Ok(false)
            }
            Stmt::Assign { target, value } => {
                self.emit_assign(builder, target, value)?;
                Ok(false)
            }
        }
    }

    fn emit_body(
        &mut self,
        builder: &mut FunctionBuilder,
        body: &[Stmt],
    ) -> Result<bool, FusionError> {
        self.scopes.push(FxHashMap::default());
        let mut terminated = false;
        for stmt in body {
            if self.emit_stmt(builder, stmt)? {
                terminated = true;
                break;
            }
        }
        self.scopes.pop();
        Ok(terminated)
    }

    fn emit_if(
        &mut self,
        builder: &mut FunctionBuilder,
        cond: &Expr,
        then_body: &[Stmt],
        else_body: &[Stmt],
    ) -> Result<(), FusionError> {
        let (cond_val, cond_ty) = self.emit_expr(builder, cond)?;
        let cond_val = self.emit_condition(builder, cond_val, cond_ty);

        let then_block = builder.create_block();
        let merge_block = builder.create_block();

        if else_body.is_empty() {
            // Empty else elides to a direct branch to the merge point.
            builder
                .ins()
                .brif(cond_val, then_block, &[], merge_block, &[]);

            builder.switch_to_block(then_block);
            builder.seal_block(then_block);
            if !self.emit_body(builder, then_body)? {
                builder.ins().jump(merge_block, &[]);
            }
        } else {
            let else_block = builder.create_block();
            builder
                .ins()
                .brif(cond_val, then_block, &[], else_block, &[]);

            builder.switch_to_block(then_block);
            builder.seal_block(then_block);
            if !self.emit_body(builder, then_body)? {
                builder.ins().jump(merge_block, &[]);
            }

            builder.switch_to_block(else_block);
            builder.seal_block(else_block);
            if !self.emit_body(builder, else_body)? {
                builder.ins().jump(merge_block, &[]);
            }
        }

        builder.switch_to_block(merge_block);
        builder.seal_block(merge_block);
        Ok(())
    }

    /// Counted loop over a length-prefixed array: a stack-slot counter
    /// walks `0..length`, the element loads into the loop-variable slot
    /// before each body run.
    fn emit_for(
        &mut self,
        builder: &mut FunctionBuilder,
        var: &str,
        iterable: &Expr,
        body: &[Stmt],
    ) -> Result<(), FusionError> {
        let elem_ty = self.elem_of_expr(iterable).unwrap_or(PrimType::I64);
        let (base, _) = self.emit_expr(builder, iterable)?;
        let length = builder.ins().load(I64, MemFlags::trusted(), base, 0);

        let counter = self.new_slot(builder);
        let zero = builder.ins().iconst(I64, 0);
        builder.ins().stack_store(zero, counter, 0);
        let var_slot = self.new_slot(builder);

        let cond_block = builder.create_block();
        let body_block = builder.create_block();
        let exit_block = builder.create_block();

        builder.ins().jump(cond_block, &[]);
        builder.switch_to_block(cond_block);
        let index = builder.ins().stack_load(I64, counter, 0);
        let more = builder.ins().icmp(IntCC::SignedLessThan, index, length);
        builder.ins().brif(more, body_block, &[], exit_block, &[]);

        builder.switch_to_block(body_block);
        builder.seal_block(body_block);
        let index = builder.ins().stack_load(I64, counter, 0);
        let offset = builder.ins().imul_imm(index, elem_ty.size() as i64);
        let addr = builder.ins().iadd(base, offset);
        let elem = builder.ins().load(
            self.clif_type(elem_ty),
            MemFlags::trusted(),
            addr,
            ARRAY_HEADER as i32,
        );
        builder.ins().stack_store(elem, var_slot, 0);

        self.scopes.push(FxHashMap::default());
        self.bind_var(
            var,
            VarSlot {
                slot: var_slot,
                ty: elem_ty,
                elem: None,
            },
        );
        let mut terminated = false;
        for stmt in body {
            if self.emit_stmt(builder, stmt)? {
                terminated = true;
                break;
            }
        }
        self.scopes.pop();

        if !terminated {
            let index = builder.ins().stack_load(I64, counter, 0);
            let next = builder.ins().iadd_imm(index, 1);
            builder.ins().stack_store(next, counter, 0);
            builder.ins().jump(cond_block, &[]);
        }
        builder.seal_block(cond_block);

        builder.switch_to_block(exit_block);
        builder.seal_block(exit_block);
        Ok(())
    }

    fn emit_assign(
        &mut self,
        builder: &mut FunctionBuilder,
        target: &Expr,
        value: &Expr,
    ) -> Result<(), FusionError> {
        match target {
            Expr::Var(name) => {
                let (val, val_ty) = self.emit_expr(builder, value)?;
                let var = self
                    .lookup_var(name)
                    .cloned()
                    .ok_or_else(|| Self::codegen_err(format!("unresolved variable '{}'", name)))?;
                let val = self.coerce(builder, val, val_ty, var.ty);
                builder.ins().stack_store(val, var.slot, 0);
                let elem = self.elem_of_expr(value);
                self.update_elem_annotation(name, elem);
                Ok(())
            }
            Expr::Index { base, index } => {
                let elem_ty = self.elem_of_expr(base).unwrap_or(PrimType::I64);
                let (base_val, _) = self.emit_expr(builder, base)?;
                let (index_val, _) = self.emit_expr(builder, index)?;
                let addr = self.emit_element_addr(builder, base_val, index_val, elem_ty);
                let (val, val_ty) = self.emit_expr(builder, value)?;
                let val = self.coerce(builder, val, val_ty, elem_ty);
                builder.ins().store(MemFlags::trusted(), val, addr, 0);
                Ok(())
            }
            _ => Err(Self::codegen_err("unsupported assignment target")),
        }
    }

    /// Bounds-checked element address: panics with "index out of
    /// bounds" unless `0 <= index < length`.
    fn emit_element_addr(
        &mut self,
        builder: &mut FunctionBuilder,
        base: Value,
        index: Value,
        elem_ty: PrimType,
    ) -> Value {
        let length = builder.ins().load(I64, MemFlags::trusted(), base, 0);
        let below = builder
            .ins()
            .icmp_imm(IntCC::SignedGreaterThanOrEqual, index, 0);
        let above = builder.ins().icmp(IntCC::SignedLessThan, index, length);
        let ok = builder.ins().band(below, above);
        self.emit_check(builder, ok, "index out of bounds");

        let offset = builder.ins().imul_imm(index, elem_ty.size() as i64);
        let addr = builder.ins().iadd(base, offset);
        builder.ins().iadd_imm(addr, ARRAY_HEADER)
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn emit_expr(
        &mut self,
        builder: &mut FunctionBuilder,
        expr: &Expr,
    ) -> Result<(Value, PrimType), FusionError> {
        match expr {
            Expr::Int(v) => Ok((builder.ins().iconst(I64, *v), PrimType::I64)),
            Expr::Float(v) => Ok((builder.ins().f64const(*v), PrimType::F64)),
            Expr::Str(s) => Ok((self.emit_cstring(builder, s), PrimType::Ptr)),
            Expr::Binary { op, left, right } => self.emit_binary(builder, *op, left, right),
            Expr::Compare { op, left, right } => self.emit_compare(builder, *op, left, right),
            Expr::Var(name) => {
                if let Some(var) = self.lookup_var(name).cloned() {
                    let value = builder
                        .ins()
                        .stack_load(self.clif_type(var.ty), var.slot, 0);
                    return Ok((value, var.ty));
                }
                // An unshadowed function name is a Ptr to the function.
                if self.user_funcs.contains_key(name)
                    || self.program.find_extern_fn(name).is_some()
                {
                    return self.emit_function_address(builder, name);
                }
                Err(Self::codegen_err(format!("unresolved variable '{}'", name)))
            }
            Expr::Alloc { type_name } => self.emit_alloc(builder, type_name),
            Expr::AllocArray { elem_type, count } => {
                self.emit_alloc_array(builder, elem_type, count)
            }
            Expr::AllocBytes { size } => self.emit_alloc_bytes(builder, size),
            Expr::AddrOf { var } => {
                let slot = self
                    .lookup_var(var)
                    .map(|v| v.slot)
                    .ok_or_else(|| Self::codegen_err(format!("unresolved variable '{}'", var)))?;
                Ok((
                    builder.ins().stack_addr(self.ptr_type, slot, 0),
                    PrimType::Ptr,
                ))
            }
            Expr::Load { kind, ptr } => {
                let (addr, _) = self.emit_expr(builder, ptr)?;
                let value = match kind {
                    LoadKind::I64 => builder.ins().load(I64, MemFlags::trusted(), addr, 0),
                    LoadKind::I32 => {
                        // Zero-extend so the source-level integer type
                        // stays uniform.
                        let narrow = builder.ins().load(I32, MemFlags::trusted(), addr, 0);
                        builder.ins().uextend(I64, narrow)
                    }
                    LoadKind::F64 => builder.ins().load(F64, MemFlags::trusted(), addr, 0),
                    LoadKind::Ptr => {
                        builder
                            .ins()
                            .load(self.ptr_type, MemFlags::trusted(), addr, 0)
                    }
                };
                Ok((value, kind.result_type()))
            }
            Expr::Store { ptr, value } => {
                let (addr, _) = self.emit_expr(builder, ptr)?;
                let (val, _) = self.emit_expr(builder, value)?;
                builder.ins().store(MemFlags::trusted(), val, addr, 0);
                Ok(self.void_value(builder))
            }
            Expr::LoadField {
                ptr,
                struct_name,
                field,
            } => {
                let (base, _) = self.emit_expr(builder, ptr)?;
                let (offset, field_ty) = self.field_layout(struct_name, field)?;
                let value = builder.ins().load(
                    self.clif_type(field_ty),
                    MemFlags::trusted(),
                    base,
                    offset,
                );
                Ok((value, field_ty))
            }
            Expr::StoreField {
                ptr,
                struct_name,
                field,
                value,
            } => {
                let (base, _) = self.emit_expr(builder, ptr)?;
                let (offset, field_ty) = self.field_layout(struct_name, field)?;
                let (val, val_ty) = self.emit_expr(builder, value)?;
                let val = self.coerce(builder, val, val_ty, field_ty);
                builder.ins().store(MemFlags::trusted(), val, base, offset);
                Ok(self.void_value(builder))
            }
            Expr::Index { base, index } => {
                let elem_ty = self.elem_of_expr(base).unwrap_or(PrimType::I64);
                let (base_val, _) = self.emit_expr(builder, base)?;
                let (index_val, _) = self.emit_expr(builder, index)?;
                let addr = self.emit_element_addr(builder, base_val, index_val, elem_ty);
                let value = builder
                    .ins()
                    .load(self.clif_type(elem_ty), MemFlags::trusted(), addr, 0);
                Ok((value, elem_ty))
            }
            Expr::Cast { operand, target } => {
                let (value, from) = self.emit_expr(builder, operand)?;
                Ok((self.coerce(builder, value, from, *target), *target))
            }
            Expr::Call { .. } => self.emit_call(builder, expr),
        }
    }

    fn void_value(&self, builder: &mut FunctionBuilder) -> (Value, PrimType) {
        (builder.ins().iconst(I64, 0), PrimType::Void)
    }

    fn field_layout(&self, struct_name: &str, field: &str) -> Result<(i32, PrimType), FusionError> {
        let layout = self
            .layouts
            .get(struct_name)
            .ok_or_else(|| Self::codegen_err(format!("unknown struct '{}'", struct_name)))?;
        let f = layout.field(field).ok_or_else(|| {
            Self::codegen_err(format!("unknown field '{}.{}'", struct_name, field))
        })?;
        Ok((f.offset as i32, f.ty))
    }

    fn emit_binary(
        &mut self,
        builder: &mut FunctionBuilder,
        op: BinOp,
        left: &Expr,
        right: &Expr,
    ) -> Result<(Value, PrimType), FusionError> {
        let (lv, lt) = self.emit_expr(builder, left)?;
        let (rv, rt) = self.emit_expr(builder, right)?;

        if lt == PrimType::F64 || rt == PrimType::F64 {
            let lv = self.coerce(builder, lv, lt, PrimType::F64);
            let rv = self.coerce(builder, rv, rt, PrimType::F64);
            let value = match op {
                BinOp::Add => builder.ins().fadd(lv, rv),
                BinOp::Sub => builder.ins().fsub(lv, rv),
                BinOp::Mul => builder.ins().fmul(lv, rv),
                BinOp::Div => builder.ins().fdiv(lv, rv),
            };
            Ok((value, PrimType::F64))
        } else {
            let lv = self.coerce(builder, lv, lt, PrimType::I64);
            let rv = self.coerce(builder, rv, rt, PrimType::I64);
            let value = match op {
                BinOp::Add => builder.ins().iadd(lv, rv),
                BinOp::Sub => builder.ins().isub(lv, rv),
                BinOp::Mul => builder.ins().imul(lv, rv),
                BinOp::Div => builder.ins().sdiv(lv, rv),
            };
            Ok((value, PrimType::I64))
        }
    }

    fn emit_compare(
        &mut self,
        builder: &mut FunctionBuilder,
        op: CmpOp,
        left: &Expr,
        right: &Expr,
    ) -> Result<(Value, PrimType), FusionError> {
        let (lv, lt) = self.emit_expr(builder, left)?;
        let (rv, rt) = self.emit_expr(builder, right)?;

        let flag = if lt == PrimType::F64 || rt == PrimType::F64 {
            let lv = self.coerce(builder, lv, lt, PrimType::F64);
            let rv = self.coerce(builder, rv, rt, PrimType::F64);
            let cc = match op {
                CmpOp::Eq => FloatCC::Equal,
                CmpOp::Ne => FloatCC::NotEqual,
                CmpOp::Lt => FloatCC::LessThan,
                CmpOp::Le => FloatCC::LessThanOrEqual,
                CmpOp::Gt => FloatCC::GreaterThan,
                CmpOp::Ge => FloatCC::GreaterThanOrEqual,
            };
            builder.ins().fcmp(cc, lv, rv)
        } else {
            // Pointer comparisons take the integer path; Ptr and I64
            // share a representation.
            let lv = self.coerce(builder, lv, lt, PrimType::I64);
            let rv = self.coerce(builder, rv, rt, PrimType::I64);
            let cc = match op {
                CmpOp::Eq => IntCC::Equal,
                CmpOp::Ne => IntCC::NotEqual,
                CmpOp::Lt => IntCC::SignedLessThan,
                CmpOp::Le => IntCC::SignedLessThanOrEqual,
                CmpOp::Gt => IntCC::SignedGreaterThan,
                CmpOp::Ge => IntCC::SignedGreaterThanOrEqual,
            };
            builder.ins().icmp(cc, lv, rv)
        };
        Ok((builder.ins().uextend(I64, flag), PrimType::I64))
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    fn emit_alloc(
        &mut self,
        builder: &mut FunctionBuilder,
        type_name: &str,
    ) -> Result<(Value, PrimType), FusionError> {
        if PrimType::from_name(type_name).is_some() {
            // One primitive element lives on the stack.
            let slot = self.new_slot(builder);
            return Ok((
                builder.ins().stack_addr(self.ptr_type, slot, 0),
                PrimType::Ptr,
            ));
        }
        // Records go through the host allocator so they can escape.
        let layout = self
            .layouts
            .get(type_name)
            .ok_or_else(|| Self::codegen_err(format!("unknown struct '{}'", type_name)))?;
        let size = builder.ins().iconst(I64, layout.size.max(1) as i64);
        let base = self
            .call_runtime(builder, self.runtime.alloc, &[size])
            .expect("rt_alloc returns a pointer");
        Ok((base, PrimType::Ptr))
    }

    fn emit_alloc_array(
        &mut self,
        builder: &mut FunctionBuilder,
        elem_type: &str,
        count: &Expr,
    ) -> Result<(Value, PrimType), FusionError> {
        let (count_val, count_ty) = self.emit_expr(builder, count)?;
        let count_val = self.coerce(builder, count_val, count_ty, PrimType::I64);
        let base = self.emit_array_allocation(builder, count_val, self.elem_size(elem_type));
        Ok((base, PrimType::Ptr))
    }

    /// Heap-allocate `8 + count * elem_size` bytes and store the length
    /// prefix. Heap placement is mandatory: arrays may outlive the
    /// allocating activation.
    fn emit_array_allocation(
        &mut self,
        builder: &mut FunctionBuilder,
        count: Value,
        elem_size: i64,
    ) -> Value {
        let payload = builder.ins().imul_imm(count, elem_size);
        let total = builder.ins().iadd_imm(payload, ARRAY_HEADER);
        let base = self
            .call_runtime(builder, self.runtime.alloc, &[total])
            .expect("rt_alloc returns a pointer");
        builder.ins().store(MemFlags::trusted(), count, base, 0);
        base
    }

    fn emit_alloc_bytes(
        &mut self,
        builder: &mut FunctionBuilder,
        size: &Expr,
    ) -> Result<(Value, PrimType), FusionError> {
        // Constant sizes become a stack buffer; anything else cannot be
        // a Cranelift stack slot and falls back to the heap.
        if let Expr::Int(n) = size {
            let bytes = (*n).max(1) as u32;
            let padded = bytes.div_ceil(8) * 8;
            let slot = builder.create_sized_stack_slot(StackSlotData::new(
                StackSlotKind::ExplicitSlot,
                padded,
                3,
            ));
            return Ok((
                builder.ins().stack_addr(self.ptr_type, slot, 0),
                PrimType::Ptr,
            ));
        }
        let (size_val, size_ty) = self.emit_expr(builder, size)?;
        let size_val = self.coerce(builder, size_val, size_ty, PrimType::I64);
        let base = self
            .call_runtime(builder, self.runtime.alloc, &[size_val])
            .expect("rt_alloc returns a pointer");
        Ok((base, PrimType::Ptr))
    }

    /// `range(end)` / `range(start, end)`: allocate a length-prefixed
    /// array and fill it with consecutive values by an emitted loop.
    fn emit_range(
        &mut self,
        builder: &mut FunctionBuilder,
        args: &[Expr],
        elem_ty: PrimType,
    ) -> Result<(Value, PrimType), FusionError> {
        let (start, end) = if args.len() == 1 {
            let (end, _) = self.emit_expr(builder, &args[0])?;
            (builder.ins().iconst(I64, 0), end)
        } else {
            let (start, _) = self.emit_expr(builder, &args[0])?;
            let (end, _) = self.emit_expr(builder, &args[1])?;
            (start, end)
        };

        let span = builder.ins().isub(end, start);
        let negative = builder.ins().icmp_imm(IntCC::SignedLessThan, span, 0);
        let zero = builder.ins().iconst(I64, 0);
        let count = builder.ins().select(negative, zero, span);
        let base = self.emit_array_allocation(builder, count, elem_ty.size() as i64);

        let counter = self.new_slot(builder);
        builder.ins().stack_store(zero, counter, 0);

        let cond_block = builder.create_block();
        let body_block = builder.create_block();
        let exit_block = builder.create_block();

        builder.ins().jump(cond_block, &[]);
        builder.switch_to_block(cond_block);
        let index = builder.ins().stack_load(I64, counter, 0);
        let more = builder.ins().icmp(IntCC::SignedLessThan, index, count);
        builder.ins().brif(more, body_block, &[], exit_block, &[]);

        builder.switch_to_block(body_block);
        builder.seal_block(body_block);
        let index = builder.ins().stack_load(I64, counter, 0);
        let raw = builder.ins().iadd(start, index);
        let elem = self.coerce(builder, raw, PrimType::I64, elem_ty);
        let offset = builder.ins().imul_imm(index, elem_ty.size() as i64);
        let addr = builder.ins().iadd(base, offset);
        builder
            .ins()
            .store(MemFlags::trusted(), elem, addr, ARRAY_HEADER as i32);
        let next = builder.ins().iadd_imm(index, 1);
        builder.ins().stack_store(next, counter, 0);
        builder.ins().jump(cond_block, &[]);
        builder.seal_block(cond_block);

        builder.switch_to_block(exit_block);
        builder.seal_block(exit_block);
        Ok((base, PrimType::Ptr))
    }

    // ------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------

    fn emit_call(
        &mut self,
        builder: &mut FunctionBuilder,
        expr: &Expr,
    ) -> Result<(Value, PrimType), FusionError> {
        let Expr::Call {
            callee,
            args,
            type_arg,
            inferred_sig,
        } = expr
        else {
            unreachable!("emit_call on non-call expression");
        };

        match callee.as_str() {
            "print" => self.emit_print(builder, args),
            "range" => self.emit_range(builder, args, type_arg.unwrap_or(PrimType::I64)),
            "read_line" => {
                let value = self
                    .call_runtime(builder, self.runtime.read_line, &[])
                    .expect("rt_read_line returns a pointer");
                Ok((value, PrimType::Ptr))
            }
            "to_str" => {
                let (value, ty) = self.emit_expr(builder, &args[0])?;
                let func = if ty == PrimType::F64 {
                    self.runtime.to_str_f64
                } else {
                    self.runtime.to_str_i64
                };
                let result = self
                    .call_runtime(builder, func, &[value])
                    .expect("rt_to_str returns a pointer");
                Ok((result, PrimType::Ptr))
            }
            "from_str" => {
                let (value, _) = self.emit_expr(builder, &args[0])?;
                if *type_arg == Some(PrimType::F64) {
                    let result = self
                        .call_runtime(builder, self.runtime.from_str_f64, &[value])
                        .expect("rt_from_str returns a value");
                    Ok((result, PrimType::F64))
                } else {
                    let result = self
                        .call_runtime(builder, self.runtime.from_str_i64, &[value])
                        .expect("rt_from_str returns a value");
                    Ok((result, PrimType::I64))
                }
            }
            "open" => {
                let (path, _) = self.emit_expr(builder, &args[0])?;
                let (mode, _) = self.emit_expr(builder, &args[1])?;
                let handle = self
                    .call_runtime(builder, self.runtime.open, &[path, mode])
                    .expect("rt_open returns a handle");
                Ok((handle, PrimType::Ptr))
            }
            "close" => {
                let (handle, _) = self.emit_expr(builder, &args[0])?;
                self.call_runtime(builder, self.runtime.close, &[handle]);
                Ok(self.void_value(builder))
            }
            "read_line_file" => {
                let (handle, _) = self.emit_expr(builder, &args[0])?;
                let line = self
                    .call_runtime(builder, self.runtime.read_line_file, &[handle])
                    .expect("rt_read_line_file returns a pointer");
                Ok((line, PrimType::Ptr))
            }
            "write_file" => {
                let (handle, _) = self.emit_expr(builder, &args[0])?;
                let (value, ty) = self.emit_expr(builder, &args[1])?;
                let func = match ty {
                    PrimType::F64 => self.runtime.write_file_f64,
                    PrimType::Ptr => self.runtime.write_file_ptr,
                    _ => self.runtime.write_file_i64,
                };
                let value = if ty == PrimType::I32 {
                    self.coerce(builder, value, ty, PrimType::I64)
                } else {
                    value
                };
                self.call_runtime(builder, func, &[handle, value]);
                Ok(self.void_value(builder))
            }
            "eof_file" => {
                let (handle, _) = self.emit_expr(builder, &args[0])?;
                let value = self
                    .call_runtime(builder, self.runtime.eof_file, &[handle])
                    .expect("rt_eof_file returns a value");
                Ok((value, PrimType::I64))
            }
            "line_count_file" => {
                let (handle, _) = self.emit_expr(builder, &args[0])?;
                let value = self
                    .call_runtime(builder, self.runtime.line_count_file, &[handle])
                    .expect("rt_line_count_file returns a value");
                Ok((value, PrimType::I64))
            }
            "get_func_ptr" => {
                let name = match args.first() {
                    Some(Expr::Var(name)) => name.clone(),
                    _ => return Err(Self::codegen_err("get_func_ptr needs a function name")),
                };
                self.emit_function_address(builder, &name)
            }
            "call" => {
                let sig = inferred_sig.clone().ok_or_else(|| {
                    Self::codegen_err("unresolved indirect call signature")
                })?;
                self.emit_indirect_call(builder, args, &sig)
            }
            _ => {
                if let Some(ext) = self.program.find_extern_fn(callee) {
                    let ext = ext.clone();
                    self.emit_extern_call(builder, &ext, args)
                } else if self.user_funcs.contains_key(callee) {
                    self.emit_user_call(builder, callee, args)
                } else {
                    Err(Self::codegen_err(format!(
                        "unresolved function '{}'",
                        callee
                    )))
                }
            }
        }
    }

    /// Static dispatch on the argument's type tag; stream defaults to
    /// 0 (stdout).
    fn emit_print(
        &mut self,
        builder: &mut FunctionBuilder,
        args: &[Expr],
    ) -> Result<(Value, PrimType), FusionError> {
        let (value, ty) = self.emit_expr(builder, &args[0])?;
        let stream = if args.len() == 2 {
            let (s, s_ty) = self.emit_expr(builder, &args[1])?;
            self.coerce(builder, s, s_ty, PrimType::I64)
        } else {
            builder.ins().iconst(I64, 0)
        };
        let (func, value) = match ty {
            PrimType::F64 => (self.runtime.print_f64, value),
            PrimType::Ptr => (self.runtime.print_cstring, value),
            _ => (
                self.runtime.print_i64,
                self.coerce(builder, value, ty, PrimType::I64),
            ),
        };
        self.call_runtime(builder, func, &[value, stream]);
        Ok(self.void_value(builder))
    }

    /// Address of a named function: user functions resolve inside the
    /// module, external ones through the dynamic loader.
    fn emit_function_address(
        &mut self,
        builder: &mut FunctionBuilder,
        name: &str,
    ) -> Result<(Value, PrimType), FusionError> {
        if let Some(&func_id) = self.user_funcs.get(name) {
            let func_ref = self.module.declare_func_in_func(func_id, builder.func);
            return Ok((
                builder.ins().func_addr(self.ptr_type, func_ref),
                PrimType::Ptr,
            ));
        }
        let ext = self
            .program
            .find_extern_fn(name)
            .cloned()
            .ok_or_else(|| Self::codegen_err(format!("unresolved function '{}'", name)))?;
        let sym = self.emit_resolve_symbol(builder, &ext)?;
        Ok((sym, PrimType::Ptr))
    }

    /// `rt_dlsym` on the declaring library's handle cell, panicking
    /// with the loader's message when the symbol is missing.
    fn emit_resolve_symbol(
        &mut self,
        builder: &mut FunctionBuilder,
        ext: &ExternFn,
    ) -> Result<Value, FusionError> {
        let data_id = *self.lib_cells.get(&ext.lib_name).ok_or_else(|| {
            Self::codegen_err(format!(
                "extern fn '{}' references unknown lib '{}'",
                ext.name, ext.lib_name
            ))
        })?;
        let gv = self.module.declare_data_in_func(data_id, builder.func);
        let cell = builder.ins().symbol_value(self.ptr_type, gv);
        let handle = builder
            .ins()
            .load(self.ptr_type, MemFlags::trusted(), cell, 0);
        let name = self.emit_cstring(builder, &ext.name);
        let sym = self
            .call_runtime(builder, self.runtime.dlsym, &[handle, name])
            .expect("rt_dlsym returns a pointer");
        let ok = builder.ins().icmp_imm(IntCC::NotEqual, sym, 0);
        self.emit_check_or_runtime_panic(builder, ok, self.runtime.dlerror_last);
        Ok(sym)
    }

    fn emit_user_call(
        &mut self,
        builder: &mut FunctionBuilder,
        callee: &str,
        args: &[Expr],
    ) -> Result<(Value, PrimType), FusionError> {
        let fndef = self
            .program
            .find_user_fn(callee)
            .ok_or_else(|| Self::codegen_err(format!("unresolved function '{}'", callee)))?
            .clone();
        let func_id = self.user_funcs[callee];

        let mut values: SmallVec<[Value; 8]> = SmallVec::new();
        for (arg, param) in args.iter().zip(fndef.params.iter()) {
            let (value, ty) = self.emit_expr(builder, arg)?;
            values.push(self.coerce(builder, value, ty, param.ty));
        }

        let func_ref = self.module.declare_func_in_func(func_id, builder.func);
        let call = builder.ins().call(func_ref, &values);
        match builder.inst_results(call).first().copied() {
            Some(value) => Ok((value, fndef.return_type)),
            None => Ok(self.void_value(builder)),
        }
    }

    /// Indirect call through a recovered signature: null-check the
    /// target, coerce arguments to the parameter types, and
    /// `call_indirect` through an imported signature.
    fn emit_indirect_call(
        &mut self,
        builder: &mut FunctionBuilder,
        args: &[Expr],
        sig: &FnSig,
    ) -> Result<(Value, PrimType), FusionError> {
        let (target, _) = self.emit_expr(builder, &args[0])?;
        let ok = builder.ins().icmp_imm(IntCC::NotEqual, target, 0);
        self.emit_check(builder, ok, "call on null function pointer");

        let mut values: SmallVec<[Value; 8]> = SmallVec::new();
        for (arg, param) in args[1..].iter().zip(sig.params.iter()) {
            let (value, ty) = self.emit_expr(builder, arg)?;
            values.push(self.coerce(builder, value, ty, *param));
        }

        let mut clif_sig = self.module.make_signature();
        for param in &sig.params {
            clif_sig.params.push(AbiParam::new(self.clif_type(*param)));
        }
        if sig.ret != PrimType::Void {
            clif_sig
                .returns
                .push(AbiParam::new(self.clif_type(sig.ret)));
        }
        let sig_ref = builder.import_signature(clif_sig);
        let call = builder.ins().call_indirect(sig_ref, target, &values);
        match builder.inst_results(call).first().copied() {
            Some(value) => Ok((value, sig.ret)),
            None => Ok(self.void_value(builder)),
        }
    }

    /// External call through the runtime trampoline: resolve the
    /// symbol, build the FFI signature, serialize the arguments into
    /// 8-byte slots, invoke, and read the typed result back.
    fn emit_extern_call(
        &mut self,
        builder: &mut FunctionBuilder,
        ext: &ExternFn,
        args: &[Expr],
    ) -> Result<(Value, PrimType), FusionError> {
        let sym = self.emit_resolve_symbol(builder, ext)?;

        // FFI signature from the declared parameter and result kinds.
        let nargs = ext.params.len();
        let kinds_ptr = if nargs == 0 {
            builder.ins().iconst(self.ptr_type, 0)
        } else {
            let slot = builder.create_sized_stack_slot(StackSlotData::new(
                StackSlotKind::ExplicitSlot,
                (nargs * 4) as u32,
                2,
            ));
            for (i, param) in ext.params.iter().enumerate() {
                let kind = builder.ins().iconst(I32, param.ty.ffi_kind() as i64);
                builder.ins().stack_store(kind, slot, (i * 4) as i32);
            }
            builder.ins().stack_addr(self.ptr_type, slot, 0)
        };
        let ret_kind = builder
            .ins()
            .iconst(I32, ext.return_type.ffi_kind() as i64);
        let nargs_val = builder.ins().iconst(I32, nargs as i64);
        let sig = self
            .call_runtime(
                builder,
                self.runtime.ffi_sig_create,
                &[ret_kind, nargs_val, kinds_ptr],
            )
            .expect("rt_ffi_sig_create returns a pointer");
        let sig_ok = builder.ins().icmp_imm(IntCC::NotEqual, sig, 0);
        self.emit_check(builder, sig_ok, "rt_ffi_sig_create failed");

        // One 8-byte slot per argument: doubles as doubles, floats in
        // the low half, pointers and integers as 64-bit integers.
        let args_ptr = if nargs == 0 {
            builder.ins().iconst(self.ptr_type, 0)
        } else {
            let slot = builder.create_sized_stack_slot(StackSlotData::new(
                StackSlotKind::ExplicitSlot,
                (nargs * 8) as u32,
                3,
            ));
            for (i, (arg, param)) in args.iter().zip(ext.params.iter()).enumerate() {
                let (value, ty) = self.emit_expr(builder, arg)?;
                let offset = (i * 8) as i32;
                match param.ty {
                    PrimType::F64 => {
                        let value = self.coerce(builder, value, ty, PrimType::F64);
                        builder.ins().stack_store(value, slot, offset);
                    }
                    PrimType::F32 => {
                        let value = self.coerce(builder, value, ty, PrimType::F32);
                        builder.ins().stack_store(value, slot, offset);
                    }
                    _ => {
                        let value = self.coerce(builder, value, ty, PrimType::I64);
                        builder.ins().stack_store(value, slot, offset);
                    }
                }
            }
            builder.ins().stack_addr(self.ptr_type, slot, 0)
        };

        let ret_slot = builder.create_sized_stack_slot(StackSlotData::new(
            StackSlotKind::ExplicitSlot,
            8,
            3,
        ));
        let ret_ptr = builder.ins().stack_addr(self.ptr_type, ret_slot, 0);

        let rc = self
            .call_runtime(builder, self.runtime.ffi_call, &[sig, sym, args_ptr, ret_ptr])
            .expect("rt_ffi_call returns a status");
        let rc_ok = builder.ins().icmp_imm(IntCC::Equal, rc, 0);
        self.emit_check(builder, rc_ok, "rt_ffi_call failed");

        let result = match ext.return_type {
            PrimType::Void => self.void_value(builder),
            PrimType::I32 => (builder.ins().stack_load(I32, ret_slot, 0), PrimType::I32),
            PrimType::I64 => (builder.ins().stack_load(I64, ret_slot, 0), PrimType::I64),
            PrimType::F32 => (builder.ins().stack_load(F32, ret_slot, 0), PrimType::F32),
            PrimType::F64 => (builder.ins().stack_load(F64, ret_slot, 0), PrimType::F64),
            PrimType::Ptr => (
                builder.ins().stack_load(self.ptr_type, ret_slot, 0),
                PrimType::Ptr,
            ),
        };
        Ok(result)
    }
}
