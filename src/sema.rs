//! Semantic analysis.
//!
//! One typed walk over the whole program. The analyzer owns lookup
//! tables for extern and user functions, the record layout map, and a
//! stack of scopes. Each scope tracks three things in parallel: the
//! type of every binding, the element type of bindings that hold
//! arrays, and the signature of bindings that hold function pointers.
//!
//! The walk also performs the one piece of mutation in the pipeline:
//! every `call(target, ...)` node gets its recovered (or inferred)
//! signature written back so the emitter can consume it without
//! re-deriving.
//!
//! First error wins; there is no recovery.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::ast::*;
use crate::error::FusionError;
use crate::layout::{build_layout_map, LayoutMap};

type SemaResult<T> = Result<T, FusionError>;

#[derive(Default)]
struct Scope {
    vars: FxHashMap<String, PrimType>,
    elems: FxHashMap<String, PrimType>,
    sigs: FxHashMap<String, FnSig>,
}

pub struct Analyzer {
    extern_fns: FxHashMap<String, FnSig>,
    user_fns: FxHashMap<String, FnSig>,
    layouts: LayoutMap,
    struct_names: FxHashSet<String>,
    scopes: Vec<Scope>,
    /// Declared return type while checking a function body; `None` at
    /// top level. Also feeds result-type inference for indirect calls
    /// inside `return` expressions.
    expected_return: Option<PrimType>,
    current_fn: Option<String>,
}

/// Check the program and write recovered indirect-call signatures back
/// onto their call nodes.
pub fn analyze(program: &mut Program) -> Result<(), FusionError> {
    Analyzer::new(program)?.check_program(program)
}

fn err(message: impl Into<String>) -> FusionError {
    FusionError::semantic(message)
}

/// The implicit Ptr<->I64 coercion pair. Lax, but required by existing
/// programs that pack pointers into integer fields.
fn ptr_i64_pair(a: PrimType, b: PrimType) -> bool {
    matches!(
        (a, b),
        (PrimType::Ptr, PrimType::I64) | (PrimType::I64, PrimType::Ptr)
    )
}

fn assign_compatible(dst: PrimType, src: PrimType) -> bool {
    dst == src || ptr_i64_pair(dst, src)
}

/// Argument compatibility at indirect call sites: numeric coercions
/// plus the Ptr<->I64 pair.
fn indirect_arg_compatible(param: PrimType, arg: PrimType) -> bool {
    param == arg || (param.is_numeric() && arg.is_numeric()) || ptr_i64_pair(param, arg)
}

impl Analyzer {
    fn new(program: &Program) -> SemaResult<Self> {
        if program.top_level.is_empty() {
            return Err(err("no program or no statements"));
        }
        if !program.extern_fns.is_empty() && program.libs.is_empty() {
            return Err(err(
                "at least one extern lib required when declaring extern fn",
            ));
        }

        let mut fn_names: FxHashSet<&str> = FxHashSet::default();
        for f in &program.user_fns {
            if !fn_names.insert(&f.name) {
                return Err(err(format!("duplicate function '{}'", f.name)));
            }
        }
        for ext in &program.extern_fns {
            if !fn_names.insert(&ext.name) {
                return Err(err(format!("duplicate function '{}'", ext.name)));
            }
        }

        let lib_names: FxHashSet<&str> = program.libs.iter().map(|l| l.name.as_str()).collect();
        for ext in &program.extern_fns {
            if !lib_names.contains(ext.lib_name.as_str()) {
                return Err(err(format!(
                    "extern fn '{}' references unknown lib '{}'",
                    ext.name, ext.lib_name
                )));
            }
            for param in &ext.params {
                if let Some(name) = &param.type_name {
                    if !program.is_named_type(name) {
                        return Err(err(format!(
                            "unknown type '{}' in extern fn '{}'",
                            name, ext.name
                        )));
                    }
                }
            }
            if let Some(name) = &ext.return_type_name {
                if !program.is_named_type(name) {
                    return Err(err(format!(
                        "unknown return type '{}' in extern fn '{}'",
                        name, ext.name
                    )));
                }
            }
        }

        Ok(Analyzer {
            extern_fns: program
                .extern_fns
                .iter()
                .map(|f| (f.name.clone(), f.sig()))
                .collect(),
            user_fns: program
                .user_fns
                .iter()
                .map(|f| (f.name.clone(), f.sig()))
                .collect(),
            layouts: build_layout_map(&program.structs),
            struct_names: program.structs.iter().map(|s| s.name.clone()).collect(),
            scopes: Vec::new(),
            expected_return: None,
            current_fn: None,
        })
    }

    fn check_program(&mut self, program: &mut Program) -> SemaResult<()> {
        for fndef in &mut program.user_fns {
            self.check_fn(fndef)?;
        }

        self.expected_return = None;
        self.current_fn = None;
        self.scopes.push(Scope::default());
        for stmt in &mut program.top_level {
            self.check_stmt(stmt)?;
        }
        self.scopes.pop();
        Ok(())
    }

    fn check_fn(&mut self, fndef: &mut FnDef) -> SemaResult<()> {
        self.expected_return = Some(fndef.return_type);
        self.current_fn = Some(fndef.name.clone());

        let mut scope = Scope::default();
        for param in &fndef.params {
            if scope.vars.insert(param.name.clone(), param.ty).is_some() {
                return Err(err(format!(
                    "duplicate parameter '{}' in fn '{}'",
                    param.name, fndef.name
                )));
            }
        }
        self.scopes.push(scope);
        for stmt in &mut fndef.body {
            self.check_stmt(stmt)?;
        }
        self.scopes.pop();

        self.expected_return = None;
        self.current_fn = None;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Scope lookups
    // ------------------------------------------------------------------

    fn lookup_var(&self, name: &str) -> Option<PrimType> {
        self.scopes
            .iter()
            .rev()
            .find_map(|s| s.vars.get(name).copied())
    }

    fn lookup_elem(&self, name: &str) -> Option<PrimType> {
        self.scopes
            .iter()
            .rev()
            .find_map(|s| s.elems.get(name).copied())
    }

    fn lookup_sig(&self, name: &str) -> Option<FnSig> {
        self.scopes
            .iter()
            .rev()
            .find_map(|s| s.sigs.get(name).cloned())
    }

    fn current_scope(&mut self) -> &mut Scope {
        self.scopes.last_mut().expect("scope stack is never empty")
    }

    /// Refresh the array-element and function-pointer annotations of an
    /// existing binding, in whichever scope defines it. An annotation
    /// is lost on reassignment from a source that does not carry one.
    fn update_annotations(&mut self, name: &str, elem: Option<PrimType>, sig: Option<FnSig>) {
        for scope in self.scopes.iter_mut().rev() {
            if scope.vars.contains_key(name) {
                match elem {
                    Some(ty) => {
                        scope.elems.insert(name.to_string(), ty);
                    }
                    None => {
                        scope.elems.remove(name);
                    }
                }
                match sig {
                    Some(s) => {
                        scope.sigs.insert(name.to_string(), s);
                    }
                    None => {
                        scope.sigs.remove(name);
                    }
                }
                return;
            }
        }
    }

    // ------------------------------------------------------------------
    // Annotation extraction
    // ------------------------------------------------------------------

    /// Array element type carried by an expression, if any.
    fn elem_type_of(&self, expr: &Expr) -> Option<PrimType> {
        match expr {
            Expr::AllocArray { elem_type, .. } => PrimType::from_name(elem_type),
            Expr::Call {
                callee, type_arg, ..
            } if callee == "range" => Some(type_arg.unwrap_or(PrimType::I64)),
            Expr::Var(name) => self.lookup_elem(name),
            _ => None,
        }
    }

    /// Signature of a bare identifier that names a function and is not
    /// shadowed by a binding. Such a name is itself a `Ptr` value.
    fn direct_fn_ref(&self, expr: &Expr) -> Option<FnSig> {
        match expr {
            Expr::Var(name) if self.lookup_var(name).is_none() => self
                .user_fns
                .get(name)
                .or_else(|| self.extern_fns.get(name))
                .cloned(),
            _ => None,
        }
    }

    /// Function-pointer signature carried by an expression: a direct
    /// reference to a named function, a `get_func_ptr` call, or a
    /// variable that already holds a signature.
    fn sig_of(&self, expr: &Expr) -> Option<FnSig> {
        match expr {
            Expr::Var(name) => self
                .lookup_sig(name)
                .or_else(|| self.direct_fn_ref(expr)),
            Expr::Call { callee, args, .. } if callee == "get_func_ptr" => match args.first() {
                Some(Expr::Var(name)) => self
                    .user_fns
                    .get(name)
                    .or_else(|| self.extern_fns.get(name))
                    .cloned(),
                _ => None,
            },
            _ => None,
        }
    }

    /// Type an expression in value position, where a bare function name
    /// is a `Ptr` rather than an undefined variable.
    fn check_value_expr(&mut self, expr: &mut Expr) -> SemaResult<PrimType> {
        if self.direct_fn_ref(expr).is_some() {
            return Ok(PrimType::Ptr);
        }
        self.check_expr(expr)
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn check_expr(&mut self, expr: &mut Expr) -> SemaResult<PrimType> {
        match expr {
            Expr::Int(_) => Ok(PrimType::I64),
            Expr::Float(_) => Ok(PrimType::F64),
            Expr::Str(_) => Ok(PrimType::Ptr),
            Expr::Binary { left, right, .. } => {
                let l = self.check_expr(left)?;
                let r = self.check_expr(right)?;
                if l == PrimType::F64 || r == PrimType::F64 {
                    Ok(PrimType::F64)
                } else {
                    Ok(PrimType::I64)
                }
            }
            Expr::Compare { op, left, right } => {
                let l = self.check_expr(left)?;
                let r = self.check_expr(right)?;
                if l == PrimType::Ptr && r == PrimType::Ptr {
                    if !matches!(op, CmpOp::Eq | CmpOp::Ne) {
                        return Err(err("pointer comparison only supports == and !="));
                    }
                } else if !l.is_numeric() || !r.is_numeric() {
                    return Err(err("comparison requires numeric operands"));
                }
                Ok(PrimType::I64)
            }
            Expr::Var(name) => self
                .lookup_var(name)
                .ok_or_else(|| err(format!("undefined variable '{}'", name))),
            Expr::Alloc { type_name } => {
                if !self.is_alloc_type(type_name) {
                    return Err(err(format!("alloc: unknown type '{}'", type_name)));
                }
                Ok(PrimType::Ptr)
            }
            Expr::AllocArray { elem_type, count } => {
                if !self.is_alloc_type(elem_type) {
                    return Err(err(format!("alloc_array: unknown type '{}'", elem_type)));
                }
                if self.check_expr(count)? != PrimType::I64 {
                    return Err(err("alloc_array: count must be i64"));
                }
                Ok(PrimType::Ptr)
            }
            Expr::AllocBytes { size } => {
                if self.check_expr(size)? != PrimType::I64 {
                    return Err(err("alloc_bytes: size must be i64"));
                }
                Ok(PrimType::Ptr)
            }
            Expr::AddrOf { var } => {
                if self.lookup_var(var).is_none() {
                    return Err(err(format!("undefined variable '{}'", var)));
                }
                Ok(PrimType::Ptr)
            }
            Expr::Load { kind, ptr } => {
                if self.check_expr(ptr)? != PrimType::Ptr {
                    return Err(err("load: argument must be a pointer"));
                }
                Ok(kind.result_type())
            }
            Expr::Store { ptr, value } => {
                if self.check_expr(ptr)? != PrimType::Ptr {
                    return Err(err("store: first argument must be a pointer"));
                }
                self.check_expr(value)?;
                Ok(PrimType::Void)
            }
            Expr::LoadField {
                ptr,
                struct_name,
                field,
            } => {
                if self.check_expr(ptr)? != PrimType::Ptr {
                    return Err(err("load_field: first argument must be a pointer"));
                }
                self.field_type(struct_name, field, "load_field")
            }
            Expr::StoreField {
                ptr,
                struct_name,
                field,
                value,
            } => {
                if self.check_expr(ptr)? != PrimType::Ptr {
                    return Err(err("store_field: first argument must be a pointer"));
                }
                let field_ty = self.field_type(struct_name, field, "store_field")?;
                let val_ty = self.check_expr(value)?;
                if !assign_compatible(field_ty, val_ty) {
                    return Err(err("store_field: value type does not match field type"));
                }
                Ok(PrimType::Void)
            }
            Expr::Index { base, index } => {
                let elem = if let Expr::Var(name) = base.as_ref() {
                    self.lookup_elem(name)
                } else {
                    None
                };
                if self.check_expr(base)? != PrimType::Ptr {
                    return Err(err("cannot index a non-pointer value"));
                }
                if self.check_expr(index)? != PrimType::I64 {
                    return Err(err("array index must be i64"));
                }
                Ok(elem.unwrap_or(PrimType::I64))
            }
            Expr::Cast { operand, target } => {
                let from = self.check_expr(operand)?;
                let ok = (from.is_numeric() && target.is_numeric())
                    || (from == PrimType::Ptr && *target == PrimType::Ptr);
                if !ok {
                    return Err(err(format!(
                        "invalid cast from {} to {}",
                        from.name(),
                        target.name()
                    )));
                }
                Ok(*target)
            }
            Expr::Call { .. } => self.check_call(expr),
        }
    }

    fn is_alloc_type(&self, name: &str) -> bool {
        matches!(name, "i32" | "i64" | "f32" | "f64" | "ptr")
            || self.struct_names.contains(name)
    }

    fn field_type(&self, struct_name: &str, field: &str, what: &str) -> SemaResult<PrimType> {
        let layout = self
            .layouts
            .get(struct_name)
            .ok_or_else(|| err(format!("{}: unknown struct '{}'", what, struct_name)))?;
        layout
            .field(field)
            .map(|f| f.ty)
            .ok_or_else(|| {
                err(format!(
                    "{}: unknown field '{}' in struct '{}'",
                    what, field, struct_name
                ))
            })
    }

    // ------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------

    fn check_call(&mut self, expr: &mut Expr) -> SemaResult<PrimType> {
        let Expr::Call {
            callee,
            args,
            type_arg,
            inferred_sig,
        } = expr
        else {
            unreachable!("check_call on non-call expression");
        };
        let callee = callee.clone();

        match callee.as_str() {
            "print" => {
                if args.is_empty() || args.len() > 2 {
                    return Err(err("print expects one or two arguments"));
                }
                let arg_ty = self.check_expr(&mut args[0])?;
                if !matches!(arg_ty, PrimType::I64 | PrimType::F64 | PrimType::Ptr) {
                    return Err(err("print expects i64, f64, or string argument"));
                }
                if args.len() == 2 && self.check_expr(&mut args[1])? != PrimType::I64 {
                    return Err(err("print: stream must be i64"));
                }
                Ok(PrimType::Void)
            }
            "range" => {
                if args.is_empty() || args.len() > 2 {
                    return Err(err("range expects one or two bounds"));
                }
                for arg in args.iter_mut() {
                    if self.check_expr(arg)? != PrimType::I64 {
                        return Err(err("range bounds must be i64"));
                    }
                }
                if let Some(ty) = type_arg {
                    if !ty.is_numeric() {
                        return Err(err("range element type must be i32, i64, f32, or f64"));
                    }
                }
                Ok(PrimType::Ptr)
            }
            "read_line" => {
                if !args.is_empty() {
                    return Err(err("read_line expects no arguments"));
                }
                Ok(PrimType::Ptr)
            }
            "to_str" => {
                if args.len() != 1 {
                    return Err(err("to_str expects exactly one argument"));
                }
                let ty = self.check_expr(&mut args[0])?;
                if !matches!(ty, PrimType::I64 | PrimType::F64) {
                    return Err(err("to_str expects i64 or f64 argument"));
                }
                Ok(PrimType::Ptr)
            }
            "from_str" => {
                if args.len() != 1 {
                    return Err(err("from_str expects a string and a type"));
                }
                if self.check_expr(&mut args[0])? != PrimType::Ptr {
                    return Err(err("from_str: first argument must be a string"));
                }
                match type_arg {
                    Some(PrimType::I64) => Ok(PrimType::I64),
                    Some(PrimType::F64) => Ok(PrimType::F64),
                    _ => Err(err("from_str: second argument must be i64 or f64")),
                }
            }
            "open" => {
                self.check_builtin_args(args, &[PrimType::Ptr, PrimType::Ptr], "open")?;
                Ok(PrimType::Ptr)
            }
            "close" => {
                self.check_builtin_args(args, &[PrimType::Ptr], "close")?;
                Ok(PrimType::Void)
            }
            "read_line_file" => {
                self.check_builtin_args(args, &[PrimType::Ptr], "read_line_file")?;
                Ok(PrimType::Ptr)
            }
            "write_file" => {
                if args.len() != 2 {
                    return Err(err("call to 'write_file' has wrong number of arguments"));
                }
                if self.check_expr(&mut args[0])? != PrimType::Ptr {
                    return Err(err("write_file: handle must be a pointer"));
                }
                let val_ty = self.check_expr(&mut args[1])?;
                if !matches!(val_ty, PrimType::I64 | PrimType::F64 | PrimType::Ptr) {
                    return Err(err("write_file: value must be i64, f64, or string"));
                }
                Ok(PrimType::Void)
            }
            "eof_file" => {
                self.check_builtin_args(args, &[PrimType::Ptr], "eof_file")?;
                Ok(PrimType::I64)
            }
            "line_count_file" => {
                self.check_builtin_args(args, &[PrimType::Ptr], "line_count_file")?;
                Ok(PrimType::I64)
            }
            "get_func_ptr" => {
                let name = match args.first() {
                    Some(Expr::Var(name)) => name.clone(),
                    _ => return Err(err("get_func_ptr: argument must name a function")),
                };
                if !self.user_fns.contains_key(&name) && !self.extern_fns.contains_key(&name) {
                    return Err(err(format!("get_func_ptr: unknown function '{}'", name)));
                }
                Ok(PrimType::Ptr)
            }
            "call" => {
                if args.is_empty() {
                    return Err(err("call expects a function pointer argument"));
                }
                if self.check_value_expr(&mut args[0])? != PrimType::Ptr {
                    return Err(err("call: target must be a pointer"));
                }
                let sig = match self.sig_of(&args[0]) {
                    Some(sig) => sig,
                    None => {
                        // No annotation reaches this site: infer the
                        // parameters from the actuals and the result
                        // from the surrounding expected return type.
                        let mut params = Vec::with_capacity(args.len() - 1);
                        for arg in args[1..].iter_mut() {
                            params.push(self.check_expr(arg)?);
                        }
                        let ret = self.expected_return.unwrap_or(PrimType::Void);
                        let sig = FnSig { params, ret };
                        *inferred_sig = Some(sig.clone());
                        return Ok(sig.ret);
                    }
                };
                if sig.params.len() != args.len() - 1 {
                    return Err(err(
                        "call through function pointer has wrong number of arguments",
                    ));
                }
                for (arg, param) in args[1..].iter_mut().zip(sig.params.iter()) {
                    let arg_ty = self.check_expr(arg)?;
                    if !indirect_arg_compatible(*param, arg_ty) {
                        return Err(err("argument type mismatch in indirect call"));
                    }
                }
                *inferred_sig = Some(sig.clone());
                Ok(sig.ret)
            }
            _ => {
                let sig = self
                    .extern_fns
                    .get(&callee)
                    .or_else(|| self.user_fns.get(&callee))
                    .cloned()
                    .ok_or_else(|| err(format!("unknown function '{}'", callee)))?;
                if args.len() != sig.params.len() {
                    return Err(err(format!(
                        "call to '{}' has wrong number of arguments",
                        callee
                    )));
                }
                for (arg, param) in args.iter_mut().zip(sig.params.iter()) {
                    let arg_ty = self.check_expr(arg)?;
                    if arg_ty != *param {
                        return Err(err(format!(
                            "argument type mismatch in call to '{}'",
                            callee
                        )));
                    }
                }
                Ok(sig.ret)
            }
        }
    }

    fn check_builtin_args(
        &mut self,
        args: &mut [Expr],
        expected: &[PrimType],
        name: &str,
    ) -> SemaResult<()> {
        if args.len() != expected.len() {
            return Err(err(format!(
                "call to '{}' has wrong number of arguments",
                name
            )));
        }
        for (arg, want) in args.iter_mut().zip(expected) {
            if self.check_expr(arg)? != *want {
                return Err(err(format!("argument type mismatch in call to '{}'", name)));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn check_stmt(&mut self, stmt: &mut Stmt) -> SemaResult<()> {
        match stmt {
            Stmt::Return(expr) => {
                let expected = match self.expected_return {
                    Some(ty) => ty,
                    None => return Err(err("return outside function")),
                };
                let actual = self.check_expr(expr)?;
                if actual != expected {
                    let fn_name = self.current_fn.as_deref().unwrap_or("?");
                    return Err(err(format!(
                        "return type mismatch in fn '{}': expected {}, got {}",
                        fn_name,
                        expected.name(),
                        actual.name()
                    )));
                }
                Ok(())
            }
            Stmt::Let { name, init } => {
                let ty = self.check_value_expr(init)?;
                if ty == PrimType::Void {
                    return Err(err(format!("let binding '{}' has void type", name)));
                }
                let elem = self.elem_type_of(init);
                let sig = self.sig_of(init);
                let scope = self.current_scope();
                if scope.vars.contains_key(name) {
                    return Err(err(format!("duplicate variable '{}'", name)));
                }
                scope.vars.insert(name.clone(), ty);
                if let Some(elem_ty) = elem {
                    scope.elems.insert(name.clone(), elem_ty);
                }
                if let Some(fn_sig) = sig {
                    scope.sigs.insert(name.clone(), fn_sig);
                }
                Ok(())
            }
            Stmt::Expr(expr) => {
                self.check_expr(expr)?;
                Ok(())
            }
            Stmt::If {
                cond,
                then_body,
                else_body,
            } => {
                self.check_expr(cond)?;
                self.scopes.push(Scope::default());
                for s in then_body {
                    self.check_stmt(s)?;
                }
                self.scopes.pop();
                self.scopes.push(Scope::default());
                for s in else_body {
                    self.check_stmt(s)?;
                }
                self.scopes.pop();
                Ok(())
            }
            Stmt::For {
                var,
                iterable,
                body,
            } => {
                if self.check_expr(iterable)? != PrimType::Ptr {
                    return Err(err("for loop iterable must be an array"));
                }
                let elem = self
                    .elem_type_of(iterable)
                    .ok_or_else(|| err("for loop iterable must be an array"))?;
                if self.lookup_var(var).is_some() {
                    return Err(err(format!("duplicate variable '{}'", var)));
                }
                let mut scope = Scope::default();
                scope.vars.insert(var.clone(), elem);
                self.scopes.push(scope);
                for s in body {
                    self.check_stmt(s)?;
                }
                self.scopes.pop();
                Ok(())
            }
            Stmt::Assign { target, value } => {
                match target {
                    Expr::Var(name) => {
                        let name = name.clone();
                        let dst_ty = self
                            .lookup_var(&name)
                            .ok_or_else(|| err(format!("undefined variable '{}'", name)))?;
                        let src_ty = self.check_value_expr(value)?;
                        if !assign_compatible(dst_ty, src_ty) {
                            return Err(err(format!(
                                "assignment type mismatch for '{}': expected {}, got {}",
                                name,
                                dst_ty.name(),
                                src_ty.name()
                            )));
                        }
                        let elem = self.elem_type_of(value);
                        let sig = self.sig_of(value);
                        self.update_annotations(&name, elem, sig);
                        Ok(())
                    }
                    Expr::Index { .. } => {
                        let dst_ty = self.check_expr(target)?;
                        let src_ty = self.check_value_expr(value)?;
                        if !assign_compatible(dst_ty, src_ty) {
                            return Err(err("assignment type mismatch in array element"));
                        }
                        Ok(())
                    }
                    _ => Err(err("left side of assignment must be a variable or an index")),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::lex;
    use crate::parser::parse;

    fn analyze_source(source: &str) -> Result<Program, FusionError> {
        let mut program = parse(&lex(source)).expect("parse failed");
        analyze(&mut program)?;
        Ok(program)
    }

    fn expect_semantic_error(source: &str) -> String {
        match analyze_source(source) {
            Ok(_) => panic!("analysis unexpectedly succeeded"),
            Err(FusionError::Semantic { message }) => message,
            Err(other) => panic!("unexpected error kind: {:?}", other),
        }
    }

    #[test]
    fn test_simple_print_program() {
        analyze_source("print(1 + 2);").unwrap();
    }

    #[test]
    fn test_let_binding_and_use() {
        analyze_source("let x = 1 + 2; print(x);").unwrap();
    }

    #[test]
    fn test_print_arity_error() {
        let msg = expect_semantic_error("print(1, 2, 3);");
        assert_eq!(msg, "print expects one or two arguments");
    }

    #[test]
    fn test_undefined_variable() {
        let msg = expect_semantic_error("let x = 1; print(y);");
        assert_eq!(msg, "undefined variable 'y'");
    }

    #[test]
    fn test_duplicate_variable() {
        let msg = expect_semantic_error("let x = 1; let x = 2; print(x);");
        assert_eq!(msg, "duplicate variable 'x'");
    }

    #[test]
    fn test_then_branch_binding_does_not_escape() {
        let msg = expect_semantic_error(
            "if (1) { let inner = 2; print(inner); }
             print(inner);",
        );
        assert_eq!(msg, "undefined variable 'inner'");
    }

    #[test]
    fn test_loop_variable_does_not_escape() {
        let msg = expect_semantic_error(
            "let a = alloc_array(i64, 3);
             for x in a { print(x); }
             print(x);",
        );
        assert_eq!(msg, "undefined variable 'x'");
    }

    #[test]
    fn test_loop_variable_may_not_duplicate_outer() {
        let msg = expect_semantic_error(
            "let x = 1;
             let a = alloc_array(i64, 3);
             for x in a { print(x); }",
        );
        assert_eq!(msg, "duplicate variable 'x'");
    }

    #[test]
    fn test_inner_scope_shadowing_is_allowed() {
        analyze_source(
            "let x = 1;
             if (x) { let y = 2; print(y); }
             print(x);",
        )
        .unwrap();
    }

    #[test]
    fn test_float_contagion() {
        analyze_source("let f = 1 + 2.0; f = 3.5; print(f);").unwrap();
        let msg = expect_semantic_error("let f = 1 + 2.0; f = 3; print(f);");
        assert!(msg.contains("assignment type mismatch"), "{}", msg);
    }

    #[test]
    fn test_pointer_comparison_rules() {
        analyze_source("let a = alloc_bytes(8); let b = alloc_bytes(8); print(a == b);").unwrap();
        let msg = expect_semantic_error(
            "let a = alloc_bytes(8); let b = alloc_bytes(8); print(a < b);",
        );
        assert_eq!(msg, "pointer comparison only supports == and !=");
    }

    #[test]
    fn test_return_outside_function() {
        let msg = expect_semantic_error("return 1; print(1);");
        assert_eq!(msg, "return outside function");
    }

    #[test]
    fn test_return_type_mismatch() {
        let msg = expect_semantic_error(
            "fn f() -> i64 { return 1.5; }
             print(f());",
        );
        assert!(msg.contains("return type mismatch in fn 'f'"), "{}", msg);
    }

    #[test]
    fn test_direct_call_requires_exact_types() {
        let msg = expect_semantic_error(
            "fn f(x: i64) -> i64 { return x; }
             print(f(1.5));",
        );
        assert_eq!(msg, "argument type mismatch in call to 'f'");
    }

    #[test]
    fn test_call_arity_mismatch() {
        let msg = expect_semantic_error(
            "fn f(x: i64) -> i64 { return x; }
             print(f(1, 2));",
        );
        assert_eq!(msg, "call to 'f' has wrong number of arguments");
    }

    #[test]
    fn test_unknown_function() {
        let msg = expect_semantic_error("print(nope(1));");
        assert_eq!(msg, "unknown function 'nope'");
    }

    #[test]
    fn test_alloc_unknown_type() {
        let msg = expect_semantic_error("let p = alloc(Nope); print(1);");
        assert_eq!(msg, "alloc: unknown type 'Nope'");
    }

    #[test]
    fn test_struct_field_checking() {
        analyze_source(
            "struct P { x: f64; };
             let p = alloc(P);
             store_field(p, P, x, 1.0);
             print(load_field(p, P, x));",
        )
        .unwrap();
        let msg = expect_semantic_error(
            "struct P { x: f64; };
             let p = alloc(P);
             print(load_field(p, P, nope));",
        );
        assert_eq!(msg, "load_field: unknown field 'nope' in struct 'P'");
    }

    #[test]
    fn test_store_field_allows_ptr_i64_packing() {
        analyze_source(
            "struct Cell { raw: i64; };
             let c = alloc(Cell);
             store_field(c, Cell, raw, alloc_bytes(8));
             print(1);",
        )
        .unwrap();
    }

    #[test]
    fn test_index_recovers_element_type() {
        // The f64 element type must flow through the let so the index
        // expression types as f64 and feeds float contagion.
        analyze_source(
            "let a = alloc_array(f64, 2);
             a[0] = 1.5;
             let x = a[0] + 1.0;
             print(x);",
        )
        .unwrap();
    }

    #[test]
    fn test_index_requires_pointer_base() {
        let msg = expect_semantic_error("let n = 3; print(n[0]);");
        assert_eq!(msg, "cannot index a non-pointer value");
    }

    #[test]
    fn test_for_requires_array_annotation() {
        let msg = expect_semantic_error("let p = alloc_bytes(8); for x in p { print(x); }");
        assert_eq!(msg, "for loop iterable must be an array");
    }

    #[test]
    fn test_range_is_iterable() {
        analyze_source("for i in range(10) { print(i); }").unwrap();
        analyze_source("for f in range(0, 5, f64) { print(f); }").unwrap();
    }

    #[test]
    fn test_cast_rules() {
        analyze_source("let x = 1 as f64; print(x);").unwrap();
        analyze_source("let p = alloc_bytes(8) as ptr; print(1);").unwrap();
        let msg = expect_semantic_error("let p = alloc_bytes(8) as i64; print(p);");
        assert_eq!(msg, "invalid cast from ptr to i64");
    }

    #[test]
    fn test_extern_fn_requires_lib() {
        let mut program = parse(&lex("print(1);")).unwrap();
        program.extern_fns.push(ExternFn {
            name: "orphan".to_string(),
            params: Vec::new(),
            return_type: PrimType::Void,
            return_type_name: None,
            lib_name: String::new(),
        });
        let result = analyze(&mut program);
        match result {
            Err(FusionError::Semantic { message }) => assert_eq!(
                message,
                "at least one extern lib required when declaring extern fn"
            ),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_extern_call_checked_against_declaration() {
        analyze_source(
            r#"extern lib "libm.so.6" { fn cos(x: f64) -> f64; };
               print(cos(0.0));"#,
        )
        .unwrap();
        let msg = expect_semantic_error(
            r#"extern lib "libm.so.6" { fn cos(x: f64) -> f64; };
               print(cos(0));"#,
        );
        assert_eq!(msg, "argument type mismatch in call to 'cos'");
    }

    #[test]
    fn test_get_func_ptr_and_indirect_call_signature() {
        let program = analyze_source(
            "fn add(x: f64, y: f64) -> f64 { return x + y; }
             let fp = get_func_ptr(add);
             print(call(fp, 1.0, 2.0));",
        )
        .unwrap();
        // The signature must be written back onto the call node.
        let call_stmt = &program.top_level[1];
        let mut found = false;
        if let Stmt::Expr(Expr::Call { args, .. }) = call_stmt {
            if let Expr::Call {
                callee,
                inferred_sig,
                ..
            } = &args[0]
            {
                assert_eq!(callee, "call");
                let sig = inferred_sig.as_ref().expect("signature not written back");
                assert_eq!(sig.params, vec![PrimType::F64, PrimType::F64]);
                assert_eq!(sig.ret, PrimType::F64);
                found = true;
            }
        }
        assert!(found, "call node not found where expected");
    }

    #[test]
    fn test_indirect_call_arity_checked_when_signature_known() {
        let msg = expect_semantic_error(
            "fn add(x: f64, y: f64) -> f64 { return x + y; }
             let fp = get_func_ptr(add);
             print(call(fp, 1.0));",
        );
        assert_eq!(
            msg,
            "call through function pointer has wrong number of arguments"
        );
    }

    #[test]
    fn test_signature_lost_on_reassignment() {
        // After fp is reassigned from a plain allocation the signature
        // annotation is gone; the indirect call falls back to inference
        // and types as the expected-return (void at top level).
        let program = analyze_source(
            "fn add(x: f64, y: f64) -> f64 { return x + y; }
             let fp = get_func_ptr(add);
             fp = alloc_bytes(8);
             call(fp, 1.0, 2.0);",
        )
        .unwrap();
        if let Stmt::Expr(Expr::Call { inferred_sig, .. }) = &program.top_level[2] {
            let sig = inferred_sig.as_ref().unwrap();
            assert_eq!(sig.ret, PrimType::Void);
            assert_eq!(sig.params, vec![PrimType::F64, PrimType::F64]);
        } else {
            panic!("expected indirect call at top level");
        }
    }

    #[test]
    fn test_inferred_result_from_expected_return() {
        let program = analyze_source(
            "fn dispatch(fp: ptr) -> i64 { return call(fp, 7); }
             print(dispatch(get_func_ptr(dispatch)));",
        )
        .unwrap();
        let body = &program.user_fns[0].body;
        if let Stmt::Return(Expr::Call { inferred_sig, .. }) = &body[0] {
            let sig = inferred_sig.as_ref().unwrap();
            assert_eq!(sig.ret, PrimType::I64);
            assert_eq!(sig.params, vec![PrimType::I64]);
        } else {
            panic!("expected return of indirect call");
        }
    }

    #[test]
    fn test_bare_function_name_types_as_pointer() {
        let program = analyze_source(
            "fn add(x: i64, y: i64) -> i64 { return x + y; }
             let fp = add;
             print(call(fp, 6, 7));",
        )
        .unwrap();
        if let Stmt::Expr(Expr::Call { args, .. }) = &program.top_level[1] {
            if let Expr::Call { inferred_sig, .. } = &args[0] {
                let sig = inferred_sig.as_ref().expect("signature not written back");
                assert_eq!(sig.params, vec![PrimType::I64, PrimType::I64]);
                assert_eq!(sig.ret, PrimType::I64);
                return;
            }
        }
        panic!("call node not found where expected");
    }

    #[test]
    fn test_call_through_bare_function_name() {
        let program = analyze_source(
            "fn add(x: i64, y: i64) -> i64 { return x + y; }
             print(call(add, 1, 2));",
        )
        .unwrap();
        if let Stmt::Expr(Expr::Call { args, .. }) = &program.top_level[0] {
            if let Expr::Call { inferred_sig, .. } = &args[0] {
                let sig = inferred_sig.as_ref().expect("signature not written back");
                assert_eq!(sig.ret, PrimType::I64);
                return;
            }
        }
        panic!("call node not found where expected");
    }

    #[test]
    fn test_binding_shadows_function_name() {
        // Once a binding takes the name, the name is that binding, not
        // the function.
        analyze_source(
            "fn add(x: i64, y: i64) -> i64 { return x + y; }
             let add = 1;
             print(add + 1);",
        )
        .unwrap();
    }

    #[test]
    fn test_bare_name_assignment_carries_signature() {
        analyze_source(
            "fn inc(x: i64) -> i64 { return x + 1; }
             let fp = alloc_bytes(8);
             fp = inc;
             print(call(fp, 41));",
        )
        .unwrap();
    }

    #[test]
    fn test_direct_function_name_assignment_carries_signature() {
        analyze_source(
            "fn inc(x: i64) -> i64 { return x + 1; }
             let fp = get_func_ptr(inc);
             let alias = fp;
             print(call(alias, 41));",
        )
        .unwrap();
    }

    #[test]
    fn test_ptr_i64_assignment_laxity() {
        analyze_source(
            "let n = 0;
             n = alloc_bytes(8);
             print(1);",
        )
        .unwrap();
    }

    #[test]
    fn test_empty_program_rejected() {
        let msg = expect_semantic_error("fn f() -> void { }");
        assert_eq!(msg, "no program or no statements");
    }
}
