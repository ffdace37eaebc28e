//! Program trees produced by the parser and consumed by the rest of
//! the pipeline.
//!
//! Expression and statement nodes own their children; the program owns
//! top-level items and function definitions. Everything is `Clone`
//! because import resolution splices library subtrees into the main
//! program by deep-copying them.

/// Primitive type tag. Every source-level value carries one of these;
/// record, array, string, and function-pointer values all flow as `Ptr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimType {
    Void,
    I32,
    I64,
    F32,
    F64,
    Ptr,
}

impl PrimType {
    /// Size in bytes. Alignment equals size.
    pub fn size(self) -> u32 {
        match self {
            PrimType::Void => 0,
            PrimType::I32 | PrimType::F32 => 4,
            PrimType::I64 | PrimType::F64 | PrimType::Ptr => 8,
        }
    }

    pub fn align(self) -> u32 {
        self.size()
    }

    /// FFI type kind encoding passed to `rt_ffi_sig_create`.
    pub fn ffi_kind(self) -> i32 {
        match self {
            PrimType::Void => 0,
            PrimType::I32 => 1,
            PrimType::I64 => 2,
            PrimType::F32 => 3,
            PrimType::F64 => 4,
            PrimType::Ptr => 5,
        }
    }

    /// Map a type keyword to its tag. `u64`/`u32` share the signed tags.
    pub fn from_name(name: &str) -> Option<PrimType> {
        match name {
            "void" => Some(PrimType::Void),
            "i32" | "u32" => Some(PrimType::I32),
            "i64" | "u64" => Some(PrimType::I64),
            "f32" => Some(PrimType::F32),
            "f64" => Some(PrimType::F64),
            "ptr" => Some(PrimType::Ptr),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PrimType::Void => "void",
            PrimType::I32 => "i32",
            PrimType::I64 => "i64",
            PrimType::F32 => "f32",
            PrimType::F64 => "f64",
            PrimType::Ptr => "ptr",
        }
    }

    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            PrimType::I32 | PrimType::I64 | PrimType::F32 | PrimType::F64
        )
    }

    pub fn is_float(self) -> bool {
        matches!(self, PrimType::F32 | PrimType::F64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Width selector for the typed `load` builtins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadKind {
    I64,
    I32,
    F64,
    Ptr,
}

impl LoadKind {
    pub fn result_type(self) -> PrimType {
        match self {
            LoadKind::I64 | LoadKind::I32 => PrimType::I64,
            LoadKind::F64 => PrimType::F64,
            LoadKind::Ptr => PrimType::Ptr,
        }
    }
}

/// Parameter and result types of a function, used both for declared
/// functions and for signatures recovered at indirect call sites.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FnSig {
    pub params: Vec<PrimType>,
    pub ret: PrimType,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Int(i64),
    Float(f64),
    Str(String),
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Compare {
        op: CmpOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Var(String),
    /// Any call form, builtin or not. `type_arg` holds the monomorphic
    /// type argument of `range`/`from_str`; `inferred_sig` is the
    /// writeback slot the analyzer fills for indirect `call`s whose
    /// signature had to be inferred from the call site.
    Call {
        callee: String,
        args: Vec<Expr>,
        type_arg: Option<PrimType>,
        inferred_sig: Option<FnSig>,
    },
    /// `alloc(T)` where T is a primitive or record name.
    Alloc { type_name: String },
    /// `alloc_array(T, count)`; length-prefixed heap array of T.
    AllocArray {
        elem_type: String,
        count: Box<Expr>,
    },
    /// `alloc_bytes(size)`; raw stack buffer.
    AllocBytes { size: Box<Expr> },
    /// `addr_of(x)`; the parser guarantees a plain variable name.
    AddrOf { var: String },
    Load {
        kind: LoadKind,
        ptr: Box<Expr>,
    },
    Store {
        ptr: Box<Expr>,
        value: Box<Expr>,
    },
    LoadField {
        ptr: Box<Expr>,
        struct_name: String,
        field: String,
    },
    StoreField {
        ptr: Box<Expr>,
        struct_name: String,
        field: String,
        value: Box<Expr>,
    },
    Index {
        base: Box<Expr>,
        index: Box<Expr>,
    },
    /// `EXPR as TYPE` with TYPE one of `ptr|i64|i32|f64|f32`.
    Cast {
        operand: Box<Expr>,
        target: PrimType,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Return(Expr),
    Let { name: String, init: Expr },
    Expr(Expr),
    /// `elif` chains are desugared into a nested `If` in the else slot.
    If {
        cond: Expr,
        then_body: Vec<Stmt>,
        else_body: Vec<Stmt>,
    },
    For {
        var: String,
        iterable: Expr,
        body: Vec<Stmt>,
    },
    /// `target` is an `Expr::Var` or `Expr::Index`; the parser rejects
    /// anything else on the left of `=`.
    Assign { target: Expr, value: Expr },
}

/// `name: TYPE` parameter. A non-`None` `type_name` means the source
/// used a named (opaque or record) type, which is `Ptr` at the ABI.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub ty: PrimType,
    pub type_name: Option<String>,
}

/// `fn NAME(PARAMS) -> RET;` as it appears inside an import block.
#[derive(Debug, Clone, PartialEq)]
pub struct FnDecl {
    pub name: String,
    pub params: Vec<Param>,
    pub return_type: PrimType,
    pub return_type_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FnDef {
    pub name: String,
    pub params: Vec<Param>,
    pub return_type: PrimType,
    pub return_type_name: Option<String>,
    pub body: Vec<Stmt>,
    pub exported: bool,
}

impl FnDef {
    pub fn sig(&self) -> FnSig {
        FnSig {
            params: self.params.iter().map(|p| p.ty).collect(),
            ret: self.return_type,
        }
    }
}

/// A function declared but not defined; resolved through the dynamic
/// loader and called via the FFI trampoline.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternFn {
    pub name: String,
    pub params: Vec<Param>,
    pub return_type: PrimType,
    pub return_type_name: Option<String>,
    /// Back-reference into `Program::libs`.
    pub lib_name: String,
}

impl ExternFn {
    pub fn sig(&self) -> FnSig {
        FnSig {
            params: self.params.iter().map(|p| p.ty).collect(),
            ret: self.return_type,
        }
    }
}

/// `extern lib "path" [as name];`. The name is auto-generated when the
/// source omits it.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternLib {
    pub path: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructDef {
    pub name: String,
    pub fields: Vec<(String, PrimType)>,
    pub exported: bool,
}

/// Per-library manifest of what the importing file expects the target
/// file to export.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportRequest {
    pub lib: String,
    pub struct_names: Vec<String>,
    pub fn_decls: Vec<FnDecl>,
}

/// A parsed compilation unit. Top-level items are statements (lets,
/// ifs, fors, assignments, bare expressions) executed in declaration
/// order by the implicit entry function.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Program {
    pub opaque_types: Vec<String>,
    pub structs: Vec<StructDef>,
    pub libs: Vec<ExternLib>,
    pub extern_fns: Vec<ExternFn>,
    pub user_fns: Vec<FnDef>,
    pub imports: Vec<ImportRequest>,
    pub top_level: Vec<Stmt>,
}

impl Program {
    pub fn find_struct(&self, name: &str) -> Option<&StructDef> {
        self.structs.iter().find(|s| s.name == name)
    }

    pub fn find_user_fn(&self, name: &str) -> Option<&FnDef> {
        self.user_fns.iter().find(|f| f.name == name)
    }

    pub fn find_extern_fn(&self, name: &str) -> Option<&ExternFn> {
        self.extern_fns.iter().find(|f| f.name == name)
    }

    pub fn find_lib(&self, name: &str) -> Option<&ExternLib> {
        self.libs.iter().find(|l| l.name == name)
    }

    pub fn is_named_type(&self, name: &str) -> bool {
        self.opaque_types.iter().any(|o| o == name) || self.find_struct(name).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prim_type_sizes() {
        assert_eq!(PrimType::Void.size(), 0);
        assert_eq!(PrimType::I32.size(), 4);
        assert_eq!(PrimType::F32.size(), 4);
        assert_eq!(PrimType::I64.size(), 8);
        assert_eq!(PrimType::F64.size(), 8);
        assert_eq!(PrimType::Ptr.size(), 8);
    }

    #[test]
    fn test_ffi_kind_encoding() {
        assert_eq!(PrimType::Void.ffi_kind(), 0);
        assert_eq!(PrimType::I32.ffi_kind(), 1);
        assert_eq!(PrimType::I64.ffi_kind(), 2);
        assert_eq!(PrimType::F32.ffi_kind(), 3);
        assert_eq!(PrimType::F64.ffi_kind(), 4);
        assert_eq!(PrimType::Ptr.ffi_kind(), 5);
    }

    #[test]
    fn test_unsigned_keywords_share_signed_tags() {
        assert_eq!(PrimType::from_name("u64"), Some(PrimType::I64));
        assert_eq!(PrimType::from_name("u32"), Some(PrimType::I32));
        assert_eq!(PrimType::from_name("bogus"), None);
    }

    #[test]
    fn test_load_kind_result_types() {
        assert_eq!(LoadKind::I32.result_type(), PrimType::I64);
        assert_eq!(LoadKind::I64.result_type(), PrimType::I64);
        assert_eq!(LoadKind::F64.result_type(), PrimType::F64);
        assert_eq!(LoadKind::Ptr.result_type(), PrimType::Ptr);
    }

    #[test]
    fn test_fn_sig_from_def() {
        let def = FnDef {
            name: "add".to_string(),
            params: vec![
                Param {
                    name: "x".to_string(),
                    ty: PrimType::F64,
                    type_name: None,
                },
                Param {
                    name: "y".to_string(),
                    ty: PrimType::F64,
                    type_name: None,
                },
            ],
            return_type: PrimType::F64,
            return_type_name: None,
            body: Vec::new(),
            exported: false,
        };
        assert_eq!(
            def.sig(),
            FnSig {
                params: vec![PrimType::F64, PrimType::F64],
                ret: PrimType::F64,
            }
        );
    }
}
