//! Tokens to program tree.
//!
//! A single-pass recursive-descent parser. Top-level stanzas (imports,
//! opaque declarations, record and function definitions, extern blocks)
//! may appear in any order and any number of times; everything else is
//! a top-level item executed by the implicit entry function.
//!
//! Errors carry the position of the offending token and a short,
//! specific message; the parser never attempts recovery.

use crate::ast::*;
use crate::error::FusionError;
use crate::lexer::{Token, TokenKind};

pub fn parse(tokens: &[Token]) -> Result<Program, FusionError> {
    Parser::new(tokens).parse_program()
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(tokens: &'a [Token]) -> Self {
        Parser { tokens, pos: 0 }
    }

    fn current(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek(&self) -> &Token {
        &self.tokens[(self.pos + 1).min(self.tokens.len() - 1)]
    }

    fn bump(&mut self) -> &Token {
        let tok = &self.tokens[self.pos.min(self.tokens.len() - 1)];
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn err<T>(&self, message: impl Into<String>) -> Result<T, FusionError> {
        let tok = self.current();
        Err(FusionError::parse(message, tok.line, tok.column))
    }

    fn at(&self, kind: &TokenKind) -> bool {
        self.current().kind == *kind
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.at(kind) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<(), FusionError> {
        if self.eat(&kind) {
            Ok(())
        } else {
            self.err(format!(
                "expected {}, found {}",
                what,
                self.current().kind.describe()
            ))
        }
    }

    fn expect_ident(&mut self, what: &str) -> Result<String, FusionError> {
        match &self.current().kind {
            TokenKind::Ident(name) => {
                let name = name.clone();
                self.bump();
                Ok(name)
            }
            other => self.err(format!("expected {}, found {}", what, other.describe())),
        }
    }

    fn expect_string(&mut self, what: &str) -> Result<String, FusionError> {
        match &self.current().kind {
            TokenKind::Str(s) => {
                let s = s.clone();
                self.bump();
                Ok(s)
            }
            other => self.err(format!("expected {}, found {}", what, other.describe())),
        }
    }

    // ------------------------------------------------------------------
    // Types
    // ------------------------------------------------------------------

    fn prim_keyword(kind: &TokenKind) -> Option<PrimType> {
        match kind {
            TokenKind::KwVoid => Some(PrimType::Void),
            TokenKind::KwI32 | TokenKind::KwU32 => Some(PrimType::I32),
            TokenKind::KwI64 | TokenKind::KwU64 => Some(PrimType::I64),
            TokenKind::KwF32 => Some(PrimType::F32),
            TokenKind::KwF64 => Some(PrimType::F64),
            TokenKind::KwPtr => Some(PrimType::Ptr),
            _ => None,
        }
    }

    /// A primitive keyword, or an identifier naming an opaque/record
    /// type (which is `Ptr` at the ABI, with the name tagged).
    fn parse_type(&mut self) -> Result<(PrimType, Option<String>), FusionError> {
        if let Some(ty) = Self::prim_keyword(&self.current().kind) {
            self.bump();
            return Ok((ty, None));
        }
        if let TokenKind::Ident(name) = &self.current().kind {
            let name = name.clone();
            self.bump();
            return Ok((PrimType::Ptr, Some(name)));
        }
        self.err(format!(
            "expected type, found {}",
            self.current().kind.describe()
        ))
    }

    /// Type-name argument of `alloc` / `alloc_array`: a primitive
    /// keyword or a record name, kept as text for the analyzer.
    fn parse_type_name(&mut self) -> Result<String, FusionError> {
        if let Some(ty) = Self::prim_keyword(&self.current().kind) {
            self.bump();
            return Ok(ty.name().to_string());
        }
        if let TokenKind::Ident(name) = &self.current().kind {
            let name = name.clone();
            self.bump();
            return Ok(name);
        }
        self.err(format!(
            "expected type name, found {}",
            self.current().kind.describe()
        ))
    }

    // ------------------------------------------------------------------
    // Top level
    // ------------------------------------------------------------------

    fn parse_program(&mut self) -> Result<Program, FusionError> {
        let mut program = Program::default();

        loop {
            match &self.current().kind {
                TokenKind::Eof => break,
                TokenKind::KwImport => self.parse_import(&mut program)?,
                TokenKind::KwOpaque => {
                    self.bump();
                    let name = self.expect_ident("opaque type name")?;
                    self.expect(TokenKind::Semicolon, "';' after opaque declaration")?;
                    program.opaque_types.push(name);
                }
                TokenKind::KwExport => match &self.peek().kind {
                    TokenKind::KwStruct => {
                        self.bump();
                        self.parse_struct(&mut program, true)?;
                    }
                    TokenKind::KwFn => {
                        self.bump();
                        self.parse_fn_def(&mut program, true)?;
                    }
                    _ => return self.err("expected 'struct' or 'fn' after 'export'"),
                },
                TokenKind::KwStruct => self.parse_struct(&mut program, false)?,
                TokenKind::KwFn => self.parse_fn_def(&mut program, false)?,
                TokenKind::KwExtern => match &self.peek().kind {
                    TokenKind::KwLib => self.parse_extern_lib(&mut program)?,
                    TokenKind::KwFn => {
                        self.bump();
                        self.bump();
                        let lib_name = match program.libs.last() {
                            Some(lib) => lib.name.clone(),
                            None => String::new(),
                        };
                        let decl = self.parse_fn_decl()?;
                        self.expect(TokenKind::Semicolon, "';' after extern fn")?;
                        program.extern_fns.push(ExternFn {
                            name: decl.name,
                            params: decl.params,
                            return_type: decl.return_type,
                            return_type_name: decl.return_type_name,
                            lib_name,
                        });
                    }
                    _ => return self.err("expected 'lib' or 'fn' after 'extern'"),
                },
                _ => {
                    let stmt = self.parse_stmt()?;
                    program.top_level.push(stmt);
                }
            }
        }

        Ok(program)
    }

    /// `import lib "NAME" { (struct IDENT; | fn DECL;)* };`
    fn parse_import(&mut self, program: &mut Program) -> Result<(), FusionError> {
        self.bump(); // import
        self.expect(TokenKind::KwLib, "'lib' after 'import'")?;
        let lib = self.expect_string("library name string")?;
        self.expect(TokenKind::LBrace, "'{' to open import block")?;

        let mut request = ImportRequest {
            lib,
            struct_names: Vec::new(),
            fn_decls: Vec::new(),
        };

        while !self.at(&TokenKind::RBrace) {
            match &self.current().kind {
                TokenKind::KwStruct => {
                    self.bump();
                    let name = self.expect_ident("struct name")?;
                    self.expect(TokenKind::Semicolon, "';' after imported struct")?;
                    request.struct_names.push(name);
                }
                TokenKind::KwFn => {
                    self.bump();
                    let decl = self.parse_fn_decl()?;
                    self.expect(TokenKind::Semicolon, "';' after imported fn")?;
                    request.fn_decls.push(decl);
                }
                _ => return self.err("expected 'struct' or 'fn' in import block"),
            }
        }
        self.bump(); // }
        self.expect(TokenKind::Semicolon, "';' after import block")?;
        program.imports.push(request);
        Ok(())
    }

    /// `struct NAME { (IDENT : TYPE;)* };` with primitive-typed fields.
    fn parse_struct(&mut self, program: &mut Program, exported: bool) -> Result<(), FusionError> {
        self.bump(); // struct
        let name = self.expect_ident("struct name")?;
        self.expect(TokenKind::LBrace, "'{' to open struct body")?;

        let mut fields = Vec::new();
        while !self.at(&TokenKind::RBrace) {
            let field = self.expect_ident("field name")?;
            self.expect(TokenKind::Colon, "':' after field name")?;
            let ty = match Self::prim_keyword(&self.current().kind) {
                Some(ty) if ty != PrimType::Void => {
                    self.bump();
                    ty
                }
                _ => return self.err("struct field must have a primitive type"),
            };
            self.expect(TokenKind::Semicolon, "';' after field")?;
            fields.push((field, ty));
        }
        self.bump(); // }
        self.expect(TokenKind::Semicolon, "';' after struct")?;
        program.structs.push(StructDef {
            name,
            fields,
            exported,
        });
        Ok(())
    }

    /// `NAME (PARAMS) -> RET`, shared by extern declarations, import
    /// requests, and definitions (the caller consumes `fn`).
    fn parse_fn_decl(&mut self) -> Result<FnDecl, FusionError> {
        let name = self.expect_ident("function name")?;
        let params = self.parse_params()?;
        self.expect(TokenKind::Arrow, "'->' before return type")?;
        let (return_type, return_type_name) = self.parse_type()?;
        Ok(FnDecl {
            name,
            params,
            return_type,
            return_type_name,
        })
    }

    fn parse_params(&mut self) -> Result<Vec<Param>, FusionError> {
        self.expect(TokenKind::LParen, "'(' to open parameter list")?;
        let mut params = Vec::new();
        if !self.at(&TokenKind::RParen) {
            loop {
                let name = self.expect_ident("parameter name")?;
                self.expect(TokenKind::Colon, "':' after parameter name")?;
                let (ty, type_name) = self.parse_type()?;
                params.push(Param {
                    name,
                    ty,
                    type_name,
                });
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen, "')' to close parameter list")?;
        Ok(params)
    }

    fn parse_fn_def(&mut self, program: &mut Program, exported: bool) -> Result<(), FusionError> {
        self.bump(); // fn
        let decl = self.parse_fn_decl()?;
        let body = self.parse_block()?;
        program.user_fns.push(FnDef {
            name: decl.name,
            params: decl.params,
            return_type: decl.return_type,
            return_type_name: decl.return_type_name,
            body,
            exported,
        });
        Ok(())
    }

    /// `extern lib "PATH" [as IDENT];` with an optional `{ fn DECL; … }`
    /// block declaring symbols of that library.
    fn parse_extern_lib(&mut self, program: &mut Program) -> Result<(), FusionError> {
        self.bump(); // extern
        self.bump(); // lib
        let path = self.expect_string("library path string")?;
        let name = if self.eat(&TokenKind::KwAs) {
            self.expect_ident("library name after 'as'")?
        } else {
            format!("__lib{}", program.libs.len())
        };
        program.libs.push(ExternLib {
            path,
            name: name.clone(),
        });

        if self.eat(&TokenKind::LBrace) {
            while !self.at(&TokenKind::RBrace) {
                self.expect(TokenKind::KwFn, "'fn' in extern lib block")?;
                let decl = self.parse_fn_decl()?;
                self.expect(TokenKind::Semicolon, "';' after extern fn")?;
                program.extern_fns.push(ExternFn {
                    name: decl.name,
                    params: decl.params,
                    return_type: decl.return_type,
                    return_type_name: decl.return_type_name,
                    lib_name: name.clone(),
                });
            }
            self.bump(); // }
        }
        self.expect(TokenKind::Semicolon, "';' after extern lib")?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn parse_block(&mut self) -> Result<Vec<Stmt>, FusionError> {
        self.expect(TokenKind::LBrace, "'{' to open block")?;
        let mut body = Vec::new();
        while !self.at(&TokenKind::RBrace) {
            if self.at(&TokenKind::Eof) {
                return self.err("unterminated block");
            }
            body.push(self.parse_stmt()?);
        }
        self.bump(); // }
        Ok(body)
    }

    fn parse_stmt(&mut self) -> Result<Stmt, FusionError> {
        match &self.current().kind {
            TokenKind::KwReturn => {
                self.bump();
                let expr = self.parse_expr()?;
                self.expect(TokenKind::Semicolon, "';' after return")?;
                Ok(Stmt::Return(expr))
            }
            TokenKind::KwLet => {
                self.bump();
                let name = match &self.current().kind {
                    TokenKind::Ident(name) => {
                        let name = name.clone();
                        self.bump();
                        name
                    }
                    _ => return self.err("invalid let binding"),
                };
                if !self.eat(&TokenKind::Equals) {
                    return self.err("invalid let binding");
                }
                let init = self.parse_expr()?;
                self.expect(TokenKind::Semicolon, "';' after let binding")?;
                Ok(Stmt::Let { name, init })
            }
            TokenKind::KwIf => self.parse_if(),
            TokenKind::KwFor => {
                self.bump();
                let var = self.expect_ident("loop variable")?;
                self.expect(TokenKind::KwIn, "'in' after loop variable")?;
                let iterable = self.parse_expr()?;
                let body = self.parse_block()?;
                Ok(Stmt::For {
                    var,
                    iterable,
                    body,
                })
            }
            TokenKind::Eof => self.err("expected expression or let binding"),
            _ => {
                let expr = self.parse_expr()?;
                if self.eat(&TokenKind::Equals) {
                    if !matches!(expr, Expr::Var(_) | Expr::Index { .. }) {
                        return self
                            .err("left side of assignment must be a variable or an index");
                    }
                    let value = self.parse_expr()?;
                    self.expect(TokenKind::Semicolon, "';' after assignment")?;
                    return Ok(Stmt::Assign {
                        target: expr,
                        value,
                    });
                }
                self.expect(TokenKind::Semicolon, "';' after expression")?;
                Ok(Stmt::Expr(expr))
            }
        }
    }

    /// `if (EXPR) BLOCK [elif (EXPR) BLOCK]* [else BLOCK]`; elif chains
    /// become a nested `If` in the else slot.
    fn parse_if(&mut self) -> Result<Stmt, FusionError> {
        self.bump(); // if or elif
        self.expect(TokenKind::LParen, "'(' before condition")?;
        let cond = self.parse_expr()?;
        self.expect(TokenKind::RParen, "')' after condition")?;
        let then_body = self.parse_block()?;

        let else_body = if self.at(&TokenKind::KwElif) {
            vec![self.parse_if()?]
        } else if self.eat(&TokenKind::KwElse) {
            self.parse_block()?
        } else {
            Vec::new()
        };

        Ok(Stmt::If {
            cond,
            then_body,
            else_body,
        })
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn parse_expr(&mut self) -> Result<Expr, FusionError> {
        let mut expr = self.parse_comparison()?;
        // Trailing `as TYPE` casts; target set is fixed.
        while self.eat(&TokenKind::KwAs) {
            let target = match &self.current().kind {
                TokenKind::KwPtr => PrimType::Ptr,
                TokenKind::KwI64 => PrimType::I64,
                TokenKind::KwI32 => PrimType::I32,
                TokenKind::KwF64 => PrimType::F64,
                TokenKind::KwF32 => PrimType::F32,
                _ => return self.err("cast target must be ptr, i64, i32, f64, or f32"),
            };
            self.bump();
            expr = Expr::Cast {
                operand: Box::new(expr),
                target,
            };
        }
        Ok(expr)
    }

    fn parse_comparison(&mut self) -> Result<Expr, FusionError> {
        let mut left = self.parse_additive()?;
        loop {
            let op = match &self.current().kind {
                TokenKind::EqEq => CmpOp::Eq,
                TokenKind::NotEq => CmpOp::Ne,
                TokenKind::Lt => CmpOp::Lt,
                TokenKind::Le => CmpOp::Le,
                TokenKind::Gt => CmpOp::Gt,
                TokenKind::Ge => CmpOp::Ge,
                _ => break,
            };
            self.bump();
            let right = self.parse_additive()?;
            left = Expr::Compare {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr, FusionError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match &self.current().kind {
                TokenKind::Plus => BinOp::Add,
                TokenKind::Minus => BinOp::Sub,
                _ => break,
            };
            self.bump();
            let right = self.parse_multiplicative()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, FusionError> {
        let mut left = self.parse_postfix()?;
        loop {
            let op = match &self.current().kind {
                TokenKind::Star => BinOp::Mul,
                TokenKind::Slash => BinOp::Div,
                _ => break,
            };
            self.bump();
            let right = self.parse_postfix()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    /// A primary followed by zero or more `[EXPR]` subscripts.
    fn parse_postfix(&mut self) -> Result<Expr, FusionError> {
        let mut expr = self.parse_primary()?;
        while self.eat(&TokenKind::LBracket) {
            let index = self.parse_expr()?;
            self.expect(TokenKind::RBracket, "']' to close index")?;
            expr = Expr::Index {
                base: Box::new(expr),
                index: Box::new(index),
            };
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, FusionError> {
        match &self.current().kind {
            TokenKind::Int(v) => {
                let v = *v;
                self.bump();
                Ok(Expr::Int(v))
            }
            TokenKind::Float(v) => {
                let v = *v;
                self.bump();
                Ok(Expr::Float(v))
            }
            TokenKind::Str(s) => {
                let s = s.clone();
                self.bump();
                Ok(Expr::Str(s))
            }
            TokenKind::LParen => {
                self.bump();
                let expr = self.parse_expr()?;
                self.expect(TokenKind::RParen, "')' to close expression")?;
                Ok(expr)
            }
            TokenKind::Ident(name) => {
                let name = name.clone();
                self.bump();
                if self.at(&TokenKind::LParen) {
                    self.parse_call(name)
                } else {
                    Ok(Expr::Var(name))
                }
            }
            other => self.err(format!(
                "expected expression, found {}",
                other.describe()
            )),
        }
    }

    /// A call whose callee name selects the argument shape: the memory
    /// and function-pointer builtins have bespoke forms, everything
    /// else is an ordinary argument list.
    fn parse_call(&mut self, callee: String) -> Result<Expr, FusionError> {
        self.bump(); // (
        let expr = match callee.as_str() {
            "alloc" => {
                let type_name = self.parse_type_name()?;
                Expr::Alloc { type_name }
            }
            "alloc_array" => {
                let elem_type = self.parse_type_name()?;
                self.expect(TokenKind::Comma, "',' after element type")?;
                let count = self.parse_expr()?;
                Expr::AllocArray {
                    elem_type,
                    count: Box::new(count),
                }
            }
            "alloc_bytes" => {
                let size = self.parse_expr()?;
                Expr::AllocBytes {
                    size: Box::new(size),
                }
            }
            "addr_of" => {
                let var = self.expect_ident("variable name in addr_of")?;
                Expr::AddrOf { var }
            }
            "load" | "load_i32" | "load_f64" | "load_ptr" => {
                let kind = match callee.as_str() {
                    "load" => LoadKind::I64,
                    "load_i32" => LoadKind::I32,
                    "load_f64" => LoadKind::F64,
                    _ => LoadKind::Ptr,
                };
                let ptr = self.parse_expr()?;
                Expr::Load {
                    kind,
                    ptr: Box::new(ptr),
                }
            }
            "store" => {
                let ptr = self.parse_expr()?;
                self.expect(TokenKind::Comma, "',' after store pointer")?;
                let value = self.parse_expr()?;
                Expr::Store {
                    ptr: Box::new(ptr),
                    value: Box::new(value),
                }
            }
            "load_field" => {
                let ptr = self.parse_expr()?;
                self.expect(TokenKind::Comma, "',' after field base")?;
                let struct_name = self.expect_ident("struct name")?;
                self.expect(TokenKind::Comma, "',' after struct name")?;
                let field = self.expect_ident("field name")?;
                Expr::LoadField {
                    ptr: Box::new(ptr),
                    struct_name,
                    field,
                }
            }
            "store_field" => {
                let ptr = self.parse_expr()?;
                self.expect(TokenKind::Comma, "',' after field base")?;
                let struct_name = self.expect_ident("struct name")?;
                self.expect(TokenKind::Comma, "',' after struct name")?;
                let field = self.expect_ident("field name")?;
                self.expect(TokenKind::Comma, "',' after field name")?;
                let value = self.parse_expr()?;
                Expr::StoreField {
                    ptr: Box::new(ptr),
                    struct_name,
                    field,
                    value: Box::new(value),
                }
            }
            "get_func_ptr" => {
                let name = self.expect_ident("function name in get_func_ptr")?;
                Expr::Call {
                    callee,
                    args: vec![Expr::Var(name)],
                    type_arg: None,
                    inferred_sig: None,
                }
            }
            "range" | "from_str" => {
                let (args, type_arg) = self.parse_args_with_type_arg()?;
                return self.finish_call(callee, args, type_arg);
            }
            _ => {
                let args = self.parse_args()?;
                return self.finish_call(callee, args, None);
            }
        };
        self.expect(TokenKind::RParen, "')' to close call")?;
        Ok(expr)
    }

    fn finish_call(
        &mut self,
        callee: String,
        args: Vec<Expr>,
        type_arg: Option<PrimType>,
    ) -> Result<Expr, FusionError> {
        self.expect(TokenKind::RParen, "')' to close call")?;
        Ok(Expr::Call {
            callee,
            args,
            type_arg,
            inferred_sig: None,
        })
    }

    fn parse_args(&mut self) -> Result<Vec<Expr>, FusionError> {
        let mut args = Vec::new();
        if !self.at(&TokenKind::RParen) {
            loop {
                args.push(self.parse_expr()?);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }
        Ok(args)
    }

    /// Argument list where a trailing primitive-type keyword is the
    /// monomorphic type argument (`range(n, i32)`, `from_str(s, f64)`).
    fn parse_args_with_type_arg(
        &mut self,
    ) -> Result<(Vec<Expr>, Option<PrimType>), FusionError> {
        let mut args = Vec::new();
        let mut type_arg = None;
        if !self.at(&TokenKind::RParen) {
            loop {
                if let Some(ty) = Self::prim_keyword(&self.current().kind) {
                    if matches!(self.peek().kind, TokenKind::Comma | TokenKind::RParen) {
                        self.bump();
                        type_arg = Some(ty);
                        if self.eat(&TokenKind::Comma) {
                            return self.err("type argument must come last");
                        }
                        break;
                    }
                }
                args.push(self.parse_expr()?);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }
        Ok((args, type_arg))
    }
}
