//! Multi-file import resolution.
//!
//! Given the parsed main program and its path, transitively load every
//! `import lib "..."` target, verify the requested symbols are exported
//! with matching shapes, and splice them into the main program. Library
//! parse trees are cached by canonical path; merging happens in
//! post-order of the import graph so that a library's own dependencies
//! land first. The first failure short-circuits.

use std::path::{Path, PathBuf};

use rustc_hash::{FxHashMap, FxHashSet};

use crate::ast::{Expr, ExternFn, FnDecl, FnDef, ImportRequest, Param, Program, Stmt, StructDef};
use crate::error::FusionError;
use crate::lexer::lex;
use crate::parser::parse;

pub fn resolve_imports(main_path: &Path, program: &mut Program) -> Result<(), FusionError> {
    if program.imports.is_empty() {
        return Ok(());
    }

    let mut cache: FxHashMap<PathBuf, Program> = FxHashMap::default();
    let mut loading: FxHashSet<PathBuf> = FxHashSet::default();
    let mut postorder: Vec<(PathBuf, ImportRequest)> = Vec::new();

    let main_dir = dir_of(main_path);
    let requests = program.imports.clone();
    for request in &requests {
        let path = resolve_import_path(&main_dir, &request.lib);
        load_postorder(&path, request, &mut cache, &mut loading, &mut postorder)?;
    }

    for (canon, request) in &postorder {
        let lib = cache
            .get(canon)
            .cloned()
            .expect("post-order entry must be cached");
        merge_library(program, &lib, request)?;
    }
    Ok(())
}

fn dir_of(path: &Path) -> PathBuf {
    match path.parent() {
        Some(dir) if dir.as_os_str().is_empty() => PathBuf::from("."),
        Some(dir) => dir.to_path_buf(),
        None => PathBuf::from("."),
    }
}

/// Append `.fusion` unless the basename already carries it, then anchor
/// at the importing file's directory.
fn resolve_import_path(dir: &Path, name: &str) -> PathBuf {
    if name.ends_with(".fusion") {
        dir.join(name)
    } else {
        dir.join(format!("{}.fusion", name))
    }
}

fn canonical(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

fn load_postorder(
    file_path: &Path,
    request: &ImportRequest,
    cache: &mut FxHashMap<PathBuf, Program>,
    loading: &mut FxHashSet<PathBuf>,
    postorder: &mut Vec<(PathBuf, ImportRequest)>,
) -> Result<(), FusionError> {
    let canon = canonical(file_path);
    if loading.contains(&canon) {
        return Err(FusionError::import(format!(
            "circular import involving '{}'",
            canon.display()
        )));
    }

    if !cache.contains_key(&canon) {
        let source = std::fs::read_to_string(file_path).map_err(|_| {
            FusionError::import(format!(
                "cannot open '{}' (resolved from import)",
                file_path.display()
            ))
        })?;
        let parsed = parse(&lex(&source)).map_err(|e| {
            let message = match &e {
                FusionError::Parse { message, .. } => message.clone(),
                other => other.description(),
            };
            FusionError::import(format!(
                "parse error in '{}': {}",
                file_path.display(),
                message
            ))
        })?;
        let nested = parsed.imports.clone();
        cache.insert(canon.clone(), parsed);

        loading.insert(canon.clone());
        let dir = dir_of(file_path);
        for nested_request in &nested {
            let dep_path = resolve_import_path(&dir, &nested_request.lib);
            load_postorder(&dep_path, nested_request, cache, loading, postorder)?;
        }
        loading.remove(&canon);
    }

    postorder.push((canon, request.clone()));
    Ok(())
}

// ----------------------------------------------------------------------
// Signature comparison (parameter names are not significant)
// ----------------------------------------------------------------------

fn params_equal(a: &[Param], b: &[Param]) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b)
            .all(|(x, y)| x.ty == y.ty && x.type_name == y.type_name)
}

fn decl_matches_def(decl: &FnDecl, def: &FnDef) -> bool {
    decl.name == def.name
        && params_equal(&decl.params, &def.params)
        && decl.return_type == def.return_type
        && decl.return_type_name == def.return_type_name
}

fn fn_defs_signature_equal(a: &FnDef, b: &FnDef) -> bool {
    params_equal(&a.params, &b.params)
        && a.return_type == b.return_type
        && a.return_type_name == b.return_type_name
}

fn extern_fns_equal(a: &ExternFn, b: &ExternFn) -> bool {
    a.name == b.name
        && params_equal(&a.params, &b.params)
        && a.return_type == b.return_type
        && a.return_type_name == b.return_type_name
}

fn struct_defs_equal(a: &StructDef, b: &StructDef) -> bool {
    a.name == b.name && a.fields == b.fields
}

fn lib_path_by_name(program: &Program, name: &str) -> Option<String> {
    program.find_lib(name).map(|l| l.path.clone())
}

// ----------------------------------------------------------------------
// Merge
// ----------------------------------------------------------------------

fn merge_library(
    main: &mut Program,
    lib: &Program,
    request: &ImportRequest,
) -> Result<(), FusionError> {
    // Requested records.
    for sname in &request.struct_names {
        let sdef = lib
            .structs
            .iter()
            .find(|s| s.exported && s.name == *sname)
            .ok_or_else(|| {
                FusionError::import(format!(
                    "import lib '{}': missing exported struct {}",
                    request.lib, sname
                ))
            })?;
        let mut already_present = false;
        for existing in &main.structs {
            if existing.name != *sname {
                continue;
            }
            if struct_defs_equal(existing, sdef) {
                // Same lib imported twice; harmless duplicate.
                already_present = true;
                break;
            }
            return Err(FusionError::import(format!(
                "duplicate symbol '{}': exported by lib '{}' and already defined",
                sname, request.lib
            )));
        }
        if !already_present {
            main.structs.push(sdef.clone());
        }
    }

    // Requested functions.
    let mut imported_fns: Vec<&FnDef> = Vec::new();
    for decl in &request.fn_decls {
        let fdef = lib
            .user_fns
            .iter()
            .find(|f| f.exported && decl_matches_def(decl, f))
            .ok_or_else(|| {
                FusionError::import(format!(
                    "import lib '{}': missing or signature mismatch for exported fn {}",
                    request.lib, decl.name
                ))
            })?;
        let mut already_present = false;
        for existing in &main.user_fns {
            if existing.name != decl.name {
                continue;
            }
            if decl_matches_def(decl, existing) {
                already_present = true;
                break;
            }
            return Err(FusionError::import(format!(
                "duplicate symbol '{}': exported by lib '{}' and already defined",
                decl.name, request.lib
            )));
        }
        if !already_present {
            main.user_fns.push(fdef.clone());
            imported_fns.push(fdef);
        }
    }

    // The library's extern libs, renamed to stay unique in the main
    // program; remember original path -> main name for the next step.
    let mut path_to_main_name: FxHashMap<String, String> = FxHashMap::default();
    for ext_lib in &lib.libs {
        if let Some(existing) = main.libs.iter().find(|l| l.path == ext_lib.path) {
            path_to_main_name.insert(ext_lib.path.clone(), existing.name.clone());
        } else {
            let main_name = format!("__lib{}", main.libs.len());
            let mut renamed = ext_lib.clone();
            renamed.name = main_name.clone();
            main.libs.push(renamed);
            path_to_main_name.insert(ext_lib.path.clone(), main_name);
        }
    }

    // The library's extern functions.
    for ext in &lib.extern_fns {
        let ext_path = lib_path_by_name(lib, &ext.lib_name).unwrap_or_default();
        let conflict = match main.find_extern_fn(&ext.name) {
            Some(existing) => {
                let existing_path =
                    lib_path_by_name(main, &existing.lib_name).unwrap_or_default();
                if existing_path != ext_path || !extern_fns_equal(existing, ext) {
                    true
                } else {
                    continue;
                }
            }
            None => false,
        };
        if conflict {
            return Err(FusionError::import(format!(
                "extern fn '{}' declared by lib '{}' conflicts (different signature or lib)",
                ext.name, request.lib
            )));
        }
        let mut translated = ext.clone();
        if let Some(main_name) = path_to_main_name.get(&ext_path) {
            translated.lib_name = main_name.clone();
        }
        main.extern_fns.push(translated);
    }

    // Transitive closure of user-function helpers the imported bodies
    // reach, directly or through get_func_ptr.
    if !imported_fns.is_empty() {
        let lib_fn_names: FxHashSet<&str> =
            lib.user_fns.iter().map(|f| f.name.as_str()).collect();
        let mut visited: FxHashSet<String> = FxHashSet::default();
        let mut needed: FxHashSet<String> = FxHashSet::default();
        let mut worklist: Vec<&FnDef> = imported_fns.clone();
        while let Some(fndef) = worklist.pop() {
            if !visited.insert(fndef.name.clone()) {
                continue;
            }
            let mut called: FxHashSet<String> = FxHashSet::default();
            for stmt in &fndef.body {
                collect_called_in_stmt(stmt, &lib_fn_names, &mut called);
            }
            for callee in called {
                if let Some(callee_def) = lib.user_fns.iter().find(|f| f.name == callee) {
                    needed.insert(callee.clone());
                    if !visited.contains(&callee) {
                        worklist.push(callee_def);
                    }
                }
            }
        }
        for imported in &imported_fns {
            needed.remove(&imported.name);
        }

        for helper_name in needed {
            let helper = match lib.user_fns.iter().find(|f| f.name == helper_name) {
                Some(h) => h,
                None => continue,
            };
            let mut already_present = false;
            for existing in &main.user_fns {
                if existing.name != helper_name {
                    continue;
                }
                if fn_defs_signature_equal(existing, helper) {
                    already_present = true;
                    break;
                }
                return Err(FusionError::import(format!(
                    "duplicate symbol '{}': helper function from lib '{}' and already defined",
                    helper_name, request.lib
                )));
            }
            if !already_present {
                main.user_fns.push(helper.clone());
            }
        }
    }

    Ok(())
}

// ----------------------------------------------------------------------
// Callee collection
// ----------------------------------------------------------------------

fn collect_called_in_expr(expr: &Expr, fn_names: &FxHashSet<&str>, out: &mut FxHashSet<String>) {
    match expr {
        Expr::Call { callee, args, .. } => {
            if callee == "get_func_ptr" {
                if let Some(Expr::Var(name)) = args.first() {
                    if fn_names.contains(name.as_str()) {
                        out.insert(name.clone());
                    }
                }
            } else if fn_names.contains(callee.as_str()) {
                out.insert(callee.clone());
            }
            for arg in args {
                collect_called_in_expr(arg, fn_names, out);
            }
        }
        Expr::Binary { left, right, .. } | Expr::Compare { left, right, .. } => {
            collect_called_in_expr(left, fn_names, out);
            collect_called_in_expr(right, fn_names, out);
        }
        Expr::AllocArray { count, .. } => collect_called_in_expr(count, fn_names, out),
        Expr::AllocBytes { size } => collect_called_in_expr(size, fn_names, out),
        Expr::Load { ptr, .. } | Expr::LoadField { ptr, .. } => {
            collect_called_in_expr(ptr, fn_names, out)
        }
        Expr::Store { ptr, value } => {
            collect_called_in_expr(ptr, fn_names, out);
            collect_called_in_expr(value, fn_names, out);
        }
        Expr::StoreField { ptr, value, .. } => {
            collect_called_in_expr(ptr, fn_names, out);
            collect_called_in_expr(value, fn_names, out);
        }
        Expr::Index { base, index } => {
            collect_called_in_expr(base, fn_names, out);
            collect_called_in_expr(index, fn_names, out);
        }
        Expr::Cast { operand, .. } => collect_called_in_expr(operand, fn_names, out),
        Expr::Int(_)
        | Expr::Float(_)
        | Expr::Str(_)
        | Expr::Var(_)
        | Expr::Alloc { .. }
        | Expr::AddrOf { .. } => {}
    }
}

fn collect_called_in_stmt(stmt: &Stmt, fn_names: &FxHashSet<&str>, out: &mut FxHashSet<String>) {
    match stmt {
        Stmt::Return(expr) | Stmt::Expr(expr) => collect_called_in_expr(expr, fn_names, out),
        Stmt::Let { init, .. } => collect_called_in_expr(init, fn_names, out),
        Stmt::If {
            cond,
            then_body,
            else_body,
        } => {
            collect_called_in_expr(cond, fn_names, out);
            for s in then_body {
                collect_called_in_stmt(s, fn_names, out);
            }
            for s in else_body {
                collect_called_in_stmt(s, fn_names, out);
            }
        }
        Stmt::For {
            iterable, body, ..
        } => {
            collect_called_in_expr(iterable, fn_names, out);
            for s in body {
                collect_called_in_stmt(s, fn_names, out);
            }
        }
        Stmt::Assign { target, value } => {
            collect_called_in_expr(target, fn_names, out);
            collect_called_in_expr(value, fn_names, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static DIR_SEQ: AtomicUsize = AtomicUsize::new(0);

    /// Fresh scratch directory for one test's library files.
    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "fusion-imports-{}-{}",
            std::process::id(),
            DIR_SEQ.fetch_add(1, Ordering::SeqCst)
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_lib(dir: &Path, name: &str, source: &str) {
        std::fs::write(dir.join(format!("{}.fusion", name)), source).unwrap();
    }

    fn parse_main(source: &str) -> Program {
        parse(&lex(source)).unwrap()
    }

    #[test]
    fn test_merge_struct_and_fn() {
        let dir = scratch_dir();
        write_lib(
            &dir,
            "geo",
            "export struct Vec2 { x: f64; y: f64; };
             export fn zero() -> i64 { return 0; }",
        );
        let mut main = parse_main(
            r#"import lib "geo" { struct Vec2; fn zero() -> i64; };
               print(zero());"#,
        );
        resolve_imports(&dir.join("main.fusion"), &mut main).unwrap();
        assert!(main.find_struct("Vec2").is_some());
        assert!(main.find_user_fn("zero").is_some());
    }

    #[test]
    fn test_duplicate_import_is_harmless() {
        let dir = scratch_dir();
        write_lib(&dir, "geo", "export struct Vec2 { x: f64; y: f64; };");
        let mut main = parse_main(
            r#"import lib "geo" { struct Vec2; };
               import lib "geo" { struct Vec2; };
               print(1);"#,
        );
        resolve_imports(&dir.join("main.fusion"), &mut main).unwrap();
        assert_eq!(main.structs.iter().filter(|s| s.name == "Vec2").count(), 1);
    }

    #[test]
    fn test_conflicting_struct_shape_rejected() {
        let dir = scratch_dir();
        write_lib(&dir, "geo", "export struct Vec2 { x: f64; y: f64; };");
        let mut main = parse_main(
            r#"struct Vec2 { x: i64; };
               import lib "geo" { struct Vec2; };
               print(1);"#,
        );
        let err = resolve_imports(&dir.join("main.fusion"), &mut main).unwrap_err();
        match err {
            FusionError::Import { message } => {
                assert!(message.contains("duplicate symbol 'Vec2'"), "{}", message)
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_missing_exported_struct() {
        let dir = scratch_dir();
        write_lib(&dir, "geo", "struct Hidden { x: f64; };");
        let mut main = parse_main(r#"import lib "geo" { struct Hidden; }; print(1);"#);
        let err = resolve_imports(&dir.join("main.fusion"), &mut main).unwrap_err();
        match err {
            FusionError::Import { message } => assert_eq!(
                message,
                "import lib 'geo': missing exported struct Hidden"
            ),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_missing_file() {
        let dir = scratch_dir();
        let mut main = parse_main(r#"import lib "nowhere" { struct S; }; print(1);"#);
        let err = resolve_imports(&dir.join("main.fusion"), &mut main).unwrap_err();
        assert!(matches!(err, FusionError::Import { .. }));
    }

    #[test]
    fn test_circular_import_detected() {
        let dir = scratch_dir();
        write_lib(
            &dir,
            "a",
            r#"import lib "b" { fn fb() -> i64; };
               export fn fa() -> i64 { return 1; }"#,
        );
        write_lib(
            &dir,
            "b",
            r#"import lib "a" { fn fa() -> i64; };
               export fn fb() -> i64 { return 2; }"#,
        );
        let mut main = parse_main(r#"import lib "a" { fn fa() -> i64; }; print(fa());"#);
        let err = resolve_imports(&dir.join("main.fusion"), &mut main).unwrap_err();
        match err {
            FusionError::Import { message } => {
                assert!(message.starts_with("circular import involving"), "{}", message)
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_helper_closure_is_pulled_in() {
        let dir = scratch_dir();
        write_lib(
            &dir,
            "util",
            "fn helper(x: i64) -> i64 { return x + 1; }
             fn deeper(x: i64) -> i64 { return x * 2; }
             fn via_ptr() -> ptr { return get_func_ptr(deeper); }
             export fn top(x: i64) -> i64 { via_ptr(); return helper(x); }",
        );
        let mut main = parse_main(
            r#"import lib "util" { fn top(x: i64) -> i64; };
               print(top(1));"#,
        );
        resolve_imports(&dir.join("main.fusion"), &mut main).unwrap();
        assert!(main.find_user_fn("top").is_some());
        assert!(main.find_user_fn("helper").is_some());
        assert!(main.find_user_fn("via_ptr").is_some());
        assert!(main.find_user_fn("deeper").is_some());
    }

    #[test]
    fn test_extern_libs_renamed_and_deduped() {
        let dir = scratch_dir();
        write_lib(
            &dir,
            "mathwrap",
            r#"extern lib "libm.so.6" as m { fn cos(x: f64) -> f64; };
               export fn kos(x: f64) -> f64 { return cos(x); }"#,
        );
        let mut main = parse_main(
            r#"import lib "mathwrap" { fn kos(x: f64) -> f64; };
               print(kos(0.0));"#,
        );
        resolve_imports(&dir.join("main.fusion"), &mut main).unwrap();
        assert_eq!(main.libs.len(), 1);
        assert_eq!(main.libs[0].path, "libm.so.6");
        assert_eq!(main.libs[0].name, "__lib0");
        assert_eq!(main.extern_fns[0].lib_name, "__lib0");
    }

    #[test]
    fn test_extern_fn_conflict_rejected() {
        let dir = scratch_dir();
        write_lib(
            &dir,
            "w1",
            r#"extern lib "libm.so.6" { fn cos(x: f64) -> f64; };
               export fn a() -> i64 { return 1; }"#,
        );
        write_lib(
            &dir,
            "w2",
            r#"extern lib "libother.so" { fn cos(x: f64) -> f64; };
               export fn b() -> i64 { return 2; }"#,
        );
        let mut main = parse_main(
            r#"import lib "w1" { fn a() -> i64; };
               import lib "w2" { fn b() -> i64; };
               print(a() + b());"#,
        );
        let err = resolve_imports(&dir.join("main.fusion"), &mut main).unwrap_err();
        match err {
            FusionError::Import { message } => assert!(
                message.contains("extern fn 'cos'") && message.contains("conflicts"),
                "{}",
                message
            ),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
