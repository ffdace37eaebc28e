// Front-end integration: lex + parse + import resolution + analysis
// over realistic programs, without running the JIT.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use fusion::ast::{Program, Stmt};
use fusion::{compile_source, FusionError};

static SEQ: AtomicUsize = AtomicUsize::new(0);

fn scratch_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "fusion-frontend-{}-{}",
        std::process::id(),
        SEQ.fetch_add(1, Ordering::SeqCst)
    ));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn compile(source: &str) -> Result<Program, FusionError> {
    compile_source(source, Path::new("main.fusion"))
}

#[test]
fn realistic_program_analyzes() {
    compile(
        r#"# A small record-and-pointer workout.
           struct Point { x: f64; y: f64; tag: i64; };

           fn dist2(p: ptr) -> f64 {
             let x = load_field(p, Point, x);
             let y = load_field(p, Point, y);
             return x * x + y * y;
           }

           fn classify(d: f64) -> i64 {
             if (d > 100.0) { return 2; }
             elif (d > 1.0) { return 1; }
             else { return 0; }
           }

           let p = alloc(Point);
           store_field(p, Point, x, 3.0);
           store_field(p, Point, y, 4.0);
           store_field(p, Point, tag, 7);
           print(classify(dist2(p)));"#,
    )
    .unwrap();
}

#[test]
fn pipeline_with_arrays_and_files() {
    compile(
        r#"fn sum(a: ptr) -> i64 {
             let total = 0;
             for i in range(load(a)) { total = total + a[i]; }
             return total;
           }
           let data = alloc_array(i64, 4);
           data[0] = 1; data[1] = 2; data[2] = 3; data[3] = 4;
           let h = open("sums.txt", "w");
           write_file(h, sum(data));
           close(h);
           print(sum(data));"#,
    )
    .unwrap();
}

#[test]
fn import_merge_through_files() {
    let dir = scratch_dir();
    std::fs::write(
        dir.join("geometry.fusion"),
        r#"export struct Vec2 { x: f64; y: f64; };
           fn dot_raw(ax: f64, ay: f64, bx: f64, by: f64) -> f64 {
             return ax * bx + ay * by;
           }
           export fn dot(a: ptr, b: ptr) -> f64 {
             return dot_raw(load_field(a, Vec2, x), load_field(a, Vec2, y),
                            load_field(b, Vec2, x), load_field(b, Vec2, y));
           }"#,
    )
    .unwrap();
    let main_src = r#"import lib "geometry" { struct Vec2; fn dot(a: ptr, b: ptr) -> f64; };
         let a = alloc(Vec2);
         store_field(a, Vec2, x, 1.0);
         store_field(a, Vec2, y, 2.0);
         print(dot(a, a));"#;

    let program = compile_source(main_src, &dir.join("main.fusion")).unwrap();
    // The exported fn, its private helper, and the struct all merged.
    assert!(program.find_struct("Vec2").is_some());
    assert!(program.find_user_fn("dot").is_some());
    assert!(program.find_user_fn("dot_raw").is_some());
}

#[test]
fn importing_same_library_twice_dedups() {
    let dir = scratch_dir();
    std::fs::write(
        dir.join("shared.fusion"),
        "export struct S { v: i64; };
         export fn get(p: ptr) -> i64 { return load_field(p, S, v); }",
    )
    .unwrap();
    let main_src = r#"import lib "shared" { struct S; fn get(p: ptr) -> i64; };
         import lib "shared" { struct S; fn get(p: ptr) -> i64; };
         let s = alloc(S);
         print(get(s));"#;

    let program = compile_source(main_src, &dir.join("main.fusion")).unwrap();
    assert_eq!(program.structs.iter().filter(|s| s.name == "S").count(), 1);
    assert_eq!(program.user_fns.iter().filter(|f| f.name == "get").count(), 1);
}

#[test]
fn missing_import_symbol_names_library_and_symbol() {
    let dir = scratch_dir();
    std::fs::write(dir.join("empty.fusion"), "export fn nothing() -> void { }").unwrap();
    let err = compile_source(
        r#"import lib "empty" { struct Ghost; }; print(1);"#,
        &dir.join("main.fusion"),
    )
    .unwrap_err();
    match err {
        FusionError::Import { message } => {
            assert!(message.contains("empty"), "{}", message);
            assert!(message.contains("Ghost"), "{}", message);
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[test]
fn wrong_arity_is_a_semantic_error() {
    let err = compile("print(1, 2, 3);").unwrap_err();
    assert!(matches!(err, FusionError::Semantic { .. }));
}

#[test]
fn undefined_variable_is_a_semantic_error() {
    let err = compile("let x = 1; print(y);").unwrap_err();
    match err {
        FusionError::Semantic { message } => assert_eq!(message, "undefined variable 'y'"),
        other => panic!("unexpected error: {:?}", other),
    }
}

#[test]
fn parse_error_reports_token_position() {
    let err = compile("let x = 1;\nlet = 2;").unwrap_err();
    match err {
        FusionError::Parse { line, .. } => assert_eq!(line, 2),
        other => panic!("unexpected error: {:?}", other),
    }
}

#[test]
fn indirect_call_signatures_written_back() {
    let program = compile(
        "fn mul(a: i64, b: i64) -> i64 { return a * b; }
         let f = get_func_ptr(mul);
         print(call(f, 6, 7));",
    )
    .unwrap();
    let Stmt::Expr(fusion::ast::Expr::Call { args, .. }) = &program.top_level[1] else {
        panic!("expected print at top level");
    };
    let fusion::ast::Expr::Call { inferred_sig, .. } = &args[0] else {
        panic!("expected indirect call inside print");
    };
    let sig = inferred_sig.as_ref().expect("signature missing");
    assert_eq!(sig.params.len(), 2);
}

#[test]
fn opaque_types_satisfy_extern_signatures() {
    compile(
        r#"opaque FILE;
           extern lib "libc.so.6" { fn fflush(f: FILE) -> i32; };
           print(1);"#,
    )
    .unwrap();
}

#[test]
fn unknown_named_type_in_extern_rejected() {
    let err = compile(
        r#"extern lib "libc.so.6" { fn fflush(f: Ghost) -> i32; };
           print(1);"#,
    )
    .unwrap_err();
    match err {
        FusionError::Semantic { message } => {
            assert_eq!(message, "unknown type 'Ghost' in extern fn 'fflush'")
        }
        other => panic!("unexpected error: {:?}", other),
    }
}
