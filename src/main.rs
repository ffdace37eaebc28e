use std::path::Path;
use std::process::ExitCode;

fn usage() {
    println!("Fusion compiler - usage: fusion [options] <input.fusion>");
    println!("  --help, -h       Show this help");
    println!("  --version, -v    Show compiler version");
    println!("  run <file>       Compile and JIT-run a .fusion file");
}

fn run(path: &str) -> ExitCode {
    match fusion::run_file(Path::new(path)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("compiler: {}", e.description());
            ExitCode::FAILURE
        }
    }
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut i = 0;
    while i < args.len() {
        let arg = &args[i];
        if arg == "--help" || arg == "-h" {
            usage();
            return ExitCode::SUCCESS;
        }
        if arg == "--version" || arg == "-v" {
            println!(
                "Fusion compiler {} (Cranelift JIT)",
                env!("CARGO_PKG_VERSION")
            );
            return ExitCode::SUCCESS;
        }
        if arg == "run" && i + 1 < args.len() {
            return run(&args[i + 1]);
        }
        if !arg.starts_with('-') {
            return run(arg);
        }
        i += 1;
    }
    usage();
    ExitCode::SUCCESS
}
