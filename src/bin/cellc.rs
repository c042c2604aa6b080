//! Compiler CLI: S-expressions on stdin, linked bytecode on stdout.
use std::env;
use std::io::{self, Read, Write};
use std::process;

use cellvm::compile_source;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_usage() {
    eprintln!("cellc v{VERSION}");
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("    cellc [OPTIONS] < program.lsp > program.cvm");
    eprintln!();
    eprintln!("OPTIONS:");
    eprintln!("    -h, --help        Print this help message");
    eprintln!("    -v, --version     Print version information");
    eprintln!("    -o, --optimize    Run the peephole optimizer");
}

struct Options {
    optimize: bool,
}

fn parse_args() -> Result<Options, String> {
    let mut optimize = false;
    for arg in env::args().skip(1) {
        match arg.as_str() {
            "-h" | "--help" => {
                print_usage();
                process::exit(0);
            }
            "-v" | "--version" => {
                println!("cellc {VERSION}");
                process::exit(0);
            }
            "-o" | "--optimize" => optimize = true,
            other => return Err(format!("Unknown option: {other}")),
        }
    }
    Ok(Options { optimize })
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let options = match parse_args() {
        Ok(options) => options,
        Err(e) => {
            eprintln!("Error: {e}");
            eprintln!();
            print_usage();
            process::exit(1);
        }
    };

    let mut source = String::new();
    if let Err(e) = io::stdin().read_to_string(&mut source) {
        eprintln!("Error: failed to read from stdin: {e}");
        process::exit(1);
    }

    let program = match compile_source(&source, options.optimize) {
        Ok(program) => program,
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    };

    let mut stdout = io::stdout().lock();
    if let Err(e) = write!(stdout, "{program}") {
        eprintln!("Error: failed to write bytecode: {e}");
        process::exit(1);
    }
}
