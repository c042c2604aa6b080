//! VM CLI: bytecode text on stdin, program output on stdout,
//! end-of-run diagnostics on stderr.
use std::env;
use std::io::{self, Read};
use std::process;

use cellvm::{Program, Vm, VmConfig};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_usage() {
    eprintln!("cellvm v{VERSION}");
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("    cellvm [OPTIONS] < program.cvm");
    eprintln!();
    eprintln!("OPTIONS:");
    eprintln!("    -h, --help       Print this help message");
    eprintln!("    -v, --version    Print version information");
    eprintln!("    -j, --jit        Execute through the native code generator");
    eprintln!("    --strict         Panic on unknown mnemonics instead of skipping them");
    eprintln!("    --stack <N>      Operand stack capacity in cells (default 500)");
    eprintln!("    --heap <N>       Heap size in cells, split into two semispaces (default 50000)");
    eprintln!("    --quiet          Skip the end-of-run diagnostics");
}

struct Options {
    config: VmConfig,
    jit: bool,
    quiet: bool,
}

fn parse_args() -> Result<Options, String> {
    let mut config = VmConfig::default();
    let mut jit = false;
    let mut quiet = false;
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => {
                print_usage();
                process::exit(0);
            }
            "-v" | "--version" => {
                println!("cellvm {VERSION}");
                process::exit(0);
            }
            "-j" | "--jit" => jit = true,
            "--strict" => config.strict = true,
            "--quiet" => quiet = true,
            "--stack" => {
                let value = args.next().ok_or("Missing value after --stack")?;
                config.stack_size = value
                    .parse()
                    .map_err(|_| format!("Bad stack size: {value}"))?;
            }
            "--heap" => {
                let value = args.next().ok_or("Missing value after --heap")?;
                config.heap_size = value
                    .parse()
                    .map_err(|_| format!("Bad heap size: {value}"))?;
            }
            other => return Err(format!("Unknown option: {other}")),
        }
    }
    Ok(Options { config, jit, quiet })
}

fn run(options: &Options, program: &Program, vm: &mut Vm) -> Result<(), cellvm::VmError> {
    #[cfg(feature = "jit")]
    if options.jit {
        return match cellvm::jit::run_jit(vm, program) {
            Ok(()) => Ok(()),
            Err(cellvm::jit::JitError::Vm(e)) => Err(e),
            Err(e) => {
                eprintln!("Error: {e}");
                process::exit(1);
            }
        };
    }
    #[cfg(not(feature = "jit"))]
    if options.jit {
        eprintln!("Error: this build has no JIT; rebuild with --features jit");
        process::exit(1);
    }
    vm.run(program)
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

    let mut text = String::new();
    if let Err(e) = io::stdin().read_to_string(&mut text) {
        eprintln!("Error: failed to read from stdin: {e}");
        process::exit(1);
    }

    let program = match Program::parse(&text) {
        Ok(program) => program,
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    };

    let mut vm = Vm::new(&options.config);
    let result = run(&options, &program, &mut vm);

    if let Err(e) = &result {
        println!("PANIC: {e}");
    }
    if !options.quiet {
        let _ = vm.report(&mut io::stderr().lock());
    }
    if result.is_err() {
        process::exit(1);
    }
}
