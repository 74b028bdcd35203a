//! Sable command-line tool
//!
//! Single interface for working with Sable programs: run source or compiled
//! bytecode, build source to `.sbc` files, type-check, and disassemble.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::exit;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use sable_engine::compiler::bytecode::{decode_program, disassemble, encode_program};
use sable_engine::{Compiler, Program, Vm};
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

/// Extension used for compiled program files.
const BYTECODE_EXT: &str = "sbc";

#[derive(Parser)]
#[command(name = "sable")]
#[command(about = "Sable programming language toolchain", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a Sable source file or compiled .sbc file
    Run {
        /// Input file
        file: PathBuf,
    },

    /// Compile Sable source to a .sbc file
    Build {
        /// Input file
        file: PathBuf,
        /// Output file path (defaults to the input with an .sbc extension)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Type-check without building
    Check {
        /// Files to check
        files: Vec<PathBuf>,
    },

    /// Disassemble a source or compiled .sbc file
    Disasm {
        /// Input file
        file: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { file } => {
            let program = load_program(&file)?;
            let mut vm = Vm::new(&program);
            match vm.run() {
                Ok(result) => {
                    if !result.is_none() {
                        println!("{}", vm.display_value(result));
                    }
                }
                Err(e) => {
                    report_failure(&e.to_string());
                    exit(1);
                }
            }
        }

        Commands::Build { file, output } => {
            let program = compile_file(&file)?;
            let out_path =
                output.unwrap_or_else(|| file.with_extension(BYTECODE_EXT));
            fs::write(&out_path, encode_program(&program))
                .with_context(|| format!("cannot write {}", out_path.display()))?;
            println!("Wrote {}", out_path.display());
        }

        Commands::Check { files } => {
            let mut failed = 0usize;
            for file in &files {
                match compile_file(file) {
                    Ok(_) => println!("{}: ok", file.display()),
                    Err(_) => failed += 1,
                }
            }
            if failed > 0 {
                report_failure(&format!("{} file(s) failed to check", failed));
                exit(1);
            }
        }

        Commands::Disasm { file } => {
            let program = load_program(&file)?;
            println!("; {} bytes, {} statics", program.bytecode.len(), program.statics_count);
            if !program.bindings.is_empty() {
                let mut names: Vec<&String> = program.bindings.keys().collect();
                names.sort();
                for name in names {
                    println!("; native binding: {} -> static {}", name, program.bindings[name]);
                }
            }
            for line in disassemble(&program.bytecode) {
                println!("{}", line);
            }
        }
    }

    Ok(())
}

/// Load a program from either a compiled file or source, by extension.
fn load_program(path: &Path) -> Result<Program> {
    if path.extension().and_then(|e| e.to_str()) == Some(BYTECODE_EXT) {
        let bytes =
            fs::read(path).with_context(|| format!("cannot read {}", path.display()))?;
        let program = decode_program(&bytes)
            .with_context(|| format!("invalid bytecode file {}", path.display()))?;
        Ok(program)
    } else {
        compile_file(path)
    }
}

/// Compile one source file, reporting diagnostics to stderr on failure.
fn compile_file(path: &Path) -> Result<Program> {
    let source =
        fs::read_to_string(path).with_context(|| format!("cannot read {}", path.display()))?;
    let name = path.display().to_string();

    match Compiler::new(name.clone(), source.clone()).compile() {
        Ok(program) => Ok(program),
        Err(errors) => {
            errors.report(&name, &source);
            anyhow::bail!("{}: {} error(s)", name, errors.len())
        }
    }
}

/// Red "error:" prefix on stderr, matching compiler diagnostics.
fn report_failure(message: &str) {
    let mut stderr = StandardStream::stderr(ColorChoice::Auto);
    let _ = stderr.set_color(ColorSpec::new().set_fg(Some(Color::Red)).set_bold(true));
    let _ = write!(stderr, "error");
    let _ = stderr.reset();
    let _ = writeln!(stderr, ": {}", message);
}
