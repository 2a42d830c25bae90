//! CLI core: `brace` with no args enters the REPL, `brace <path>` runs a
//! file, anything else is a usage error (spec §6).
//!
//! Mirrors the teacher's `vitte-cli` split between a setup-only `main.rs`
//! and a testable `run()` here, minus the subcommand surface — this tool
//! has exactly one real mode switch (file vs. REPL), not a build/run/disasm
//! family.

mod error;

use std::path::{Path, PathBuf};

use anyhow::Context;
use brace_core::Value;
use brace_vm::{InterpretError, Vm};
use clap::Parser;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use error::CliError;

const EXIT_USAGE: i32 = 64;
const EXIT_COMPILE_ERROR: i32 = 65;
const EXIT_RUNTIME_ERROR: i32 = 70;

#[derive(Parser, Debug)]
#[command(name = "brace", version, about = "The Brace scripting language")]
struct Cli {
    /// Script to run. Omitted: start the REPL.
    script: Option<PathBuf>,
}

/// Entry point called from `main.rs`. Returns the process exit code rather
/// than letting `main` pick one, since distinct failure shapes (usage,
/// compile, runtime) each carry their own exit code (spec §6).
pub fn run() -> anyhow::Result<i32> {
    let raw_args: Vec<String> = std::env::args().skip(1).collect();
    if raw_args.len() > 1 {
        eprintln!("Usage: brace [script]");
        return Ok(EXIT_USAGE);
    }

    let cli = Cli::parse();
    let mut vm = Vm::new();

    match cli.script {
        Some(path) => run_file(&mut vm, &path),
        None => run_repl(&mut vm),
    }
}

fn run_file(vm: &mut Vm, path: &Path) -> anyhow::Result<i32> {
    let source = std::fs::read_to_string(path)
        .map_err(|source| CliError::ReadScript { path: path.display().to_string(), source })
        .context("failed to start the script")?;

    match vm.interpret(&source, path.to_str()) {
        Ok(_) => Ok(0),
        Err(InterpretError::Compile(errors)) => {
            for e in &errors {
                eprintln!("{e}");
            }
            Ok(EXIT_COMPILE_ERROR)
        }
        Err(InterpretError::Runtime(e)) => {
            eprintln!("{}", e.render());
            Ok(EXIT_RUNTIME_ERROR)
        }
    }
}

fn run_repl(vm: &mut Vm) -> anyhow::Result<i32> {
    println!("Brace {} — Ctrl-D to exit.", env!("CARGO_PKG_VERSION"));

    let mut rl = DefaultEditor::new().context("failed to start the line editor")?;
    let mut buffer = String::new();
    let mut depth: i32 = 0;

    loop {
        let prompt = if depth <= 0 { "brc:> " } else { "...   " };
        match rl.readline(prompt) {
            Ok(line) => {
                let trimmed = line.trim_end();
                depth += brace_delta(trimmed);
                if !buffer.is_empty() {
                    buffer.push('\n');
                }
                buffer.push_str(trimmed);
                let _ = rl.add_history_entry(trimmed);

                if depth <= 0 && !buffer.trim().is_empty() {
                    eval_unit(vm, &buffer);
                    buffer.clear();
                    depth = 0;
                }
            }
            Err(ReadlineError::Eof) | Err(ReadlineError::Interrupted) => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(0)
}

fn eval_unit(vm: &mut Vm, source: &str) {
    match vm.interpret(source, None) {
        Ok(_) => {
            let last = vm.last_value();
            if !matches!(last, Value::Null) {
                println!("{}", vm.display(last));
            }
        }
        Err(InterpretError::Compile(errors)) => {
            for e in &errors {
                eprintln!("{e}");
            }
        }
        Err(InterpretError::Runtime(e)) => eprintln!("{}", e.render()),
    }
}

/// Naive brace counting for the REPL's depth-buffering. Doesn't understand
/// string or comment contents, so a `{` inside a string literal throws the
/// count off — acceptable for the REPL's line-accumulation heuristic, not
/// used anywhere compilation correctness depends on it.
fn brace_delta(line: &str) -> i32 {
    line.chars().fold(0, |acc, c| match c {
        '{' => acc + 1,
        '}' => acc - 1,
        _ => acc,
    })
}
