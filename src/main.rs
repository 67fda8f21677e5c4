use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info, LevelFilter};

mod ast;
mod codegen;
mod error;
mod layout;
mod parser;
mod scope;
mod sema;
mod types;
mod vm;

use codegen::Assembled;
use error::CompileError;

/// Checks IML programs and translates them into stack-machine code.
#[derive(Parser, Debug)]
#[command(name = "imlc", version, about)]
struct Args {
    /// Source files, compiled one after another. Reads stdin when empty.
    files: Vec<PathBuf>,

    /// Execute each compiled program instead of printing its listing.
    #[arg(long)]
    run: bool,

    /// Whitespace-separated values consumed by input instructions.
    #[arg(long, default_value = "")]
    input: String,

    /// Maximum number of instructions per program.
    #[arg(long, default_value_t = 4096)]
    capacity: usize,

    /// Number of store cells given to the machine.
    #[arg(long, default_value_t = 16384)]
    store: usize,

    /// Raise the log level; repeat for more detail.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn compile(src: &str, capacity: usize) -> std::result::Result<Assembled, CompileError> {
    let program = parser::parse_program(src)?;
    debug!("parsed program {}", program.name);
    let checked = sema::check_program(&program)?;
    codegen::generate(&checked, capacity)
}

fn read_source(file: Option<&PathBuf>) -> Result<(String, String)> {
    match file {
        Some(path) => {
            let src = std::fs::read_to_string(path)
                .with_context(|| format!("cannot read {}", path.display()))?;
            Ok((path.display().to_string(), src))
        }
        None => {
            let mut src = String::new();
            io::stdin()
                .read_to_string(&mut src)
                .context("cannot read standard input")?;
            Ok(("<stdin>".to_string(), src))
        }
    }
}

fn emit(asm: &Assembled, args: &Args, out: &mut impl Write) -> Result<()> {
    let code = asm.code.instructions();
    if !args.run {
        for (addr, instr) in code.iter().enumerate() {
            writeln!(out, "{addr:>4}: {instr}")?;
        }
        return Ok(());
    }
    let mut input = args
        .input
        .split_whitespace()
        .map(str::to_string)
        .collect::<Vec<_>>()
        .into_iter();
    vm::Machine::new(code, args.store).run(&mut input, out)?;
    Ok(())
}

fn process(file: Option<&PathBuf>, args: &Args, out: &mut impl Write) -> Result<()> {
    let (name, src) = read_source(file)?;
    let asm = compile(&src, args.capacity).with_context(|| name.clone())?;
    info!(
        "{name}: {} instructions, {} routines",
        asm.code.len(),
        asm.layout.entries.len()
    );
    emit(&asm, args, out).with_context(|| name.clone())
}

fn main() -> ExitCode {
    let args = Args::parse();
    let level = match args.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let files: Vec<Option<&PathBuf>> = if args.files.is_empty() {
        vec![None]
    } else {
        args.files.iter().map(Some).collect()
    };

    let mut failed = false;
    for file in files {
        if let Err(e) = process(file, &args, &mut out) {
            eprintln!("error: {e:#}");
            failed = true;
        }
    }
    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
