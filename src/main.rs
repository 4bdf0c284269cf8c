use std::{
    io::Write,
    path::{Path, PathBuf},
    process::ExitCode,
};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::EnvFilter;
use x86sim_common::{Cpu, HostIO, MachineConfig, Program};

mod report;

use report::MachineSnapshot;

#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Trace every executed instruction to stderr.
    #[arg(short, long, global = true)]
    verbose: bool,
    #[arg(short, long, global = true)]
    show_cpu_state: bool,
    /// Print the final machine state as JSON instead of text.
    #[arg(short, long, global = true)]
    json: bool,
    #[arg(short, long, global = true, default_value = "1048576")]
    memory_size: usize,
    #[arg(long, global = true, default_value = "0xFFFF", value_parser = parse_address)]
    stack_pointer: u32,
    #[arg(short, long, global = true, default_value = "100000")]
    instruction_budget: usize,
    #[command(subcommand)]
    action: Action,
}

#[derive(Subcommand)]
enum Action {
    /// Load and run a program.
    Run { path: PathBuf },
    /// Report unknown instructions, operand count mismatches and undefined labels.
    Check { path: PathBuf },
    /// Print the loaded program with instruction indices and labels.
    List { path: PathBuf },
}

fn parse_address(text: &str) -> Result<u32, String> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => text.parse::<u32>(),
    };
    parsed.map_err(|e| format!("invalid address `{text}`: {e}"))
}

/// Streams program output to a writer as it is produced.
///
/// The first write error stops the echo and is kept for the caller; the
/// session still records the full output.
#[derive(Debug)]
struct WriterHostIo<W: Write + std::fmt::Debug> {
    writer: W,
    echo: bool,
    error: Option<std::io::Error>,
}

impl<W: Write + std::fmt::Debug> WriterHostIo<W> {
    fn new(writer: W, echo: bool) -> Self {
        Self {
            writer,
            echo,
            error: None,
        }
    }

    fn write_text(&mut self, text: &str) -> std::io::Result<()> {
        self.writer.write_all(text.as_bytes())?;
        self.writer.flush()
    }
}

impl<W: Write + std::fmt::Debug> HostIO for WriterHostIo<W> {
    fn write_output(&mut self, text: &str) {
        if !self.echo || self.error.is_some() {
            return;
        }
        if let Err(err) = self.write_text(text) {
            warn!("failed to write program output: {err}");
            self.error = Some(err);
        }
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "trace" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load(path: &Path) -> anyhow::Result<Program> {
    Program::load_file(path).with_context(|| format!("failed to read {}", path.display()))
}

fn run(
    program: Program,
    config: &MachineConfig,
    show_cpu_state: bool,
    json: bool,
) -> anyhow::Result<ExitCode> {
    let mut cpu = Cpu::new(program, config, WriterHostIo::new(std::io::stdout(), !json));
    let result = cpu.execute();

    if let Some(err) = cpu.host_io.error.take() {
        return Err(err).context("failed to write program output to stdout");
    }

    if json {
        let snapshot = MachineSnapshot::capture(&cpu, result.as_ref().err());
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        println!();
        println!("========== RESULT/STATS ===========");
        println!();

        if let Err(err) = &result {
            println!("Error: {err}");
        }
        println!("{}", report::render_stats(cpu.status(), &cpu.stats()));

        if show_cpu_state || result.is_err() {
            print!("{}", report::render_state(&cpu));
        }
    }

    Ok(if result.is_ok() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn check(program: &Program) -> ExitCode {
    let findings = x86sim_assembler::check(program);
    if findings.is_empty() {
        println!("No problems found in {} instructions", program.len());
        return ExitCode::SUCCESS;
    }

    for finding in &findings {
        println!(
            "{:04}  {}: {}",
            finding.index, finding.line, finding.diagnostic
        );
    }
    println!("{} problem(s) found", findings.len());
    ExitCode::FAILURE
}

fn main() -> anyhow::Result<ExitCode> {
    let Args {
        verbose,
        show_cpu_state,
        json,
        memory_size,
        stack_pointer,
        instruction_budget,
        action,
    } = Args::parse();

    init_logging(verbose);

    let config = MachineConfig {
        memory_size,
        initial_stack_pointer: stack_pointer,
        instruction_budget,
    };

    match action {
        Action::Run { path } => run(load(&path)?, &config, show_cpu_state, json),
        Action::Check { path } => Ok(check(&load(&path)?)),
        Action::List { path } => {
            println!("{}", x86sim_assembler::render_listing(&load(&path)?));
            Ok(ExitCode::SUCCESS)
        }
    }
}
