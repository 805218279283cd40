use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use pagetrap::{parse_size, run_memory, run_stack, Report, RunOptions};
use pagetrap_runtime::{FaultKind, GuardMode, MemoryConfig, StackConfig};

/// Guarded memory and stack regions enforced by page faults.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// How bounds are enforced
    #[arg(long, value_enum, default_value_t = Mode::Hardware, global = true)]
    mode: Mode,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Touch offsets of a growable memory region
    Memory {
        /// Hard upper bound of the region
        #[arg(long, default_value = "1MiB", value_parser = parse_size)]
        max_bytes: usize,

        /// Page size (defaults to 4 KiB or the host page, whichever is larger)
        #[arg(long, value_parser = parse_size)]
        page_size: Option<usize>,

        /// Offsets to touch (defaults to the lazy-growth scenario)
        #[arg(value_parser = parse_size)]
        offsets: Vec<usize>,
    },
    /// Touch offsets of a guarded stack region
    Stack {
        /// Usable bytes between the guards
        #[arg(long, default_value = "32KiB", value_parser = parse_size)]
        usable_bytes: usize,

        /// Guard zone at each end (defaults to one host page)
        #[arg(long, value_parser = parse_size)]
        guard_bytes: Option<usize>,

        /// Offsets to touch, guard zones included (defaults to the
        /// underflow/overflow scenario)
        #[arg(value_parser = parse_size)]
        offsets: Vec<usize>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    /// Reserve address space and trap on first touch and guard hits
    Hardware,
    /// Explicit bounds checks on every access
    Software,
}

impl From<Mode> for GuardMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Hardware => GuardMode::Hardware,
            Mode::Software => GuardMode::Software,
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let report = match cli.command {
        Command::Memory {
            max_bytes,
            page_size,
            offsets,
        } => {
            let config = MemoryConfig {
                max_bytes,
                page_size,
            };
            eprintln!("pagetrap: memory region, max {max_bytes:#x} bytes, {:?} mode", cli.mode);
            run_memory(
                &config,
                &RunOptions {
                    mode: cli.mode.into(),
                    offsets,
                },
            )?
        }
        Command::Stack {
            usable_bytes,
            guard_bytes,
            offsets,
        } => {
            let config = StackConfig {
                usable_bytes,
                guard_bytes,
            };
            eprintln!(
                "pagetrap: stack region, {usable_bytes:#x} usable bytes, {:?} mode",
                cli.mode
            );
            run_stack(
                &config,
                &RunOptions {
                    mode: cli.mode.into(),
                    offsets,
                },
            )?
        }
    };

    print_report(&report);
    Ok(())
}

fn print_report(report: &Report) {
    for step in &report.steps {
        match step.fault {
            None if step.tag == FaultKind::Growth.tag() => {
                println!("offset {:#x}: page committed on first touch", step.offset)
            }
            None => println!("offset {:#x}: ok", step.offset),
            Some(fault) => println!(
                "offset {:#x}: recovered from {} (tag {}), skipped",
                step.offset, fault.kind, step.tag
            ),
        }
    }
    println!(
        "Done. {}: allocated pages {}, rejected accesses {}.",
        report.region, report.pages_allocated, report.rejected_accesses
    );
}
