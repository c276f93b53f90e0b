use std::fmt::Display;

use clap::{Parser, Subcommand, ValueEnum};
use cpu_energy::EnergyDomain;

#[derive(Parser)]
#[command(author, version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Only show info about the CPU and its energy domains, then exit.
    Info,

    /// Sample the energy counters continuously and report cumulative joules.
    Poll {
        /// How to access the energy counters.
        #[arg(value_enum)]
        source: SourceType,

        /// The domains to sample. Defaults to every domain the CPU supports.
        #[arg(short, long, value_delimiter = ',')]
        domains: Option<Vec<EnergyDomain>>,

        /// Sampling interval, in seconds. Long intervals are bounded so that
        /// no counter wraparound can be missed.
        #[arg(short, long, default_value_t = 10.0)]
        interval: f64,

        /// Where to write the observations.
        #[arg(short, long, value_enum, default_value_t = OutputType::Stdout)]
        output: OutputType,

        /// Sets the output file, if output is set to file.
        #[arg(long)]
        output_file: Option<String>,
    },
}

#[derive(Clone, ValueEnum, Debug, PartialEq, Eq, Copy)]
pub enum OutputType {
    None,
    Stdout,
    File,
}

impl Display for OutputType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let str = match self {
            OutputType::None => "none",
            OutputType::Stdout => "stdout",
            OutputType::File => "file",
        };
        f.write_str(str)
    }
}

#[derive(Clone, ValueEnum, Debug, PartialEq, Eq, Copy)]
pub enum SourceType {
    Msr,
    Powercap,
    PerfEvent,
}

impl Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let str = match self {
            SourceType::Msr => "msr",
            SourceType::Powercap => "powercap",
            SourceType::PerfEvent => "perf-event",
        };
        f.write_str(str)
    }
}
