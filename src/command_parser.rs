use std::{num::NonZeroUsize, thread::available_parallelism};

use clap::{Args, Parser};

use self::{experiment::Experiment, lock_target::LockTarget};

pub mod experiment;
pub mod lock_target;

#[derive(Debug, Parser)]
#[clap(name = "queued lock benchmark", version)]
/// Benchmark Utility
pub struct App {
    #[command(subcommand)]
    pub lock_target: Option<LockTarget>,
    #[command(flatten)]
    pub global_opts: GlobalOpts,
}

fn default_parallelism() -> usize {
    available_parallelism().map(NonZeroUsize::get).unwrap_or(1)
}

#[derive(Debug, Args)]
pub struct GlobalOpts {
    #[arg(global = true, num_args(0..), value_delimiter = ',', value_terminator("."), long, short, default_values_t = [default_parallelism()].to_vec())]
    pub threads: Vec<usize>,
    #[arg(global = true, num_args(0..), value_delimiter = ',', value_terminator("."), long, short, default_values_t = [default_parallelism()].to_vec())]
    pub cpus: Vec<usize>,
    #[arg(global = true, long, short, default_value = "output")]
    pub output_path: String,
    /// Seconds each lock runs per experiment
    #[arg(global = true, long, short, default_value = "5")]
    pub duration: u64,
    #[arg(global = true, long, short)]
    pub experiment: Option<Experiment>,
    #[arg(global = true, long, short)]
    pub verbose: bool,
}
