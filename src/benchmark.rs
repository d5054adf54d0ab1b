use std::{path::Path, time::Duration};

use anyhow::Result;
use serde::Serialize;
use serde_with::{serde_as, DurationNanoSeconds};
use strum::IntoEnumIterator;

use crate::command_parser::{experiment::Experiment, lock_target::LockTarget, GlobalOpts};

use self::bencher::Bencher;

mod bencher;
mod counter_job;
mod helper;
mod read_mostly;

pub fn benchmark(
    num_cpu: usize,
    num_thread: usize,
    lock_target: Option<LockTarget>,
    options: &GlobalOpts,
) -> Result<()> {
    let bencher = Bencher::new(
        num_cpu,
        num_thread,
        options.experiment,
        match lock_target {
            Some(t) => vec![t],
            None => LockTarget::iter().collect(),
        },
        Path::new(&options.output_path),
        options.duration,
        options.verbose,
    );

    bencher.benchmark()
}

/// One row per thread and lock.
#[serde_as]
#[derive(Serialize, Default, Debug)]
pub struct Record {
    pub id: usize,
    pub cpu_id: usize,
    pub thread_num: usize,
    pub cpu_num: usize,
    /// Increments this thread applied to the counter.
    pub loop_count: u64,
    pub num_acquire: u64,
    /// Shared-mode reads, zero in write-only experiments.
    pub num_observe: u64,
    #[serde_as(as = "DurationNanoSeconds")]
    pub hold_time: Duration,
    pub locktype: String,
    pub experiment: String,
}

impl Record {
    fn new(id: usize, num_cpu: usize, num_thread: usize, experiment: Experiment) -> Self {
        Self {
            id,
            cpu_id: id % num_cpu,
            thread_num: num_thread,
            cpu_num: num_cpu,
            experiment: experiment.to_string(),
            ..Default::default()
        }
    }
}
