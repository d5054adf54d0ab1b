use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use strum::IntoEnumIterator;
use tracing::info;

use crate::{
    benchmark::{counter_job::one_three_benchmark, read_mostly::read_mostly_benchmark},
    command_parser::{experiment::Experiment, lock_target::LockTarget},
    counter_lock::{BenchmarkType, CounterLock},
};

pub struct Bencher<'a> {
    num_cpu: usize,
    num_thread: usize,
    experiment: Option<Experiment>,
    targets: Vec<LockTarget>,
    output_path: &'a Path,
    duration: u64,
    verbose: bool,
}

impl<'a> Bencher<'a> {
    pub fn new(
        num_cpu: usize,
        num_thread: usize,
        experiment: Option<Experiment>,
        targets: Vec<LockTarget>,
        output_path: &'a Path,
        duration: u64,
        verbose: bool,
    ) -> Self {
        Self {
            num_cpu,
            num_thread,
            experiment,
            targets,
            output_path,
            duration,
            verbose,
        }
    }

    pub fn benchmark(&self) -> Result<()> {
        let experiments = match self.experiment {
            Some(e) => vec![e],
            None => Experiment::iter().collect(),
        };

        for experiment in experiments {
            let job: fn(LockBenchInfo) -> Result<()> = match experiment {
                Experiment::CounterRatioOneThree => one_three_benchmark,
                Experiment::ReadMostly => read_mostly_benchmark,
            };

            for target in self.targets.iter().copied() {
                let lock_type = Arc::new(target.to_locktype());
                job(LockBenchInfo {
                    lock_type: lock_type.clone(),
                    target,
                    num_thread: self.num_thread,
                    num_cpu: self.num_cpu,
                    experiment,
                    duration: self.duration,
                    output_path: self.output_path,
                    verbose: self.verbose,
                })
                .with_context(|| format!("{} failed on {}", experiment, lock_type.name()))?;
            }
            info!(%experiment, "experiment finished");
        }
        Ok(())
    }
}

pub struct LockBenchInfo<'a> {
    pub lock_type: Arc<BenchmarkType>,
    pub target: LockTarget,
    pub num_thread: usize,
    pub num_cpu: usize,
    pub experiment: Experiment,
    pub duration: u64,
    pub output_path: &'a Path,
    pub verbose: bool,
}

impl LockBenchInfo<'_> {
    pub fn output_file(&self) -> PathBuf {
        self.output_path.join(format!(
            "{}-{}-t{}-c{}.csv",
            self.experiment, self.target, self.num_thread, self.num_cpu
        ))
    }
}
