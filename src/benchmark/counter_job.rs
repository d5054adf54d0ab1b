use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use anyhow::{ensure, Result};
use quanta::Clock;
use tracing::{debug, info};

use crate::counter_lock::CounterLock;

use super::{
    bencher::LockBenchInfo,
    helper::{run_workers, write_records},
    Record,
};

pub fn one_three_benchmark(info: LockBenchInfo) -> Result<()> {
    let results = run_workers(&info, |id, stop| thread_job(id, stop, &info))?;

    write_records(&info, &results)?;

    let total_count: u64 = results.iter().map(|r| r.loop_count).sum();
    let counter = info.lock_type.observe()?;

    ensure!(
        counter == total_count,
        "Total counter is not matched with lock value {}, but thread local loop sum {}",
        counter,
        total_count
    );

    info!(
        lock = %info.lock_type.name(),
        total_count,
        "finished one-three counter"
    );
    Ok(())
}

fn thread_job(id: usize, stop: &AtomicBool, info: &LockBenchInfo) -> Result<Record> {
    let single_iter_duration: Duration = Duration::from_micros({
        if id % 2 == 0 {
            10
        } else {
            30
        }
    });
    let timer = Clock::new();

    let mut record = Record::new(id, info.num_cpu, info.num_thread, info.experiment);

    while !stop.load(Ordering::Acquire) {
        info.lock_type.update(&mut |value| {
            record.num_acquire += 1;
            let begin = timer.now();

            while timer.now() - begin < single_iter_duration {
                *value += 1;
                record.loop_count += 1;
            }
            record.hold_time += timer.now().duration_since(begin);
        })?;
    }

    if info.verbose {
        debug!(id, loop_count = record.loop_count, "thread finished");
    }
    record.locktype = info.lock_type.name();
    Ok(record)
}
