use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{ensure, Result};
use quanta::Clock;
use tracing::{debug, info};

use crate::counter_lock::CounterLock;

use super::{
    bencher::LockBenchInfo,
    helper::{run_workers, write_records},
    Record,
};

const WRITE_EVERY: u64 = 10;

pub fn read_mostly_benchmark(info: LockBenchInfo) -> Result<()> {
    let results = run_workers(&info, |id, stop| thread_job(id, stop, &info))?;

    write_records(&info, &results)?;

    let total_count: u64 = results.iter().map(|r| r.loop_count).sum();
    let total_observe: u64 = results.iter().map(|r| r.num_observe).sum();
    let counter = info.lock_type.observe()?;

    ensure!(
        counter == total_count,
        "counter holds {} after {} increments",
        counter,
        total_count
    );

    info!(
        lock = %info.lock_type.name(),
        total_count,
        total_observe,
        "finished read-mostly counter"
    );
    Ok(())
}

fn thread_job(id: usize, stop: &AtomicBool, info: &LockBenchInfo) -> Result<Record> {
    let timer = Clock::new();

    let mut record = Record::new(id, info.num_cpu, info.num_thread, info.experiment);
    let mut last_seen = 0u64;

    while !stop.load(Ordering::Acquire) {
        let begin = timer.now();
        if (record.num_acquire + id as u64) % WRITE_EVERY == 0 {
            info.lock_type.update(&mut |value| *value += 1)?;
            record.loop_count += 1;
        } else {
            let seen = info.lock_type.observe()?;
            // increments never go back
            ensure!(seen >= last_seen, "read {} after {}", seen, last_seen);
            last_seen = seen;
            record.num_observe += 1;
        }
        record.num_acquire += 1;
        record.hold_time += timer.now().duration_since(begin);
    }

    if info.verbose {
        debug!(id, reads = record.num_observe, writes = record.loop_count, "thread finished");
    }
    record.locktype = info.lock_type.name();
    Ok(record)
}
