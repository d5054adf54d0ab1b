use std::{
    fs::File,
    os::unix::prelude::PermissionsExt,
    path::Path,
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use csv::Writer;
use tracing::debug;

use super::{bencher::LockBenchInfo, Record};

pub fn create_writer(path: &Path) -> Result<Writer<File>, std::io::Error> {
    let f = File::create(path)?;
    let metadata = f.metadata()?;
    let mut permissions = metadata.permissions();

    permissions.set_mode(0o664);
    f.set_permissions(permissions)?;
    Ok(Writer::from_writer(f))
}

/// Spawns `info.num_thread` pinned workers, lets them run for
/// `info.duration` seconds and collects their records.
pub fn run_workers<F>(info: &LockBenchInfo, job: F) -> Result<Vec<Record>>
where
    F: Fn(usize, &AtomicBool) -> Result<Record> + Sync,
{
    let stop = AtomicBool::new(false);

    thread::scope(|s| {
        let mut handles = Vec::with_capacity(info.num_thread);
        for id in 0..info.num_thread {
            let (job, stop) = (&job, &stop);
            let spawned = thread::Builder::new()
                .name(format!("Thread {}", id))
                .spawn_scoped(s, move || {
                    let core = core_affinity::CoreId {
                        id: id % info.num_cpu,
                    };
                    if !core_affinity::set_for_current(core) {
                        debug!(id, cpu = core.id, "failed to pin thread");
                    }
                    job(id, stop)
                });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    stop.store(true, Ordering::Release);
                    return Err(e).context("failed to spawn benchmark thread");
                }
            }
        }

        thread::sleep(Duration::from_secs(info.duration));
        stop.store(true, Ordering::Release);

        handles
            .into_iter()
            .enumerate()
            .map(|(id, handle)| {
                handle
                    .join()
                    .map_err(|_| anyhow!("benchmark thread {} panicked", id))?
            })
            .collect()
    })
}

pub fn write_records(info: &LockBenchInfo, records: &[Record]) -> Result<()> {
    let path = info.output_file();
    let mut writer =
        create_writer(&path).with_context(|| format!("failed to create {}", path.display()))?;
    for record in records {
        writer.serialize(record)?;
    }
    writer.flush()?;
    Ok(())
}
