use core_affinity::*;
use criterion::measurement::WallTime;
use criterion::BenchmarkGroup;
use criterion::BenchmarkId;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::{sync::Arc, thread::*};

extern crate libqsync;

use libqsync::{Fairness, QueuedMutex, ReentrantLock, ReentrantRwLock, StampedLock};

const ITERATION: u64 = 1000;
const THREAD_CPU_RATIO: usize = 1;

/// Runs a closure with the lock held exclusively.
trait BenchLock: Send + Sync + 'static {
    fn with_lock(&self, f: &mut dyn FnMut());
}

impl BenchLock for ReentrantLock {
    fn with_lock(&self, f: &mut dyn FnMut()) {
        self.lock().unwrap();
        f();
        self.unlock().unwrap();
    }
}

impl BenchLock for ReentrantRwLock {
    fn with_lock(&self, f: &mut dyn FnMut()) {
        let _guard = self.write().guard().unwrap();
        f();
    }
}

impl BenchLock for StampedLock {
    fn with_lock(&self, f: &mut dyn FnMut()) {
        let stamp = self.write_lock();
        f();
        self.unlock_write(stamp).unwrap();
    }
}

impl BenchLock for QueuedMutex<()> {
    fn with_lock(&self, f: &mut dyn FnMut()) {
        let _guard = self.lock();
        f();
    }
}

impl BenchLock for Mutex<()> {
    fn with_lock(&self, f: &mut dyn FnMut()) {
        let _guard = self.lock().unwrap();
        f();
    }
}

pub fn lock_bench(bencher: &mut Criterion) {
    let cpu_count = available_parallelism().unwrap().get();

    let mut group = bencher.benchmark_group("Queued Locks");

    for i in [2, 4, 8].iter() {
        let thread = i * THREAD_CPU_RATIO;
        bench_inner(Arc::new(ReentrantLock::new()), "reentrant", &mut group, cpu_count, thread);
        bench_inner(
            Arc::new(ReentrantLock::with_fairness(Fairness::Fair)),
            "reentrant fair",
            &mut group,
            cpu_count,
            thread,
        );
        bench_inner(Arc::new(ReentrantRwLock::new()), "rwlock", &mut group, cpu_count, thread);
        bench_inner(Arc::new(StampedLock::new()), "stamped", &mut group, cpu_count, thread);
        bench_inner(Arc::new(QueuedMutex::new(())), "queued mutex", &mut group, cpu_count, thread);
        bench_inner(Arc::new(Mutex::new(())), "std mutex", &mut group, cpu_count, thread);
    }

    group.finish();
}

#[inline]
fn bench_inner<L: BenchLock>(
    lock: Arc<L>,
    name: &str,
    bencher: &mut BenchmarkGroup<WallTime>,
    cpu_count: usize,
    thread_count: usize,
) {
    bencher.bench_with_input(BenchmarkId::new(name, thread_count), &cpu_count, |b, _i| {
        b.iter(|| {
            let counter = Arc::new(AtomicU64::new(0));
            black_box(cooperative_counter(
                lock.clone(),
                counter.clone(),
                cpu_count,
                thread_count,
                ITERATION,
            ));

            assert_eq!(ITERATION, counter.load(Ordering::Relaxed));
        });
    });
}

fn cooperative_counter<L: BenchLock>(
    lock: Arc<L>,
    counter: Arc<AtomicU64>,
    cpu_count: usize,
    thread_count: usize,
    threshold: u64,
) {
    let res = (0..thread_count)
        .map(|id| {
            let lock = lock.clone();
            let counter = counter.clone();
            Builder::new()
                .name(id.to_string())
                .spawn(move || {
                    set_for_current(CoreId {
                        id: (id % cpu_count),
                    });
                    let mut now_value = 0;
                    while now_value < threshold {
                        lock.with_lock(&mut || {
                            now_value = counter.load(Ordering::Relaxed);
                            if now_value >= threshold {
                                return;
                            }
                            counter.store(now_value + 1, Ordering::Relaxed);
                        })
                    }
                })
                .unwrap()
        })
        .collect::<Vec<_>>();

    for thread in res {
        thread.join().unwrap();
    }
}

criterion_group!(benches, lock_bench);

criterion_main!(benches);
