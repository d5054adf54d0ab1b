//! Producers and consumers sharing a bounded counter behind a
//! `ReentrantLock` and two conditions, then a stamped-lock point read with
//! an optimistic stamp.

use std::{
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
    thread,
};

use libqsync::{ReentrantLock, StampedLock, SyncError};

const CAPACITY: usize = 4;
const ITEMS: usize = 1000;

fn bounded_counter() -> Result<(), SyncError> {
    let lock = ReentrantLock::new();
    let not_full = lock.new_condition();
    let not_empty = lock.new_condition();
    let queued = AtomicUsize::new(0);
    let consumed = AtomicUsize::new(0);

    thread::scope(|s| {
        let producer = s.spawn(|| -> Result<(), SyncError> {
            for _ in 0..ITEMS {
                let _guard = lock.guard()?;
                while queued.load(Ordering::Relaxed) == CAPACITY {
                    not_full.wait()?;
                }
                queued.fetch_add(1, Ordering::Relaxed);
                not_empty.signal()?;
            }
            Ok(())
        });
        let consumer = s.spawn(|| -> Result<(), SyncError> {
            for _ in 0..ITEMS {
                let _guard = lock.guard()?;
                while queued.load(Ordering::Relaxed) == 0 {
                    not_empty.wait()?;
                }
                queued.fetch_sub(1, Ordering::Relaxed);
                consumed.fetch_add(1, Ordering::Relaxed);
                not_full.signal()?;
            }
            Ok(())
        });
        producer.join().expect("producer panicked")?;
        consumer.join().expect("consumer panicked")
    })?;

    println!(
        "consumed {} items, {} left queued",
        consumed.load(Ordering::Relaxed),
        queued.load(Ordering::Relaxed)
    );
    Ok(())
}

fn stamped_point() -> Result<(), SyncError> {
    let lock = StampedLock::new();
    let (x, y) = (AtomicU64::new(0), AtomicU64::new(0));

    thread::scope(|s| {
        s.spawn(|| {
            for i in 1..=1000 {
                let stamp = lock.write_lock();
                x.store(i, Ordering::Relaxed);
                y.store(i, Ordering::Relaxed);
                lock.unlock_write(stamp).expect("stamp came from write_lock");
            }
        });

        let mut optimistic = 0;
        for _ in 0..1000 {
            let (a, b) = match lock.try_optimistic_read() {
                Some(stamp) => {
                    let point = (x.load(Ordering::Relaxed), y.load(Ordering::Relaxed));
                    if lock.validate(stamp) {
                        optimistic += 1;
                        point
                    } else {
                        let stamp = lock.read_lock();
                        let point = (x.load(Ordering::Relaxed), y.load(Ordering::Relaxed));
                        lock.unlock_read(stamp)?;
                        point
                    }
                }
                None => {
                    let stamp = lock.read_lock();
                    let point = (x.load(Ordering::Relaxed), y.load(Ordering::Relaxed));
                    lock.unlock_read(stamp)?;
                    point
                }
            };
            assert_eq!(a, b);
        }
        println!("{} of 1000 reads stayed optimistic", optimistic);
        Ok(())
    })
}

fn main() -> Result<(), SyncError> {
    bounded_counter()?;
    stamped_point()
}
