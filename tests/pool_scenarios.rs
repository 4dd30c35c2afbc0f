//! End-to-end pool scenarios: borrowing, waiting, shutdown, eviction.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use cistern::testing::MemoryDriver;
use cistern::{DataSource, PoolConfig, PoolError};

fn datasource(driver: &MemoryDriver, config: PoolConfig) -> DataSource {
    DataSource::new("scenario", config, Arc::new(driver.clone())).unwrap()
}

#[test]
fn borrow_timeout_fails_at_the_deadline_without_leaking() {
    let driver = MemoryDriver::new();
    let ds = datasource(
        &driver,
        PoolConfig::new("memory:s2")
            .with_pool_size(1)
            .with_borrow_timeout(Duration::from_millis(100)),
    );

    let held = ds.get_connection().unwrap();

    let contender = {
        let ds = ds.clone();
        thread::spawn(move || {
            let started = Instant::now();
            let result = ds.get_connection().map(drop);
            (result, started.elapsed())
        })
    };
    let (result, waited) = contender.join().unwrap();

    assert!(matches!(result, Err(PoolError::BorrowTimeout)));
    assert!(
        waited >= Duration::from_millis(80),
        "gave up too early: {waited:?}"
    );
    assert!(
        waited < Duration::from_secs(2),
        "gave up too late: {waited:?}"
    );

    drop(held);
    assert_eq!(ds.stats().open_connections, 1);
    assert_eq!(ds.stats().idle_connections, 1);
}

#[test]
fn shutdown_wakes_blocked_borrowers() {
    let driver = MemoryDriver::new();
    let ds = datasource(
        &driver,
        PoolConfig::new("memory:s3")
            .with_pool_size(1)
            .with_borrow_timeout(Duration::from_secs(10)),
    );

    let held = ds.get_connection().unwrap();

    let blocked = {
        let ds = ds.clone();
        thread::spawn(move || {
            let started = Instant::now();
            let result = ds.get_connection().map(drop);
            (result, started.elapsed())
        })
    };

    // Give the contender time to enter the wait.
    thread::sleep(Duration::from_millis(50));
    ds.close();

    let (result, waited) = blocked.join().unwrap();
    assert!(matches!(result, Err(PoolError::Closed)));
    assert!(
        waited < Duration::from_secs(5),
        "close did not wake the borrower promptly: {waited:?}"
    );

    // The held connection is destroyed on its eventual release.
    assert_eq!(driver.closed_count(), 0);
    drop(held);
    assert_eq!(driver.closed_count(), 1);
}

#[test]
fn idle_sweep_destroys_stale_connections() {
    let driver = MemoryDriver::new();
    let ds = datasource(
        &driver,
        PoolConfig::new("memory:s6")
            .with_pool_size(3)
            .with_keep_alive(Duration::from_secs(1)),
    );

    let a = ds.get_connection().unwrap();
    let b = ds.get_connection().unwrap();
    let c = ds.get_connection().unwrap();
    assert_eq!(driver.opened(), 3);
    drop(a);
    drop(b);
    drop(c);

    thread::sleep(Duration::from_millis(1500));

    let fresh = ds.get_connection().unwrap();
    assert_eq!(driver.closed_count(), 3, "stale connections not swept");
    assert_eq!(driver.opened(), 4, "expected a fresh connection");
    assert_eq!(ds.stats().open_connections, 1);
    drop(fresh);
}

#[test]
fn capacity_is_never_exceeded_under_contention() {
    let pool_size = 3;
    let driver = MemoryDriver::new();
    let ds = datasource(
        &driver,
        PoolConfig::new("memory:stress")
            .with_pool_size(pool_size)
            .with_borrow_timeout(Duration::from_secs(10)),
    );

    let workers: Vec<_> = (0..8)
        .map(|w| {
            let ds = ds.clone();
            thread::spawn(move || {
                for i in 0..50 {
                    let conn = ds.get_connection().unwrap();
                    conn.execute(&format!("work {w}:{i}")).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    // With no eviction in play, every open connection is still alive.
    assert!(driver.opened() <= pool_size);
    assert_eq!(ds.stats().open_connections, driver.opened());
    assert_eq!(ds.stats().idle_connections as u32, driver.opened());
}

#[test]
fn handles_can_cross_threads() {
    let driver = MemoryDriver::new();
    let ds = datasource(&driver, PoolConfig::new("memory:move"));

    let conn = ds.get_connection().unwrap();
    let handle = thread::spawn(move || {
        conn.execute("from another thread").unwrap();
        drop(conn);
    });
    handle.join().unwrap();

    assert_eq!(ds.stats().idle_connections, 1);
}
