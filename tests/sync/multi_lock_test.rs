/*!
 * Multi-Lock Tests
 * Partitioned and shared locking across threads
 */

use kvlock::shm::OpenRetry;
use kvlock::{LockError, LockMode, LockTarget, MultiLock, OpenSpec, Slot};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn open(dir: &tempfile::TempDir, mode: LockMode, count: usize) -> MultiLock {
    let (lock, _) = MultiLock::open(
        &dir.path().join("db._int_"),
        0,
        OpenSpec::Checked { mode, count },
        0o666,
        OpenRetry {
            attempts: 2,
            delay: Duration::from_millis(5),
        },
    )
    .unwrap();
    lock
}

#[test]
fn test_unlock_any_releases_each_held_partition_once() {
    let dir = tempfile::tempdir().unwrap();
    let lock = open(&dir, LockMode::Partitioned, 128);
    assert_eq!(lock.part_count(), 128);

    lock.lock(LockTarget::Partition(5), true).unwrap();
    lock.lock(LockTarget::Partition(7), true).unwrap();
    assert_eq!(lock.local_part_count(), 2);

    lock.unlock(LockTarget::Any).unwrap();
    lock.unlock(LockTarget::Any).unwrap();
    assert_eq!(lock.local_part_count(), 0);
    assert_eq!(lock.local_count(Slot::Partition(5)).unwrap(), 0);
    assert_eq!(lock.local_count(Slot::Partition(7)).unwrap(), 0);

    let err = lock.unlock(LockTarget::Any).unwrap_err();
    assert!(err.is_not_owner());
}

#[test]
fn test_exclusive_excludes_every_partition() {
    let dir = tempfile::tempdir().unwrap();
    let lock = Arc::new(open(&dir, LockMode::Partitioned, 16));
    lock.lock(LockTarget::Exclusive, true).unwrap();
    assert_eq!(lock.locked_part_count(), 16);

    let probe = Arc::clone(&lock);
    let blocked = thread::spawn(move || {
        (0..16)
            .map(|p| probe.lock(LockTarget::Partition(p), false))
            .filter(|r| matches!(r, Err(LockError::WouldBlock { .. })))
            .count()
    })
    .join()
    .unwrap();
    assert_eq!(blocked, 16);

    // a blocking waiter proceeds only after the full release
    let (tx, rx) = mpsc::channel();
    let waiter = Arc::clone(&lock);
    let handle = thread::spawn(move || {
        waiter.lock(LockTarget::Partition(3), true).unwrap();
        tx.send(()).unwrap();
        waiter.unlock(LockTarget::Partition(3)).unwrap();
    });
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

    lock.unlock(LockTarget::Exclusive).unwrap();
    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    handle.join().unwrap();
    assert_eq!(lock.locked_part_count(), 0);
}

#[test]
fn test_readers_share_writers_exclude() {
    let dir = tempfile::tempdir().unwrap();
    let lock = Arc::new(open(&dir, LockMode::Shared, 4));

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                lock.lock(LockTarget::Any, false).map(|_| {
                    thread::sleep(Duration::from_millis(50));
                    lock.unlock(LockTarget::Any).unwrap();
                })
            })
        })
        .collect();

    let mut acquired = 0;
    for reader in readers {
        if reader.join().unwrap().is_ok() {
            acquired += 1;
        }
    }
    assert_eq!(acquired, 4);

    lock.lock(LockTarget::Exclusive, true).unwrap();
    let other = Arc::clone(&lock);
    let reader_blocked = thread::spawn(move || {
        other.lock(LockTarget::Any, false).unwrap_err().is_would_block()
    })
    .join()
    .unwrap();
    assert!(reader_blocked);
    lock.unlock(LockTarget::Exclusive).unwrap();
}

#[test]
fn test_reader_yields_to_pending_writer() {
    let dir = tempfile::tempdir().unwrap();
    let lock = Arc::new(open(&dir, LockMode::Shared, 4));

    // the exclusive slot alone is held; every reader slot is still free
    lock.lock_file().lock(0, true).unwrap();
    assert_eq!(lock.locked_part_count(), 0);

    let other = Arc::clone(&lock);
    let reader_blocked = thread::spawn(move || {
        other.lock(LockTarget::Any, false).unwrap_err().is_would_block()
    })
    .join()
    .unwrap();
    assert!(reader_blocked);

    let (tx, rx) = mpsc::channel();
    let waiter = Arc::clone(&lock);
    let handle = thread::spawn(move || {
        waiter.lock(LockTarget::Any, true).unwrap();
        tx.send(waiter.local_part_count()).unwrap();
        waiter.unlock(LockTarget::Any).unwrap();
    });
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

    lock.lock_file().unlock(0).unwrap();
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
    handle.join().unwrap();
    assert_eq!(lock.locked_part_count(), 0);
}

#[test]
fn test_unchecked_open_sees_consistent_configuration_during_resizes() {
    let dir = tempfile::tempdir().unwrap();
    let mut resizer = open(&dir, LockMode::Partitioned, 16);
    let path = resizer.path().to_path_buf();
    let done = AtomicBool::new(false);

    let opens = thread::scope(|scope| {
        let done = &done;
        scope.spawn(move || {
            for round in 0..300 {
                let spec = if round % 2 == 0 {
                    OpenSpec::Checked {
                        mode: LockMode::Single,
                        count: 0,
                    }
                } else {
                    OpenSpec::Checked {
                        mode: LockMode::Partitioned,
                        count: 16,
                    }
                };
                resizer.expand(spec).unwrap();
            }
            done.store(true, Ordering::SeqCst);
        });

        let follower = scope.spawn(|| {
            let mut opens = 0;
            loop {
                let (lock, _) =
                    MultiLock::open(&path, 0, OpenSpec::Unchecked, 0o666, OpenRetry::default())
                        .unwrap();
                match lock.mode() {
                    LockMode::Single => {
                        assert_eq!((lock.part_count(), lock.num_locks()), (0, 1));
                    }
                    mode => {
                        assert_eq!(mode, LockMode::Partitioned);
                        assert_eq!((lock.part_count(), lock.num_locks()), (16, 17));
                    }
                }
                opens += 1;
                if done.load(Ordering::SeqCst) {
                    break opens;
                }
            }
        });
        follower.join().unwrap()
    });
    assert!(opens > 0);
}

#[test]
fn test_upgrade_and_downgrade() {
    let dir = tempfile::tempdir().unwrap();
    let lock = open(&dir, LockMode::Shared, 4);

    lock.lock(LockTarget::Any, true).unwrap();
    lock.upgrade(true).unwrap();
    assert_eq!(lock.local_count(Slot::Exclusive).unwrap(), 1);
    assert_eq!(lock.locked_part_count(), 4);

    lock.unlock(LockTarget::Exclusive).unwrap();
    lock.unlock(LockTarget::Any).unwrap();
    assert_eq!(lock.local_count_total(), 0);

    lock.lock(LockTarget::Exclusive, true).unwrap();
    lock.downgrade(Some(2), true).unwrap();
    assert_eq!(lock.local_count(Slot::Exclusive).unwrap(), 0);
    assert_eq!(lock.local_count(Slot::Partition(2)).unwrap(), 1);
    lock.unlock(LockTarget::Any).unwrap();
}

#[test]
fn test_snapshot_serializes() {
    let dir = tempfile::tempdir().unwrap();
    let lock = open(&dir, LockMode::Partitioned, 8);
    lock.lock(LockTarget::Partition(6), true).unwrap();

    let snapshot = lock.snapshot();
    assert_eq!(snapshot.locked_slots(), 1);
    let json = serde_json::to_string(&snapshot).unwrap();
    assert!(json.contains("\"mode\":\"partitioned\""));
    lock.unlock(LockTarget::Partition(6)).unwrap();
}
