/*!
 * Cross-Process Tests
 * Lock files shared between forked processes
 */

use kvlock::shm::{Geometry, LockFile, OpenRetry};
use kvlock::{LockMode, LockStatus, LockTarget, MultiLock, OpenSpec, Slot};
use pretty_assertions::assert_eq;
use serial_test::serial;
use std::path::Path;
use std::time::Duration;

fn retry() -> OpenRetry {
    OpenRetry {
        attempts: 50,
        delay: Duration::from_millis(10),
    }
}

/// Run `child` in a forked process and return the pid
fn spawn(child: impl FnOnce() -> i32) -> libc::pid_t {
    // SAFETY: the child runs `child` and leaves through _exit without
    // unwinding into the test harness
    unsafe {
        match libc::fork() {
            -1 => panic!("fork failed: {}", std::io::Error::last_os_error()),
            0 => {
                let code = std::panic::catch_unwind(std::panic::AssertUnwindSafe(child))
                    .unwrap_or(101);
                libc::_exit(code)
            }
            pid => pid,
        }
    }
}

/// Wait for `pid` and return its exit code
fn wait(pid: libc::pid_t) -> i32 {
    let mut status = 0;
    // SAFETY: pid is a child of this process
    let rc = unsafe { libc::waitpid(pid, &mut status, 0) };
    assert_eq!(rc, pid);
    assert!(libc::WIFEXITED(status), "child did not exit normally");
    libc::WEXITSTATUS(status)
}

fn exact(mutexes: usize) -> Geometry {
    Geometry::Exact {
        registers: 3,
        mutexes,
    }
}

#[test]
#[serial]
fn test_owner_death_reported_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("died._int_");
    let (file, _) = LockFile::open(&path, exact(2), 0o666, retry()).unwrap();

    let child_path = path.clone();
    let pid = spawn(move || {
        let Ok((file, _)) = LockFile::open(&child_path, exact(2), 0o666, retry()) else {
            return 2;
        };
        if file.lock(1, true).is_err() {
            return 3;
        }
        // exit holding the lock
        std::mem::forget(file);
        0
    });
    assert_eq!(wait(pid), 0);

    assert_eq!(file.lock(1, true).unwrap(), LockStatus::OwnerDied);
    file.unlock(1).unwrap();
    assert_eq!(file.lock(1, true).unwrap(), LockStatus::Acquired);
    file.unlock(1).unwrap();

    // a later process sees an ordinary lock
    let child_path = path.clone();
    let pid = spawn(move || match LockFile::open(&child_path, exact(2), 0o666, retry()) {
        Ok((file, _)) => match file.lock(1, true) {
            Ok(LockStatus::Acquired) => 0,
            Ok(LockStatus::OwnerDied) => 4,
            Err(_) => 5,
        },
        Err(_) => 2,
    });
    assert_eq!(wait(pid), 0);
}

#[test]
#[serial]
fn test_exactly_one_creator() {
    const CHILDREN: usize = 8;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("race._int_");

    let pids: Vec<_> = (0..CHILDREN)
        .map(|_| {
            let path = path.clone();
            spawn(move || match LockFile::open(&path, exact(4), 0o666, retry()) {
                Ok((_, true)) => 1,
                Ok((_, false)) => 0,
                Err(_) => 2,
            })
        })
        .collect();

    let codes: Vec<i32> = pids.into_iter().map(wait).collect();
    assert!(codes.iter().all(|c| *c <= 1), "open failed: {:?}", codes);
    assert_eq!(codes.iter().sum::<i32>(), 1);

    let (file, created) = LockFile::open(&path, exact(4), 0o666, retry()).unwrap();
    assert!(!created);
    assert_eq!(file.snapshot().mutex_initialized, 4);
}

fn open_partitioned(path: &Path, count: usize) -> kvlock::LockResult<(MultiLock, bool)> {
    MultiLock::open(
        path,
        1,
        OpenSpec::Checked {
            mode: LockMode::Partitioned,
            count,
        },
        0o666,
        retry(),
    )
}

#[test]
#[serial]
fn test_expansion_seen_by_new_process() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("grow._int_");
    let (mut lock, created) = open_partitioned(&path, 4).unwrap();
    assert!(created);

    lock.expand(OpenSpec::Checked {
        mode: LockMode::Partitioned,
        count: 16,
    })
    .unwrap();
    lock.lock(LockTarget::Partition(15), true).unwrap();

    let child_path = path.clone();
    let pid = spawn(move || {
        let Ok((lock, false)) = open_partitioned(&child_path, 16) else {
            return 2;
        };
        if lock.part_count() != 16 {
            return 3;
        }
        let busy = matches!(lock.lock(LockTarget::Partition(15), false), Err(e) if e.is_would_block());
        let free = lock.lock(LockTarget::Partition(14), false).is_ok();
        if busy && free {
            0
        } else {
            4
        }
    });
    assert_eq!(wait(pid), 0);
    lock.unlock(LockTarget::Partition(15)).unwrap();

    // the old geometry no longer matches
    assert!(open_partitioned(&path, 4).unwrap_err().is_config_mismatch());
}

#[test]
#[serial]
fn test_forked_child_starts_without_parent_holds() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fork._int_");
    let (lock, _) = open_partitioned(&path, 8).unwrap();
    lock.lock(LockTarget::Partition(2), true).unwrap();
    assert_eq!(lock.local_count_total(), 1);

    let pid = spawn(|| {
        if lock.local_count_total() != 0 || lock.local_part_count() != 0 {
            return 2;
        }
        if !matches!(lock.local_count(Slot::Partition(2)), Ok(0)) {
            return 3;
        }
        // the parent still holds the partition
        if !matches!(lock.lock(LockTarget::Partition(2), false), Err(e) if e.is_would_block()) {
            return 4;
        }
        match lock.unlock(LockTarget::Any) {
            Err(e) if e.is_not_owner() => 0,
            _ => 5,
        }
    });
    assert_eq!(wait(pid), 0);

    assert_eq!(lock.local_part_count(), 1);
    lock.unlock(LockTarget::Any).unwrap();
    assert_eq!(lock.locked_part_count(), 0);
}

#[test]
#[serial]
fn test_exclusive_reports_dead_partition_holder_after_full_hold() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dead-part._int_");
    let (lock, _) = open_partitioned(&path, 8).unwrap();

    let child_path = path.clone();
    let pid = spawn(move || {
        let Ok((lock, false)) = open_partitioned(&child_path, 8) else {
            return 2;
        };
        if lock.lock(LockTarget::Partition(5), true).is_err() {
            return 3;
        }
        // exit holding the partition
        std::mem::forget(lock);
        0
    });
    assert_eq!(wait(pid), 0);

    assert_eq!(lock.lock(LockTarget::Exclusive, true).unwrap(), LockStatus::OwnerDied);
    assert_eq!(lock.locked_part_count(), 8);
    assert_eq!(lock.local_part_count(), 8);
    assert_eq!(lock.local_count(Slot::Exclusive).unwrap(), 1);
    lock.unlock(LockTarget::Exclusive).unwrap();
    assert_eq!(lock.locked_part_count(), 0);

    assert_eq!(lock.lock(LockTarget::Exclusive, true).unwrap(), LockStatus::Acquired);
    lock.unlock(LockTarget::Exclusive).unwrap();
}
