/*!
 * Lock File Tests
 * Several handles on one lock file within a process
 */

use kvlock::shm::{Geometry, LockFile, OpenRetry};
use kvlock::{LockError, LockStatus};
use pretty_assertions::assert_eq;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

fn retry() -> OpenRetry {
    OpenRetry {
        attempts: 2,
        delay: Duration::from_millis(5),
    }
}

fn exact(registers: usize, mutexes: usize) -> Geometry {
    Geometry::Exact { registers, mutexes }
}

fn lock_path(dir: &tempfile::TempDir) -> PathBuf {
    dir.path().join("db._int_")
}

#[test]
fn test_configuration_skew_then_unchecked_adoption() {
    let dir = tempfile::tempdir().unwrap();
    let path = lock_path(&dir);
    let (_owner, created) = LockFile::open(&path, exact(3, 4), 0o666, retry()).unwrap();
    assert!(created);

    let err = LockFile::open(&path, exact(3, 3), 0o666, retry()).unwrap_err();
    assert!(matches!(
        err,
        LockError::MutexCountMismatch {
            found: 4,
            expected: 3,
            ..
        }
    ));
    assert!(err.is_config_mismatch());
    assert_eq!(err.path(), Some(path.as_path()));

    let (adopted, created) = LockFile::open(&path, Geometry::Unchecked, 0o666, retry()).unwrap();
    assert!(!created);
    assert_eq!(adopted.header_counts(), (3, 4));
    assert_eq!(adopted.mutex_count(), 4);
}

#[test]
fn test_handles_share_mutex_state() {
    let dir = tempfile::tempdir().unwrap();
    let path = lock_path(&dir);
    let (a, _) = LockFile::open(&path, exact(0, 2), 0o666, retry()).unwrap();
    let (b, _) = LockFile::open(&path, exact(0, 2), 0o666, retry()).unwrap();

    a.lock(1, true).unwrap();
    assert_eq!(b.lock_count(1).unwrap(), 1);
    assert_eq!(b.owner_id(1).unwrap(), a.owner_id(1).unwrap());
    // same thread through another mapping nests
    assert_eq!(b.lock(1, false).unwrap(), LockStatus::Acquired);
    assert_eq!(a.local_count(1).unwrap(), 2);
    b.unlock(1).unwrap();
    a.unlock(1).unwrap();
    assert_eq!(b.owner_id(1).unwrap(), 0);
}

#[test]
fn test_other_thread_sees_would_block() {
    let dir = tempfile::tempdir().unwrap();
    let path = lock_path(&dir);
    let (file, _) = LockFile::open(&path, exact(0, 1), 0o666, retry()).unwrap();
    let file = Arc::new(file);

    file.lock(0, true).unwrap();
    let other = Arc::clone(&file);
    let outcome = std::thread::spawn(move || {
        let busy = other.lock(0, false).unwrap_err().is_would_block();
        let not_owner = other.unlock(0).unwrap_err().is_not_owner();
        (busy, not_owner, other.local_count(0).unwrap())
    })
    .join()
    .unwrap();
    assert_eq!(outcome, (true, true, 0));
    file.unlock(0).unwrap();
}

#[test]
fn test_expand_then_fresh_open() {
    let dir = tempfile::tempdir().unwrap();
    let path = lock_path(&dir);
    let (mut grower, _) = LockFile::open(&path, exact(3, 2), 0o666, retry()).unwrap();
    let (stale, _) = LockFile::open(&path, exact(3, 2), 0o666, retry()).unwrap();

    grower.lock(0, true).unwrap();
    assert!(matches!(grower.expand(Some(6)), Err(LockError::Busy { .. })));
    grower.unlock(0).unwrap();
    grower.expand(Some(6)).unwrap();

    assert!(matches!(stale.check_header(), Err(LockError::Stale { .. })));

    let (fresh, created) = LockFile::open(&path, exact(3, 6), 0o666, retry()).unwrap();
    assert!(!created);
    let snapshot = fresh.snapshot();
    assert_eq!(snapshot.mutex_count, 6);
    assert_eq!(snapshot.mutex_initialized, 6);
    for index in 0..6 {
        assert_eq!(fresh.lock(index, false).unwrap(), LockStatus::Acquired);
        fresh.unlock(index).unwrap();
    }
}
