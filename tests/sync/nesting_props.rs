/*!
 * Nesting Properties
 * Random lock/unlock sequences against a counting model
 */

use kvlock::shm::OpenRetry;
use kvlock::{LockMode, LockTarget, MultiLock, OpenSpec, Slot};
use proptest::prelude::*;
use std::time::Duration;

const PARTS: usize = 4;

#[derive(Debug, Clone, Copy)]
enum Op {
    Lock(usize),
    Unlock(usize),
    LockExclusive,
    UnlockExclusive,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..PARTS).prop_map(Op::Lock),
        3 => (0..PARTS).prop_map(Op::Unlock),
        1 => Just(Op::LockExclusive),
        1 => Just(Op::UnlockExclusive),
    ]
}

#[derive(Default)]
struct Model {
    parts: [i32; PARTS],
    exclusive: i32,
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Local counts track net acquisitions; releasing below zero is refused
    #[test]
    fn local_counts_follow_net_locks(ops in prop::collection::vec(op(), 1..40)) {
        let dir = tempfile::tempdir().unwrap();
        let (lock, _) = MultiLock::open(
            &dir.path().join("nest._int_"),
            0,
            OpenSpec::Checked { mode: LockMode::Partitioned, count: PARTS },
            0o666,
            OpenRetry { attempts: 2, delay: Duration::from_millis(5) },
        )
        .unwrap();
        let mut model = Model::default();

        for op in ops {
            match op {
                Op::Lock(p) => {
                    lock.lock(LockTarget::Partition(p), false).unwrap();
                    model.parts[p] += 1;
                }
                Op::Unlock(p) => {
                    let result = lock.unlock(LockTarget::Partition(p));
                    if model.parts[p] == 0 {
                        prop_assert!(result.unwrap_err().is_not_owner());
                    } else {
                        result.unwrap();
                        model.parts[p] -= 1;
                    }
                }
                Op::LockExclusive => {
                    lock.lock(LockTarget::Exclusive, false).unwrap();
                    model.exclusive += 1;
                    model.parts.iter_mut().for_each(|n| *n += 1);
                }
                Op::UnlockExclusive => {
                    let result = lock.unlock(LockTarget::Exclusive);
                    if model.exclusive == 0 {
                        prop_assert!(result.unwrap_err().is_not_owner());
                    } else if model.parts.iter().any(|n| *n == 0) {
                        // a partition released by hand leaves the exclusive hold incomplete
                        prop_assert!(result.is_err());
                        return Ok(());
                    } else {
                        result.unwrap();
                        model.exclusive -= 1;
                        model.parts.iter_mut().for_each(|n| *n -= 1);
                    }
                }
            }

            prop_assert_eq!(lock.local_count(Slot::Exclusive).unwrap(), model.exclusive);
            for (p, expected) in model.parts.iter().enumerate() {
                prop_assert_eq!(lock.local_count(Slot::Partition(p)).unwrap(), *expected);
            }
            let held = model.parts.iter().filter(|n| **n > 0).count();
            prop_assert_eq!(lock.local_part_count(), held);
        }
    }
}
