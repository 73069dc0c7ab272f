/*!
 * Per-Thread Lock Bookkeeping
 *
 * Each multi-lock instance gets a small integer id from a process-wide
 * arena. Every thread keeps a vector indexed by that id holding its own
 * nesting counts for the instance, so lookups never depend on where the
 * instance lives in memory.
 *
 * Ids are recycled; a generation number travels with each id so a thread
 * never reads counts left behind by a previous owner of the same slot.
 *
 * After `fork()` the child is a new process image with a new thread id:
 * an atfork handler bumps a global epoch and each thread discards its
 * entries and re-reads its tid on next access.
 */

use crate::core::types::OwnerId;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Once;

/// Stable identity of a multi-lock instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceId {
    slot: u32,
    generation: u32,
}

impl InstanceId {
    #[inline]
    pub fn slot(&self) -> usize {
        self.slot as usize
    }
}

/// Per-thread, per-instance nesting state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadEntry {
    /// Exclusive acquisitions not yet released
    pub excl_count: u32,
    /// Partition/shared acquisitions not yet released
    pub part_count: u32,
    /// Partition most recently acquired
    pub last_locked: Option<usize>,
}

struct IdArena {
    free: Vec<u32>,
    generations: Vec<u32>,
}

static ARENA: Mutex<IdArena> = parking_lot::const_mutex(IdArena {
    free: Vec::new(),
    generations: Vec::new(),
});

/// Owns an arena id and returns it on drop
#[derive(Debug)]
pub struct InstanceSlot {
    id: InstanceId,
}

impl InstanceSlot {
    pub fn allocate() -> Self {
        let mut arena = ARENA.lock();
        let id = match arena.free.pop() {
            Some(slot) => InstanceId {
                slot,
                generation: arena.generations[slot as usize],
            },
            None => {
                let slot = arena.generations.len() as u32;
                arena.generations.push(0);
                InstanceId {
                    slot,
                    generation: 0,
                }
            }
        };
        Self { id }
    }

    #[inline]
    pub fn id(&self) -> InstanceId {
        self.id
    }
}

impl Drop for InstanceSlot {
    fn drop(&mut self) {
        reset_entry(self.id);
        let mut arena = ARENA.lock();
        let slot = self.id.slot as usize;
        arena.generations[slot] = arena.generations[slot].wrapping_add(1);
        arena.free.push(self.id.slot);
    }
}

// =============================================================================
// FORK EPOCH
// =============================================================================

static FORK_EPOCH: AtomicU64 = AtomicU64::new(0);
static ATFORK: Once = Once::new();

extern "C" fn on_fork_child() {
    FORK_EPOCH.fetch_add(1, Ordering::SeqCst);
}

fn install_fork_handler() {
    ATFORK.call_once(|| {
        // SAFETY: registering a plain extern "C" handler that only touches an atomic
        let rc = unsafe { libc::pthread_atfork(None, None, Some(on_fork_child)) };
        if rc != 0 {
            tracing::warn!(errno = rc, "pthread_atfork failed; fork detection disabled");
        }
    });
}

/// Current fork epoch; changes in every forked child
#[inline]
pub fn fork_epoch() -> u64 {
    FORK_EPOCH.load(Ordering::SeqCst)
}

// =============================================================================
// THREAD CONTEXT
// =============================================================================

#[derive(Clone, Copy)]
struct Tagged {
    generation: u32,
    entry: ThreadEntry,
}

struct ThreadContext {
    epoch: u64,
    tid: OwnerId,
    entries: Vec<Option<Tagged>>,
}

impl ThreadContext {
    fn new() -> Self {
        install_fork_handler();
        Self {
            epoch: fork_epoch(),
            tid: raw_tid(),
            entries: Vec::new(),
        }
    }

    fn refresh(&mut self) {
        let epoch = fork_epoch();
        if epoch != self.epoch {
            self.epoch = epoch;
            self.tid = raw_tid();
            self.entries.clear();
        }
    }

    fn entry(&mut self, id: InstanceId) -> &mut ThreadEntry {
        let slot = id.slot();
        if self.entries.len() <= slot {
            self.entries.resize(slot + 1, None);
        }
        let tagged = self.entries[slot].get_or_insert(Tagged {
            generation: id.generation,
            entry: ThreadEntry::default(),
        });
        if tagged.generation != id.generation {
            *tagged = Tagged {
                generation: id.generation,
                entry: ThreadEntry::default(),
            };
        }
        &mut tagged.entry
    }
}

thread_local! {
    static CONTEXT: RefCell<ThreadContext> = RefCell::new(ThreadContext::new());
}

/// Kernel thread id of the caller, used as lock owner id
pub fn current_tid() -> OwnerId {
    CONTEXT
        .try_with(|ctx| {
            let mut ctx = ctx.borrow_mut();
            ctx.refresh();
            ctx.tid
        })
        .unwrap_or_else(|_| raw_tid())
}

/// Run `f` with the caller's tid and its entry for `id`
pub fn with_entry<R>(id: InstanceId, f: impl FnOnce(OwnerId, &mut ThreadEntry) -> R) -> R {
    match CONTEXT.try_with(|ctx| {
        let mut ctx = ctx.borrow_mut();
        ctx.refresh();
        let tid = ctx.tid;
        (tid, *ctx.entry(id))
    }) {
        Ok((tid, mut entry)) => {
            let out = f(tid, &mut entry);
            let _ = CONTEXT.try_with(|ctx| {
                *ctx.borrow_mut().entry(id) = entry;
            });
            out
        }
        // thread is tearing down its locals
        Err(_) => f(raw_tid(), &mut ThreadEntry::default()),
    }
}

/// Snapshot of the caller's entry for `id`
pub fn entry(id: InstanceId) -> ThreadEntry {
    with_entry(id, |_, e| *e)
}

/// Forget the caller's counts for `id`
pub fn reset_entry(id: InstanceId) {
    let _ = CONTEXT.try_with(|ctx| {
        let mut ctx = ctx.borrow_mut();
        if let Some(slot) = ctx.entries.get_mut(id.slot()) {
            *slot = None;
        }
    });
}

#[cfg(target_os = "linux")]
fn raw_tid() -> OwnerId {
    // SAFETY: gettid has no preconditions
    unsafe { libc::syscall(libc::SYS_gettid) as OwnerId }
}

#[cfg(not(target_os = "linux"))]
fn raw_tid() -> OwnerId {
    // SAFETY: pthread_self has no preconditions
    let id = unsafe { libc::pthread_self() } as usize as u64;
    let mixed = (id ^ (id >> 32)) as u32 ^ std::process::id();
    mixed.max(1)
}
