//! Thread subsystem: lifecycle, cooperative stop-the-world, safepoint
//! polling, and cross-thread exception posting (§4.8).
//!
//! The stop-the-world wait loop is grounded directly on `vm/thread.rs`'s
//! `ThreadLocalHandle::collector_lock`: check a shared "collection pending"
//! flag, drop this thread's own lock, wait on the collector's condvar, then
//! relock with a bounded retry rather than a single blocking wait (so a
//! thread can still observe a cross-thread exception posted while parked).

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::{VmError, VmResult};
use crate::invoke::{Frame, JavaStack};
use crate::lock::ThreadLockState;

pub type ThreadId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    RunningNormal,
    RunningNonJava,
    HaltingNormal,
    HaltingNonJava,
}

/// Coordination shared by every thread, analogous to `VMGcState`'s role in
/// `vm/thread.rs` but scoped to stop-the-world alone (GC-specific state
/// lives in `crate::gc`).
pub struct WorldState {
    stopped: AtomicBool,
    condvar: Condvar,
    gate: Mutex<()>,
    threads: Mutex<Vec<Arc<ThreadHandle>>>,
}

impl WorldState {
    pub fn new() -> Self {
        Self {
            stopped: AtomicBool::new(false),
            condvar: Condvar::new(),
            gate: Mutex::new(()),
            threads: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&self, handle: Arc<ThreadHandle>) {
        self.threads.lock().push(handle);
    }

    pub fn unregister(&self, id: ThreadId) {
        self.threads.lock().retain(|t| t.id != id);
    }

    /// Stops the world: every other thread observes `stopped` at its next
    /// safepoint (`thread_check`) or on re-entry to `RUNNING_NORMAL` and
    /// blocks until `resume_the_world`.
    pub fn stop_the_world(&self) {
        let _gate = self.gate.lock();
        self.stopped.store(true, Ordering::SeqCst);
        for t in self.threads.lock().iter() {
            t.request_halt();
        }
    }

    pub fn resume_the_world(&self) {
        self.stopped.store(false, Ordering::SeqCst);
        for t in self.threads.lock().iter() {
            t.clear_halt();
        }
        self.condvar.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Visits every currently-registered thread. Used by `crate::gc` to scan
    /// stack roots and by `stop_the_world`'s caller to wait for quiescence.
    pub fn for_each_thread(&self, mut f: impl FnMut(&Arc<ThreadHandle>)) {
        for t in self.threads.lock().iter() {
            f(t);
        }
    }

    /// Blocks the calling thread until the world resumes, re-checking every
    /// 500 microseconds rather than a single indefinite wait, so a thread
    /// parked here still notices it has been asked to halt for a *second*,
    /// nested reason (mirrors the bounded `try_lock_for` retry in
    /// `vm/thread.rs`'s `collector_lock`).
    pub fn wait_for_resume(&self) {
        let mut guard = self.gate.lock();
        while self.is_stopped() {
            self.condvar.wait_for(&mut guard, Duration::from_micros(500));
        }
    }
}

/// Per-thread record. Holds the Java frame chain (§4.7), lock-subsystem
/// state, and the two exception channels described in the Data Model
/// ("pending and cross-thread-posted exception slots").
pub struct ThreadHandle {
    pub id: ThreadId,
    status: Mutex<ThreadStatus>,
    halt_requested: AtomicBool,
    interrupted: AtomicBool,
    pub lock_state: Arc<ThreadLockState>,
    pub frames: Mutex<Option<Box<Frame>>>,
    pub java_stack: Mutex<JavaStack>,
    pending_exception: Mutex<Option<VmError>>,
    cross_exception: Mutex<Option<VmError>>,
    pub java_stack_size: u64,
}

impl ThreadHandle {
    pub fn new(id: ThreadId, java_stack_size: u64) -> Arc<Self> {
        let capacity_words = (java_stack_size / std::mem::size_of::<usize>() as u64) as usize;
        Arc::new(Self {
            id,
            status: Mutex::new(ThreadStatus::RunningNormal),
            halt_requested: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            lock_state: Arc::new(ThreadLockState::new(id)),
            frames: Mutex::new(None),
            java_stack: Mutex::new(JavaStack::new(capacity_words)),
            pending_exception: Mutex::new(None),
            cross_exception: Mutex::new(None),
            java_stack_size,
        })
    }

    pub fn status(&self) -> ThreadStatus {
        *self.status.lock()
    }

    fn request_halt(&self) {
        self.halt_requested.store(true, Ordering::SeqCst);
        let mut status = self.status.lock();
        *status = match *status {
            ThreadStatus::RunningNormal => ThreadStatus::HaltingNormal,
            ThreadStatus::RunningNonJava => ThreadStatus::HaltingNonJava,
            other => other,
        };
    }

    fn clear_halt(&self) {
        self.halt_requested.store(false, Ordering::SeqCst);
        let mut status = self.status.lock();
        *status = match *status {
            ThreadStatus::HaltingNormal => ThreadStatus::RunningNormal,
            ThreadStatus::HaltingNonJava => ThreadStatus::RunningNonJava,
            other => other,
        };
    }

    /// Transitions into non-Java mode (native call, blocking wait). Clips
    /// the current frame chain's visibility to conservative scanners in a
    /// full VM; this port's precise roots need no extra bookkeeping here.
    pub fn stopping_java(&self) {
        let mut status = self.status.lock();
        *status = ThreadStatus::RunningNonJava;
    }

    /// Reverses `stopping_java`, blocking first if the world is stopped.
    pub fn resuming_java(&self, world: &WorldState) {
        if world.is_stopped() {
            world.wait_for_resume();
        }
        let mut status = self.status.lock();
        *status = ThreadStatus::RunningNormal;
    }

    /// Safepoint poll: deliver a cross-thread exception, honor interrupt,
    /// and block if stop-the-world is pending. Called at loop-back-edges
    /// and method entry by `crate::interp`.
    pub fn thread_check(&self, world: &WorldState) -> VmResult<()> {
        if let Some(exc) = self.cross_exception.lock().take() {
            return Err(exc);
        }
        if world.is_stopped() {
            self.stopping_java();
            world.wait_for_resume();
            self.resuming_java(world);
        }
        Ok(())
    }

    pub fn post_cross_exception(&self, exc: VmError) {
        *self.cross_exception.lock() = Some(exc);
    }

    pub fn set_pending(&self, exc: VmError) {
        *self.pending_exception.lock() = Some(exc);
    }

    pub fn take_pending(&self) -> Option<VmError> {
        self.pending_exception.lock().take()
    }

    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    pub fn clear_interrupted(&self) -> bool {
        self.interrupted.swap(false, Ordering::SeqCst)
    }
}

static NEXT_THREAD_ID: AtomicU32 = AtomicU32::new(1);

pub fn allocate_thread_id() -> ThreadId {
    NEXT_THREAD_ID.fetch_add(1, Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_the_world_toggles_status() {
        let world = WorldState::new();
        let handle = ThreadHandle::new(1, 256 * 1024);
        world.register(handle.clone());
        world.stop_the_world();
        assert_eq!(handle.status(), ThreadStatus::HaltingNormal);
        world.resume_the_world();
        assert_eq!(handle.status(), ThreadStatus::RunningNormal);
    }

    #[test]
    fn thread_check_delivers_cross_exception() {
        let world = WorldState::new();
        let handle = ThreadHandle::new(2, 256 * 1024);
        handle.post_cross_exception(VmError::Interrupted);
        assert!(handle.thread_check(&world).is_err());
    }

    #[test]
    fn interrupt_flag_clears_on_read() {
        let handle = ThreadHandle::new(3, 256 * 1024);
        handle.interrupt();
        assert!(handle.clear_interrupted());
        assert!(!handle.clear_interrupted());
    }
}
