//! Conservative-root mark-sweep collector with class-loader unloading
//! (§4.9).
//!
//! "Conservative" here describes the object graph, not the stack scan: every
//! root this module walks is precisely typed (`Value::Ref` slots, not raw
//! stack words), but a loader's liveness is decided the same way a
//! real collector decides a class's — transitively, via whether any live
//! object's runtime type was defined by it, iterated to a fixed point since
//! marking a loader alive can itself expose more roots (its
//! `implicit_refs`) that make *other* loaders alive in turn.
//!
//! Grounded on `vm/gc/mod.rs`'s mark/sweep phase split for the overall
//! shape, and on `examples/original_source/.../jchevm/libjc/lock.c`'s
//! "only free locks when the world is stopped" contract (mirrored here by
//! [`crate::lock::FatLockTable::release_to_free_list`] only ever being
//! called from [`sweep`]).

use std::sync::atomic::Ordering;

use ahash::AHashSet;

use crate::loader::LoaderId;
use crate::object::{ObjectRef, Value};
use crate::thread::{ThreadHandle, ThreadId, ThreadStatus, WorldState};
use crate::types::{PrimitiveTag, TypeFlags};
use crate::vm::Jvm;

const WORD: i32 = std::mem::size_of::<usize>() as i32;

/// Outcome of one [`collect`] cycle.
#[derive(Debug, Default)]
pub struct GcReport {
    pub objects_freed: usize,
    pub loaders_unloaded: usize,
    /// Finalizable garbage found this cycle: resurrected (kept live) rather
    /// than freed, for the caller to run `finalize()` on — with the world
    /// resumed, since running Java code under stop-the-world would deadlock
    /// the requesting thread against its own safepoint check.
    pub pending_finalization: Vec<ObjectRef>,
}

/// Runs one full stop-the-world mark-sweep-unload cycle. `requester` is the
/// thread driving the collection (a GC-triggering allocation failure, or an
/// explicit `System.gc()`); it is excluded from the quiescence wait since it
/// is not concurrently mutating its own stack.
pub fn collect(jvm: &Jvm, requester: &ThreadHandle) -> GcReport {
    jvm.world().stop_the_world();
    wait_for_quiescence(jvm.world(), requester.id);

    let mut worklist = Vec::new();
    let mut touched_loaders: AHashSet<LoaderId> = AHashSet::default();

    // Clear every object's mark except the permanently KEEP-rooted ones
    // (interned/system objects that never go through ordinary reachability).
    jvm.heap().for_each_object(|obj| {
        let lw = obj.lockword();
        if lw.is_keep() {
            // Unconditionally seeded, not routed through `mark` — a KEEP
            // object may already carry last cycle's LIVE bit, and `mark`'s
            // already-live guard would otherwise skip re-adding it to this
            // cycle's worklist (and re-touching its loader) entirely.
            obj.store_lockword(lw.set_live(true));
            if let Some(loader) = obj.ty().loader.upgrade() {
                touched_loaders.insert(loader.id);
            }
            worklist.push(obj);
        } else {
            obj.store_lockword(lw.set_live(false));
        }
    });

    // The bootstrap loader never unloads; its implicit refs are unconditional
    // roots, independent of the fixed-point walk below.
    jvm.loaders().for_each_loader(|loader| {
        loader
            .gc_marked
            .store(loader.is_bootstrap, Ordering::Relaxed);
    });
    for r in jvm.loaders().bootstrap().implicit_refs.lock().iter() {
        mark(*r, &mut worklist, &mut touched_loaders);
    }

    // Thread roots: every occupied operand-stack/locals slot on every thread.
    jvm.world().for_each_thread(|t| {
        for v in t.java_stack.lock().live_slots() {
            if let Value::Ref(Some(obj)) = *v {
                mark(obj, &mut worklist, &mut touched_loaders);
            }
        }
    });

    // Static-field roots: every defined type's static storage, regardless of
    // which loader defined it — a class that has run `<clinit>` keeps its
    // static state reachable until its loader is actually unloaded below.
    jvm.loaders().for_each_loader(|loader| {
        loader.for_each_defined_type(|ty| {
            for v in ty.static_values.lock().values() {
                if let Value::Ref(Some(obj)) = *v {
                    mark(obj, &mut worklist, &mut touched_loaders);
                }
            }
        });
    });

    drain(&mut worklist, &mut touched_loaders);

    // Fixed point: a loader becomes alive once some marked object's runtime
    // type names it as the defining loader; once alive, its own implicit
    // refs become roots too, which may mark objects that make a *different*
    // loader alive next round. Bounded by loader count, since each round
    // either marks at least one previously-unmarked loader or the loop ends.
    let rounds = jvm.loaders().loader_count();
    for _ in 0..=rounds {
        let mut newly_alive = Vec::new();
        jvm.loaders().for_each_loader(|loader| {
            if !loader.gc_marked.load(Ordering::Relaxed) && touched_loaders.contains(&loader.id) {
                loader.gc_marked.store(true, Ordering::Relaxed);
                newly_alive.push(std::sync::Arc::clone(loader));
            }
        });
        if newly_alive.is_empty() {
            break;
        }
        for loader in &newly_alive {
            for r in loader.implicit_refs.lock().iter() {
                mark(*r, &mut worklist, &mut touched_loaders);
            }
        }
        drain(&mut worklist, &mut touched_loaders);
    }

    let (objects_freed, pending_finalization) = sweep(jvm);
    let loaders_unloaded = unload_dead_loaders(jvm);

    jvm.world().resume_the_world();

    tracing::debug!(
        target: "gc",
        objects_freed,
        loaders_unloaded,
        pending_finalization = pending_finalization.len(),
        "collection cycle complete",
    );

    GcReport {
        objects_freed,
        loaders_unloaded,
        pending_finalization,
    }
}

fn wait_for_quiescence(world: &WorldState, requester_id: ThreadId) {
    loop {
        let mut all_halted = true;
        world.for_each_thread(|t| {
            if t.id != requester_id && t.status() == ThreadStatus::RunningNormal {
                all_halted = false;
            }
        });
        if all_halted {
            return;
        }
        std::thread::yield_now();
    }
}

fn mark(obj: ObjectRef, worklist: &mut Vec<ObjectRef>, touched: &mut AHashSet<LoaderId>) {
    let lw = obj.lockword();
    if lw.is_live() {
        return;
    }
    obj.store_lockword(lw.set_live(true));
    if let Some(loader) = obj.ty().loader.upgrade() {
        touched.insert(loader.id);
    }
    worklist.push(obj);
}

fn drain(worklist: &mut Vec<ObjectRef>, touched: &mut AHashSet<LoaderId>) {
    while let Some(obj) = worklist.pop() {
        let mut visit = |child: ObjectRef| mark(child, worklist, touched);
        unsafe { trace_object(obj, &mut visit) };
    }
}

/// Visits every outgoing reference `obj` holds: its declared reference
/// fields (negative offsets before the header, §4.4) for an instance, or
/// every element for a reference-component array.
///
/// `SPECIAL`-flagged objects (set at derivation for `Reference` subclasses,
/// `Class`, `ClassLoader`, and `Throwable` — §4.2) get one distinct
/// treatment here: a `Reference`'s `referent` field is a weak edge, not a
/// strong one, so it is never followed from this scan. This core has no
/// memory-pressure signal to promote a `SoftReference` to a strong root
/// under pressure, so soft and weak references currently behave alike — see
/// DESIGN.md's `gc/` entry.
///
/// # Safety
/// `obj` must be a live, fully-initialized object of its recorded type.
unsafe fn trace_object(obj: ObjectRef, visit: &mut dyn FnMut(ObjectRef)) {
    let ty = obj.ty();
    if ty.has_flag(TypeFlags::ARRAY) {
        if let Some(elem) = &ty.array_element {
            if elem.primitive_tag == PrimitiveTag::NotPrimitive {
                let len = obj.array_length();
                for i in 0..len {
                    let slot = obj.array_element_ptr::<Option<ObjectRef>>(WORD, i);
                    if let Some(child) = *slot {
                        visit(child);
                    }
                }
            }
        }
        return;
    }

    let skip_offset = if obj.lockword().is_special() {
        referent_offset(ty)
    } else {
        None
    };

    for slot in 0..ty.layout.total_reference_count {
        let offset = -(slot + 1) * WORD;
        if skip_offset == Some(offset) {
            continue;
        }
        let field = obj.field_ptr::<Option<ObjectRef>>(offset);
        if let Some(child) = *field {
            visit(child);
        }
    }
}

/// Walks `ty`'s superclass chain for a declared `referent` field (the one
/// `java.lang.ref.Reference` itself declares); `None` for any `SPECIAL` type
/// that isn't actually a `Reference` subclass (`Class`, `ClassLoader`,
/// `Throwable`), which carry no such field.
fn referent_offset(mut ty: &crate::types::Type) -> Option<i32> {
    loop {
        if let Some(f) = ty.fields.iter().find(|f| f.name == "referent") {
            return Some(f.offset);
        }
        ty = ty.superclass.as_deref()?;
    }
}

/// Reclaims every unmarked object, deferring finalizable garbage one cycle
/// (§4.9 "Finalization"): the first time a finalizable object is found dead
/// it is resurrected and queued rather than freed, so its `finalize()` can
/// still run; a finalizable object found dead a second time (`VISITED`
/// already set from the prior cycle) is freed like anything else.
fn sweep(jvm: &Jvm) -> (usize, Vec<ObjectRef>) {
    let mut dead = Vec::new();
    let mut pending_finalization = Vec::new();
    jvm.heap().for_each_object(|obj| {
        let lw = obj.lockword();
        if lw.is_live() {
            return;
        }
        if lw.is_finalize() && !lw.is_visited() {
            obj.store_lockword(lw.set_live(true).set_visited(true));
            pending_finalization.push(obj);
            return;
        }
        dead.push(obj);
    });

    for obj in &dead {
        let lw = obj.lockword();
        if lw.is_fat() {
            jvm.fat_locks().release_to_free_list(lw.fat_id());
        }
        jvm.heap().free(*obj);
    }
    (dead.len(), pending_finalization)
}

/// Drops every non-bootstrap loader this cycle found unreachable, releasing
/// its defined types' last strong reference.
fn unload_dead_loaders(jvm: &Jvm) -> usize {
    let mut dead_loaders = Vec::new();
    jvm.loaders().for_each_loader(|loader| {
        if !loader.is_bootstrap && !loader.gc_marked.load(Ordering::Relaxed) {
            dead_loaders.push(loader.id);
        }
    });
    for id in &dead_loaders {
        tracing::debug!(target: "gc", loader_id = id, "unloading class loader");
        jvm.loaders().unload(*id);
    }
    dead_loaders.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiescence_ignores_the_requester() {
        let world = WorldState::new();
        let requester = ThreadHandle::new(1, 64 * 1024);
        world.register(requester.clone());
        // The requester itself is still RunningNormal; it must not block on
        // its own status.
        wait_for_quiescence(&world, requester.id);
    }

    #[test]
    fn quiescence_is_satisfied_once_every_other_thread_halts() {
        let world = WorldState::new();
        let requester = ThreadHandle::new(1, 64 * 1024);
        let other = ThreadHandle::new(2, 64 * 1024);
        world.register(requester.clone());
        world.register(other.clone());
        // `stop_the_world` flips every registered thread's status from
        // RunningNormal to HaltingNormal, which already satisfies
        // quiescence without anyone needing to actually reach a safepoint.
        world.stop_the_world();
        assert_eq!(other.status(), ThreadStatus::HaltingNormal);
        wait_for_quiescence(&world, requester.id);
    }
}
