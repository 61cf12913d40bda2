//! Page-structured heap: size-class free lists for small objects, multi-page
//! runs for large ones (§4.3). No teacher file implements size classes
//! directly (see `DESIGN.md`); the page-descriptor-in-leading-word scheme
//! follows the Data Model's own description, consistent with the `ODD`-bit
//! discrimination `crate::object::Lockword` relies on.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

use parking_lot::Mutex;

use crate::error::{VmError, VmResult};
use crate::object::{Header, Lockword, ObjectRef};
use crate::types::Type;

pub const PAGE_SIZE: usize = 4096;

/// Size classes in bytes, chosen so the interpreter's common small
/// allocations (boxed primitives, small objects with a handful of fields)
/// land inside a size class without excess internal fragmentation.
const SIZE_CLASSES: &[usize] = &[16, 32, 48, 64, 96, 128, 192, 256, 384, 512, 768, 1024];
/// Requests at or above this size become a multi-page `Large` run.
const LARGE_THRESHOLD: usize = 1536;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PageKind {
    Free,
    Small { size_class: usize },
    /// Head page of an `npages`-page run; interior pages are `LargeInterior`.
    Large { npages: usize },
    LargeInterior,
}

struct Page {
    kind: PageKind,
    /// Free-list bitmap for `Small` pages: one bit per block, set = free.
    free_blocks: Vec<bool>,
    storage: NonNull<u8>,
}

unsafe impl Send for Page {}

/// The heap's mutable state, behind one mutex (§5's "heap's free lists are
/// only mutated under `world_stopped`... or the global mutex").
pub struct Heap {
    pages: Mutex<Vec<Page>>,
    total_pages: usize,
    /// Per-size-class "use first" list: indices into `pages` with at least
    /// one free block, most-recently-used at the back.
    use_first: Mutex<Vec<Vec<usize>>>,
}

impl Heap {
    pub fn new(total_bytes: u64) -> Self {
        let total_pages = ((total_bytes as usize) / PAGE_SIZE).max(1);
        Self {
            pages: Mutex::new(Vec::new()),
            total_pages,
            use_first: Mutex::new(vec![Vec::new(); SIZE_CLASSES.len()]),
        }
    }

    fn size_class_index(size: usize) -> Option<usize> {
        SIZE_CLASSES.iter().position(|&c| size <= c)
    }

    /// Allocates a zeroed object whose header sits `header_offset` bytes
    /// into a `total_size`-byte block (reference fields occupy the bytes
    /// before the header, at negative offsets, per the Data Model; `ty`'s
    /// own layout is what determines `header_offset`). When `header_offset`
    /// is nonzero, the block's leading word is written as a skip marker —
    /// an even (never-`ODD`) byte count to the header — so
    /// [`Self::find_object_head`] can recover the header from the block's
    /// start without consulting `ty` first (§4.4 "skip word").
    pub fn allocate(&self, ty: &Type, total_size: usize, header_offset: usize) -> VmResult<ObjectRef> {
        let total = total_size.max(std::mem::size_of::<Header>() + header_offset);
        if total >= LARGE_THRESHOLD {
            self.allocate_large(ty, total, header_offset)
        } else {
            self.allocate_small(ty, total, header_offset)
        }
    }

    fn allocate_small(&self, ty: &Type, size: usize, header_offset: usize) -> VmResult<ObjectRef> {
        let class_idx = Self::size_class_index(size)
            .ok_or_else(|| VmError::Internal(format!("no size class fits {size} bytes")))?;
        let block_size = SIZE_CLASSES[class_idx];

        loop {
            let mut use_first = self.use_first.lock();
            if let Some(&page_idx) = use_first[class_idx].last() {
                let mut pages = self.pages.lock();
                if let Some(block) = Self::take_free_block(&mut pages[page_idx]) {
                    if !pages[page_idx].free_blocks.iter().any(|f| *f) {
                        use_first[class_idx].pop();
                    }
                    let ptr = unsafe { pages[page_idx].storage.as_ptr().add(block * block_size) };
                    return Ok(unsafe { Self::init_object(ptr, ty, header_offset) });
                }
                use_first[class_idx].pop();
                continue;
            }
            drop(use_first);

            let page_idx = self.acquire_free_page(PageKind::Small { size_class: block_size }, block_size)?;
            self.use_first.lock()[class_idx].push(page_idx);
        }
    }

    fn take_free_block(page: &mut Page) -> Option<usize> {
        let idx = page.free_blocks.iter().position(|f| *f)?;
        page.free_blocks[idx] = false;
        Some(idx)
    }

    fn allocate_large(&self, ty: &Type, size: usize, header_offset: usize) -> VmResult<ObjectRef> {
        let npages = (size + PAGE_SIZE - 1) / PAGE_SIZE;
        let mut pages = self.pages.lock();
        Self::ensure_capacity(&mut pages, self.total_pages);

        let mut run_start = None;
        let mut run_len = 0;
        for (idx, page) in pages.iter().enumerate() {
            if page.kind == PageKind::Free {
                if run_start.is_none() {
                    run_start = Some(idx);
                }
                run_len += 1;
                if run_len == npages {
                    break;
                }
            } else {
                run_start = None;
                run_len = 0;
            }
        }
        let start = run_start
            .filter(|_| run_len == npages)
            .ok_or(VmError::OutOfMemory("no contiguous run for large allocation"))?;

        let layout = Layout::from_size_align(npages * PAGE_SIZE, PAGE_SIZE).unwrap();
        let storage = NonNull::new(unsafe { alloc_zeroed(layout) })
            .ok_or(VmError::OutOfMemory("allocator returned null"))?;

        pages[start].kind = PageKind::Large { npages };
        pages[start].storage = storage;
        pages[start].free_blocks.clear();
        for i in 1..npages {
            pages[start + i].kind = PageKind::LargeInterior;
        }

        Ok(unsafe { Self::init_object(storage.as_ptr(), ty, header_offset) })
    }

    fn acquire_free_page(&self, kind: PageKind, block_size: usize) -> VmResult<usize> {
        let mut pages = self.pages.lock();
        Self::ensure_capacity(&mut pages, self.total_pages);
        let idx = pages
            .iter()
            .position(|p| p.kind == PageKind::Free)
            .ok_or(VmError::OutOfMemory("no free page for small allocation"))?;

        let layout = Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap();
        let storage = NonNull::new(unsafe { alloc_zeroed(layout) })
            .ok_or(VmError::OutOfMemory("allocator returned null"))?;

        let blocks_per_page = PAGE_SIZE / block_size;
        pages[idx] = Page {
            kind,
            free_blocks: vec![true; blocks_per_page],
            storage,
        };
        Ok(idx)
    }

    fn ensure_capacity(pages: &mut Vec<Page>, total: usize) {
        while pages.len() < total {
            pages.push(Page {
                kind: PageKind::Free,
                free_blocks: Vec::new(),
                storage: NonNull::dangling(),
            });
        }
    }

    /// Writes the header at `block_ptr + header_offset` and, if
    /// `header_offset != 0`, a skip marker at `block_ptr` itself.
    unsafe fn init_object(block_ptr: *mut u8, ty: &Type, header_offset: usize) -> ObjectRef {
        if header_offset != 0 {
            debug_assert_eq!(header_offset % 2, 0, "skip marker must stay non-ODD");
            std::ptr::write(block_ptr as *mut u64, header_offset as u64);
        }
        let header = block_ptr.add(header_offset) as *mut Header;
        std::ptr::write(
            header,
            Header {
                lockword: std::sync::atomic::AtomicU64::new(Lockword::new_for_type(ty).0),
                ty: NonNull::from(ty),
            },
        );
        ObjectRef(NonNull::new_unchecked(header))
    }

    /// Recovers an object's header from a pointer to the start of its block,
    /// per §4.4's `find_object_head`: the leading word is either the real
    /// header (`ODD` bit set) or a byte-offset skip marker to it.
    unsafe fn find_object_head(block_ptr: *mut u8) -> *mut Header {
        let first = std::ptr::read(block_ptr as *const u64);
        if first & 1 == 1 {
            block_ptr as *mut Header
        } else {
            block_ptr.add(first as usize) as *mut Header
        }
    }

    /// Marks a small block or large run free again. Called only from `gc`
    /// during the sweep phase (§4.9), itself only reachable under
    /// stop-the-world.
    pub fn free(&self, obj: ObjectRef) {
        let word = std::mem::size_of::<usize>();
        let header_offset = obj.ty().layout.total_reference_count as usize * word;
        let addr = obj.0.as_ptr() as usize - header_offset;

        let mut pages = self.pages.lock();
        for idx in 0..pages.len() {
            let page = &pages[idx];
            if page.storage == NonNull::dangling() {
                continue;
            }
            let base = page.storage.as_ptr() as usize;
            match page.kind {
                PageKind::Small { size_class } => {
                    let page_len = PAGE_SIZE;
                    if addr >= base && addr < base + page_len {
                        let block = (addr - base) / size_class;
                        pages[idx].free_blocks[block] = true;
                        let layout = Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap();
                        if pages[idx].free_blocks.iter().all(|f| *f) {
                            unsafe { dealloc(pages[idx].storage.as_ptr(), layout) };
                            pages[idx].kind = PageKind::Free;
                            pages[idx].storage = NonNull::dangling();
                        }
                        return;
                    }
                }
                PageKind::Large { npages } => {
                    if addr == base {
                        let layout = Layout::from_size_align(npages * PAGE_SIZE, PAGE_SIZE).unwrap();
                        unsafe { dealloc(page.storage.as_ptr(), layout) };
                        for i in 0..npages {
                            pages[idx + i].kind = PageKind::Free;
                        }
                        pages[idx].storage = NonNull::dangling();
                        return;
                    }
                }
                _ => {}
            }
        }
    }

    /// Walks every live (non-free) object in the heap, for the mark phase's
    /// conservative-pointer test and the sweep phase alike.
    pub fn for_each_object(&self, mut f: impl FnMut(ObjectRef)) {
        let pages = self.pages.lock();
        let mut idx = 0;
        while idx < pages.len() {
            match pages[idx].kind {
                PageKind::Small { size_class } => {
                    for (block, free) in pages[idx].free_blocks.iter().enumerate() {
                        if !*free {
                            let block_ptr = unsafe { pages[idx].storage.as_ptr().add(block * size_class) };
                            let header = unsafe { Self::find_object_head(block_ptr) };
                            f(ObjectRef(unsafe { NonNull::new_unchecked(header) }));
                        }
                    }
                    idx += 1;
                }
                PageKind::Large { npages } => {
                    let header = unsafe { Self::find_object_head(pages[idx].storage.as_ptr()) };
                    f(ObjectRef(unsafe { NonNull::new_unchecked(header) }));
                    idx += npages;
                }
                _ => idx += 1,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_class_lookup_picks_smallest_fit() {
        assert_eq!(Heap::size_class_index(10), Some(0));
        assert_eq!(Heap::size_class_index(17), Some(1));
        assert_eq!(Heap::size_class_index(1024), Some(SIZE_CLASSES.len() - 1));
        assert_eq!(Heap::size_class_index(2000), None);
    }
}
