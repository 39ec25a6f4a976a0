// This file is part of Kiln.
//
// Kiln is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// Kiln is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with Kiln.  If not, see <http://www.gnu.org/licenses/>.

use log::trace;
use parking_lot::Mutex;
use std::{
    alloc::{alloc, dealloc, Layout},
    ptr::NonNull,
    sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering},
};

pub const BLOCK_SMALL: usize = 256;
pub const BLOCK_LARGE: usize = 1024 * 1024;

const SLAB_MAX: usize = 1024;
const HEAD_EMPTY: u32 = u32::MAX;

fn pack(index: u32, tag: u32) -> u64 {
    ((tag as u64) << 32) | index as u64
}

fn unpack(head: u64) -> (u32, u32) {
    (head as u32, (head >> 32) as u32)
}

/// Thread-safe LIFO of fixed-size cells backed by demand-allocated slabs.
///
/// The free list is threaded through the first four bytes of each vacant
/// cell; the list head packs `(cell_index, tag)` into one atomic word so
/// that push/pop are single-CAS operations and a recycled head cannot be
/// mistaken for the original (ABA).
pub struct BlockPool {
    cell_size: usize,
    cells_per_slab: usize,
    slabs: Vec<AtomicPtr<u8>>,
    slab_count: AtomicUsize,
    head: AtomicU64,
    grow_lock: Mutex<()>,
    in_use: AtomicUsize,
}

unsafe impl Send for BlockPool {}
unsafe impl Sync for BlockPool {}

impl BlockPool {
    /// `cell_size` must hold the intra-cell free link and should be a
    /// divisor-friendly fraction of the slab size; BLOCK_SMALL and
    /// BLOCK_LARGE are the two sizes the engine uses.
    pub fn new(cell_size: usize) -> Self {
        assert!(cell_size >= 4);
        let slab_size = cell_size.max(64 * 1024);
        let mut slabs = Vec::with_capacity(SLAB_MAX);
        for _ in 0..SLAB_MAX {
            slabs.push(AtomicPtr::new(std::ptr::null_mut()));
        }
        Self {
            cell_size,
            cells_per_slab: slab_size / cell_size,
            slabs,
            slab_count: AtomicUsize::new(0),
            head: AtomicU64::new(pack(HEAD_EMPTY, 0)),
            grow_lock: Mutex::new(()),
            in_use: AtomicUsize::new(0),
        }
    }

    pub fn cell_size(&self) -> usize {
        self.cell_size
    }

    pub fn blocks_in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    fn cell_ptr(&self, index: u32) -> *mut u8 {
        let slab = index as usize / self.cells_per_slab;
        let cell = index as usize % self.cells_per_slab;
        let base = self.slabs[slab].load(Ordering::Acquire);
        debug_assert!(!base.is_null());
        unsafe { base.add(cell * self.cell_size) }
    }

    // The link word is read racily by concurrent poppers; the head tag makes
    // any stale value harmless, but the access itself must be atomic.
    fn read_next(&self, index: u32) -> u32 {
        unsafe { (*(self.cell_ptr(index) as *const AtomicU32)).load(Ordering::Acquire) }
    }

    fn write_next(&self, index: u32, next: u32) {
        unsafe { (*(self.cell_ptr(index) as *const AtomicU32)).store(next, Ordering::Release) };
    }

    /// Pop one cell, growing by a slab when the free list is empty.
    pub fn alloc(&self) -> Option<NonNull<u8>> {
        loop {
            let head = self.head.load(Ordering::Acquire);
            let (index, tag) = unpack(head);
            if index == HEAD_EMPTY {
                if !self.grow() {
                    return None;
                }
                continue;
            }
            let next = self.read_next(index);
            if self
                .head
                .compare_exchange_weak(
                    head,
                    pack(next, tag.wrapping_add(1)),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                self.in_use.fetch_add(1, Ordering::AcqRel);
                return NonNull::new(self.cell_ptr(index));
            }
        }
    }

    /// Push a cell previously returned by [BlockPool::alloc].
    ///
    /// # Safety
    ///
    /// `cell` must originate from this pool and must not be used after the
    /// call.
    pub unsafe fn free(&self, cell: NonNull<u8>) {
        let index = self
            .index_of(cell.as_ptr())
            .expect("freed cell does not belong to this pool");
        loop {
            let head = self.head.load(Ordering::Acquire);
            let (old_index, tag) = unpack(head);
            self.write_next(index, old_index);
            if self
                .head
                .compare_exchange_weak(
                    head,
                    pack(index, tag.wrapping_add(1)),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                self.in_use.fetch_sub(1, Ordering::AcqRel);
                return;
            }
        }
    }

    fn index_of(&self, ptr: *mut u8) -> Option<u32> {
        let slab_bytes = self.cells_per_slab * self.cell_size;
        let count = self.slab_count.load(Ordering::Acquire);
        for slab in 0..count {
            let base = self.slabs[slab].load(Ordering::Acquire);
            if base.is_null() {
                continue;
            }
            let offset = (ptr as isize) - (base as isize);
            if offset >= 0 && (offset as usize) < slab_bytes {
                let cell = offset as usize / self.cell_size;
                debug_assert_eq!(offset as usize % self.cell_size, 0);
                return Some((slab * self.cells_per_slab + cell) as u32);
            }
        }
        None
    }

    fn grow(&self) -> bool {
        let _guard = self.grow_lock.lock();
        // Another thread may have grown while this one waited for the lock.
        let (index, _) = unpack(self.head.load(Ordering::Acquire));
        if index != HEAD_EMPTY {
            return true;
        }

        let slab = self.slab_count.load(Ordering::Acquire);
        if slab == SLAB_MAX {
            log::warn!("block pool (cell {}) exhausted slab table", self.cell_size);
            return false;
        }

        let layout = Layout::from_size_align(self.cells_per_slab * self.cell_size, 4096)
            .expect("slab layout");
        let base = unsafe { alloc(layout) };
        if base.is_null() {
            return false;
        }
        self.slabs[slab].store(base, Ordering::Release);
        self.slab_count.store(slab + 1, Ordering::Release);
        trace!(
            "block pool (cell {}) grew to {} slab(s)",
            self.cell_size,
            slab + 1
        );

        // Thread every new cell onto the free list.
        let first = (slab * self.cells_per_slab) as u32;
        for i in 0..self.cells_per_slab as u32 {
            let cell = first + i;
            let next = if i + 1 == self.cells_per_slab as u32 {
                HEAD_EMPTY
            } else {
                cell + 1
            };
            self.write_next(cell, next);
        }
        loop {
            let head = self.head.load(Ordering::Acquire);
            let (old_index, tag) = unpack(head);
            self.write_next(first + self.cells_per_slab as u32 - 1, old_index);
            if self
                .head
                .compare_exchange(
                    head,
                    pack(first, tag.wrapping_add(1)),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return true;
            }
        }
    }
}

impl Drop for BlockPool {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.cells_per_slab * self.cell_size, 4096)
            .expect("slab layout");
        for slab in self.slabs.iter() {
            let base = slab.load(Ordering::Acquire);
            if !base.is_null() {
                unsafe { dealloc(base, layout) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn alloc_free_round_trip() {
        let pool = BlockPool::new(BLOCK_SMALL);
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        assert_ne!(a.as_ptr(), b.as_ptr());
        assert_eq!(pool.blocks_in_use(), 2);
        unsafe {
            pool.free(a);
            pool.free(b);
        }
        assert_eq!(pool.blocks_in_use(), 0);
    }

    #[test]
    fn freed_cells_are_recycled_lifo() {
        let pool = BlockPool::new(BLOCK_SMALL);
        let a = pool.alloc().unwrap();
        let a_ptr = a.as_ptr();
        unsafe { pool.free(a) };
        let b = pool.alloc().unwrap();
        assert_eq!(a_ptr, b.as_ptr());
        unsafe { pool.free(b) };
    }

    #[test]
    fn contended_alloc_free_balances() {
        const THREADS: usize = 4;
        const ROUNDS: usize = 10_000;

        let pool = Arc::new(BlockPool::new(BLOCK_SMALL));
        let mut handles = Vec::new();
        for t in 0..THREADS {
            let pool = pool.clone();
            handles.push(std::thread::spawn(move || {
                let mut held = Vec::new();
                let mut state = 0x9e3779b9u32.wrapping_mul(t as u32 + 1) | 1;
                for _ in 0..ROUNDS {
                    state = state.wrapping_mul(1664525).wrapping_add(1013904223);
                    if state & 1 == 0 || held.is_empty() {
                        let cell = pool.alloc().unwrap();
                        // Stamp the cell; a pool handing out an aliased cell
                        // to two threads would tear these writes.
                        unsafe { (cell.as_ptr() as *mut u32).write(t as u32) };
                        held.push(cell);
                    } else {
                        let cell: NonNull<u8> = held.pop().unwrap();
                        assert_eq!(unsafe { (cell.as_ptr() as *const u32).read() }, t as u32);
                        unsafe { pool.free(cell) };
                    }
                }
                for cell in held.drain(..) {
                    assert_eq!(unsafe { (cell.as_ptr() as *const u32).read() }, t as u32);
                    unsafe { pool.free(cell) };
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(pool.blocks_in_use(), 0);
    }
}
