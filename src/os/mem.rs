//! Contiguous-memory management: free-list allocation, process
//! relocation, and compaction.
//!
//! Invariant: after any operation here, the process windows
//! `[BASE, BASE+LIM)` and the free blocks together tile
//! `[0, RAM_SIZE)` without overlap.

use thiserror::Error;

use crate::hw::ram::Ram;
use crate::Word;

use super::pcb::Pcb;

/// A maximal run of free words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemBlock {
    /// First free address.
    pub addr: Word,
    /// Number of free words; always positive.
    pub size: Word,
}

/// The allocator could not satisfy the request: the free words that
/// remain sum to less than the requested size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("not enough memory for a {0}-word allocation")]
pub struct NotEnoughMemory(pub Word);

/// Free-list allocator over the whole of RAM.
#[derive(Debug)]
pub struct MemoryManager {
    free: Vec<MemBlock>,
    ram_size: usize,
    verbose: bool,
}

impl MemoryManager {
    /// Creates a manager whose free list spans all of RAM.
    pub fn new(ram_size: usize) -> MemoryManager {
        MemoryManager {
            free: vec![MemBlock { addr: 0, size: ram_size as Word }],
            ram_size,
            verbose: false,
        }
    }

    /// Toggles relocation tracing.
    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    /// The current free blocks, sorted by address.
    pub fn free_blocks(&self) -> &[MemBlock] {
        &self.free
    }

    /// Total free words across all blocks.
    pub fn total_free(&self) -> Word {
        self.free.iter().map(|b| b.size).sum()
    }

    /// Allocates `size` contiguous words, first-fit. When memory is
    /// sufficient but fragmented, compacts and retries once.
    ///
    /// Every PCB in `procs` must hold saved register state: compaction
    /// relocates windows by rewriting saved registers, so the caller
    /// saves the running process before allocating.
    pub fn alloc(
        &mut self,
        size: Word,
        ram: &mut Ram,
        procs: &mut [Pcb],
    ) -> Result<Word, NotEnoughMemory> {
        debug_assert!(size > 0);
        if let Some(addr) = self.first_fit(size) {
            return Ok(addr);
        }
        if self.total_free() < size {
            return Err(NotEnoughMemory(size));
        }
        self.compact(ram, procs);
        // after compaction the free space is one block, so this fit
        // cannot fail
        self.first_fit(size).ok_or(NotEnoughMemory(size))
    }

    fn first_fit(&mut self, size: Word) -> Option<Word> {
        self.free.sort_by_key(|b| b.addr);
        let i = self.free.iter().position(|b| b.size >= size)?;
        let addr = self.free[i].addr;
        if self.free[i].size == size {
            self.free.remove(i);
        } else {
            self.free[i].addr += size;
            self.free[i].size -= size;
        }
        Some(addr)
    }

    /// Relocates every process to the lowest available address, in
    /// base order, and replaces the free list with the single block
    /// spanning the remainder of RAM.
    pub fn compact(&mut self, ram: &mut Ram, procs: &mut [Pcb]) {
        let mut order: Vec<usize> = (0..procs.len()).collect();
        order.sort_by_key(|&i| procs[i].base());

        let mut next: Word = 0;
        for i in order {
            let pcb = &mut procs[i];
            let (base, lim) = (pcb.base(), pcb.lim());
            if base != next {
                ram.copy_block(base as usize, next as usize, lim as usize);
                pcb.shift_window(next - base);
                if self.verbose {
                    println!("Relocated process {} from {} to {}", pcb.pid(), base, next);
                }
            }
            next += lim;
        }

        self.free.clear();
        if (next as usize) < self.ram_size {
            self.free.push(MemBlock { addr: next, size: self.ram_size as Word - next });
        }
    }

    /// Returns a window to the free list and merges adjacent blocks.
    pub fn free(&mut self, base: Word, lim: Word) {
        debug_assert!(lim > 0);
        self.free.push(MemBlock { addr: base, size: lim });
        self.coalesce();
    }

    fn coalesce(&mut self) {
        self.free.sort_by_key(|b| b.addr);
        let mut merged: Vec<MemBlock> = Vec::with_capacity(self.free.len());
        for block in self.free.drain(..) {
            match merged.last_mut() {
                Some(prev) if prev.addr + prev.size == block.addr => prev.size += block.size,
                _ => merged.push(block),
            }
        }
        self.free = merged;
    }
}
