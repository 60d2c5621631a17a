// Per-task page table, reduced to what the paging policies read and write:
// a present mapping with a frame handle plus the writable, accessed and
// dirty bits. Accessed and dirty are set by the user-memory accessors the
// way an MMU would set them, and cleared by the reclaim clock and the mmap
// writeback path.

use std::collections::HashMap;

use crate::palloc::Kaddr;
use crate::param::pg_round_down;

#[derive(Clone, Copy)]
pub struct Pte {
    pub kaddr: Kaddr,
    pub writable: bool,
    pub accessed: bool,
    pub dirty: bool,
}

pub struct PageDir {
    map: HashMap<usize, Pte>,
}

impl PageDir {
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    /// Installs a mapping; refuses to overwrite one.
    pub fn set_page(&mut self, vaddr: usize, kaddr: Kaddr, writable: bool) -> bool {
        let va = pg_round_down(vaddr);
        if self.map.contains_key(&va) {
            return false;
        }
        self.map.insert(
            va,
            Pte {
                kaddr,
                writable,
                accessed: false,
                dirty: false,
            },
        );
        true
    }

    pub fn clear_page(&mut self, vaddr: usize) -> Option<Pte> {
        self.map.remove(&pg_round_down(vaddr))
    }

    pub fn get_page(&self, vaddr: usize) -> Option<Pte> {
        self.map.get(&pg_round_down(vaddr)).copied()
    }

    pub fn is_accessed(&self, vaddr: usize) -> bool {
        self.map
            .get(&pg_round_down(vaddr))
            .map_or(false, |pte| pte.accessed)
    }

    pub fn set_accessed(&mut self, vaddr: usize, accessed: bool) {
        if let Some(pte) = self.map.get_mut(&pg_round_down(vaddr)) {
            pte.accessed = accessed;
        }
    }

    pub fn is_dirty(&self, vaddr: usize) -> bool {
        self.map
            .get(&pg_round_down(vaddr))
            .map_or(false, |pte| pte.dirty)
    }

    pub fn set_dirty(&mut self, vaddr: usize, dirty: bool) {
        if let Some(pte) = self.map.get_mut(&pg_round_down(vaddr)) {
            pte.dirty = dirty;
        }
    }

    pub fn mapped_count(&self) -> usize {
        self.map.len()
    }
}

impl Default for PageDir {
    fn default() -> Self {
        Self::new()
    }
}
