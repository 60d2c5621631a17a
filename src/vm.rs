// Page descriptors.
//
// Every user page a task can touch has a descriptor telling the fault path
// where its contents come from: an executable image (Bin), a mapped file
// (File), or nothing but zeros and possibly a swap slot (Anon). A dirtied
// Bin page migrates to Anon on eviction and stays that way; a File page
// writes back to its file; an Anon page always goes to swap.
//
// The per-task map is keyed by page-aligned virtual address. The map owns
// the descriptors; the frame table and the mmap registry refer to them by
// (task, vaddr) handle only.

use std::collections::HashMap;
use std::sync::Arc;

use crate::file::File;
use crate::fs::FileSys;
use crate::palloc::{Kaddr, PagePool};
use crate::param::{pg_round_down, PGSIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmType {
    Bin,
    File,
    Anon,
}

pub struct VmEntry {
    pub vtype: VmType,
    pub vaddr: usize,
    pub writable: bool,
    pub is_loaded: bool,
    pub file: Option<Arc<File>>,
    pub offset: u32,
    pub read_bytes: u32,
    pub zero_bytes: u32,
    pub swap_slot: Option<usize>,
}

impl VmEntry {
    /// A zero-filled anonymous page.
    pub fn anon(vaddr: usize) -> Self {
        Self {
            vtype: VmType::Anon,
            vaddr,
            writable: true,
            is_loaded: false,
            file: None,
            offset: 0,
            read_bytes: 0,
            zero_bytes: PGSIZE as u32,
            swap_slot: None,
        }
    }

    /// A page backed by `read_bytes` of a file, the rest zeros.
    pub fn backed(
        vtype: VmType,
        vaddr: usize,
        writable: bool,
        file: Arc<File>,
        offset: u32,
        read_bytes: u32,
    ) -> Self {
        Self {
            vtype,
            vaddr,
            writable,
            is_loaded: false,
            file: Some(file),
            offset,
            read_bytes,
            zero_bytes: PGSIZE as u32 - read_bytes,
            swap_slot: None,
        }
    }
}

pub struct VmMap {
    map: HashMap<usize, VmEntry>,
}

impl VmMap {
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    /// Fails when a descriptor already covers the address.
    pub fn insert(&mut self, vme: VmEntry) -> bool {
        debug_assert_eq!(vme.vaddr % PGSIZE, 0);
        if self.map.contains_key(&vme.vaddr) {
            return false;
        }
        self.map.insert(vme.vaddr, vme);
        true
    }

    pub fn find(&self, vaddr: usize) -> Option<&VmEntry> {
        self.map.get(&pg_round_down(vaddr))
    }

    pub fn find_mut(&mut self, vaddr: usize) -> Option<&mut VmEntry> {
        self.map.get_mut(&pg_round_down(vaddr))
    }

    pub fn delete(&mut self, vaddr: usize) -> Option<VmEntry> {
        self.map.remove(&pg_round_down(vaddr))
    }

    pub fn addresses(&self) -> Vec<usize> {
        self.map.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Default for VmMap {
    fn default() -> Self {
        Self::new()
    }
}

/// One mmap call's bookkeeping: the reopened file plus the addresses of the
/// descriptors it created.
pub struct MmapRecord {
    pub mapid: i32,
    pub file: Arc<File>,
    pub pages: Vec<usize>,
}

/// Fills the frame at `kaddr` from the descriptor's file: `read_bytes` from
/// the backing offset, the remainder zeroed. False on short read.
pub fn load_file(fs: &FileSys, pool: &PagePool, kaddr: Kaddr, vme: &VmEntry) -> bool {
    let file = vme.file.as_ref().expect("file-backed descriptor");
    let read_bytes = vme.read_bytes as usize;
    pool.with_page(kaddr, |page| {
        let n = file.read_at(fs, &mut page[..read_bytes], vme.offset);
        if n != read_bytes {
            return false;
        }
        page[read_bytes..].fill(0);
        true
    })
}
