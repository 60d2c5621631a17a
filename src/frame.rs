// Frame table and reclaim.
//
// Every resident user page is listed here in LRU arrival order along with a
// handle to its owner: the task and the page-aligned virtual address whose
// descriptor it backs. One lock covers the list and the clock cursor, and
// stays held for the whole of an eviction, I/O included; that serializes
// reclaim. The victim's page-table and descriptor locks are taken briefly
// around the I/O, never across it.
//
// Eviction policy by descriptor type:
//   Bin:  clean pages are discarded (the image re-reads them); a dirtied
//         page migrates to Anon and goes to swap, permanently.
//   File: dirty pages write back through the file, clean ones drop.
//   Anon: always swaps out.

use std::sync::{Arc, Mutex};

use log::debug;

use crate::error::Error;
use crate::fs::FileSys;
use crate::palloc::{Kaddr, PagePool, PallocFlags};
use crate::param::pg_round_down;
use crate::swap::Swap;
use crate::task::Task;
use crate::vm::VmType;

pub struct Frame {
    pub kaddr: Kaddr,
    pub task: Arc<Task>,
    pub vaddr: usize,
}

struct FrameTable {
    list: Vec<Frame>,
    clock: usize, // index of the next frame the hand examines
}

impl FrameTable {
    fn remove(&mut self, idx: usize) -> Frame {
        let frame = self.list.remove(idx);
        if self.clock > idx {
            self.clock -= 1;
        }
        if !self.list.is_empty() {
            self.clock %= self.list.len();
        } else {
            self.clock = 0;
        }
        frame
    }
}

pub struct MemSys {
    pub pool: PagePool,
    pub swap: Swap,
    fs: Arc<FileSys>,
    frames: Mutex<FrameTable>,
}

impl MemSys {
    pub fn new(fs: Arc<FileSys>, swap: Swap, user_pages: usize) -> Self {
        Self {
            pool: PagePool::new(user_pages),
            swap,
            fs,
            frames: Mutex::new(FrameTable {
                list: Vec::new(),
                clock: 0,
            }),
        }
    }

    /// Allocates a frame for the page at (`task`, `vaddr`), reclaiming a
    /// resident page when the pool is dry, and links it into the LRU list.
    /// The caller installs the mapping and flips the descriptor to loaded.
    pub fn alloc_page(&self, flags: PallocFlags, task: &Arc<Task>, vaddr: usize) -> Kaddr {
        let kaddr = match self.pool.get_page(flags) {
            Some(k) => k,
            None => self
                .try_to_free(flags)
                .expect("out of frames with nothing evictable"),
        };
        self.frames.lock().unwrap().list.push(Frame {
            kaddr,
            task: Arc::clone(task),
            vaddr: pg_round_down(vaddr),
        });
        kaddr
    }

    /// Unlinks the frame holding `kaddr` and returns it to the pool. The
    /// caller has already torn down the mapping.
    pub fn free_page(&self, kaddr: Kaddr) {
        let mut table = self.frames.lock().unwrap();
        if let Some(idx) = table.list.iter().position(|f| f.kaddr == kaddr) {
            table.remove(idx);
            self.pool.free_page(kaddr);
        }
    }

    // The reclaim clock. Sweeps the list from the cursor: a page whose
    // accessed bit is set gets it cleared and a second chance; anything else
    // is evicted per its type, unmapped, and its frame freed, and the
    // allocation is retried. Victims the swap cannot take (swap full) are
    // passed over; cheaper prey may still be ahead.
    fn try_to_free(&self, flags: PallocFlags) -> Option<Kaddr> {
        let mut table = self.frames.lock().unwrap();
        loop {
            if table.list.is_empty() {
                return None;
            }
            table.clock %= table.list.len();
            let idx = table.clock;
            table.clock = (table.clock + 1) % table.list.len();

            let (kaddr, task, vaddr) = {
                let f = &table.list[idx];
                (f.kaddr, Arc::clone(&f.task), f.vaddr)
            };

            {
                let mut pd = task.pd.lock().unwrap();
                if pd.is_accessed(vaddr) {
                    pd.set_accessed(vaddr, false);
                    continue;
                }
            }

            let (vtype, file, offset, read_bytes, loaded) = {
                let vm = task.vm.lock().unwrap();
                match vm.find(vaddr) {
                    Some(v) => (v.vtype, v.file.clone(), v.offset, v.read_bytes, v.is_loaded),
                    None => continue,
                }
            };
            // A frame whose descriptor is not loaded yet is mid-setup.
            if !loaded {
                continue;
            }
            let dirty = task.pd.lock().unwrap().is_dirty(vaddr);

            match vtype {
                VmType::Bin if dirty => {
                    // A modified image page can never come back from the
                    // executable; it becomes anonymous for good.
                    match self.swap.swap_out(&self.pool, kaddr) {
                        Ok(slot) => {
                            let mut vm = task.vm.lock().unwrap();
                            let v = vm.find_mut(vaddr).expect("descriptor vanished");
                            v.vtype = VmType::Anon;
                            v.swap_slot = Some(slot);
                        }
                        Err(Error::SwapFull) => continue,
                        Err(err) => panic!("swap out: {}", err),
                    }
                }
                VmType::Anon => match self.swap.swap_out(&self.pool, kaddr) {
                    Ok(slot) => {
                        let mut vm = task.vm.lock().unwrap();
                        let v = vm.find_mut(vaddr).expect("descriptor vanished");
                        v.swap_slot = Some(slot);
                    }
                    Err(Error::SwapFull) => continue,
                    Err(err) => panic!("swap out: {}", err),
                },
                VmType::File if dirty => {
                    let file = file.expect("file-backed descriptor");
                    let mut buf = vec![0u8; read_bytes as usize];
                    let len = buf.len();
                    self.pool
                        .with_page(kaddr, |p| buf.copy_from_slice(&p[..len]));
                    let _fs_lock = self.fs.lock.lock().unwrap();
                    let n = file.write_at(&self.fs, &buf, offset);
                    debug_assert_eq!(n, buf.len());
                }
                // Clean Bin and File pages are re-readable; just drop them.
                VmType::Bin | VmType::File => {}
            }

            debug!(
                "evict task {} va {:#x} ({:?}, dirty={})",
                task.id(),
                vaddr,
                vtype,
                dirty
            );
            {
                let mut vm = task.vm.lock().unwrap();
                if let Some(v) = vm.find_mut(vaddr) {
                    v.is_loaded = false;
                }
            }
            task.pd.lock().unwrap().clear_page(vaddr);
            table.remove(idx);
            self.pool.free_page(kaddr);

            if let Some(k) = self.pool.get_page(flags) {
                return Some(k);
            }
        }
    }

    /// Number of frames currently linked into the LRU list.
    pub fn resident_count(&self) -> usize {
        self.frames.lock().unwrap().list.len()
    }

    /// True when `kaddr` appears exactly once in the list.
    pub fn is_resident_once(&self, kaddr: Kaddr) -> bool {
        let table = self.frames.lock().unwrap();
        table.list.iter().filter(|f| f.kaddr == kaddr).count() == 1
    }
}
