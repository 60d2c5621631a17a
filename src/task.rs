// Tasks.
//
// A task owns the per-task state the storage and memory layers act on: the
// page-descriptor map and simulated page table, the mmap registry, the open
// file table (descriptors 0 and 1 are the console, files start at 2), and
// the current directory. Spawning reopens the parent's current directory;
// exit closes everything, writes mapped dirty pages back, and returns
// frames and swap slots.
//
// User memory is reached through read_user/write_user, which fault pages in
// on demand and set the accessed/dirty bits the reclaim clock and the mmap
// writeback rely on.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use log::debug;

use crate::dir::Dir;
use crate::error::{Error, Result};
use crate::file::File;
use crate::frame::MemSys;
use crate::fs::FileSys;
use crate::pagedir::{PageDir, Pte};
use crate::palloc::PallocFlags;
use crate::param::{pg_ofs, pg_round_down, PGSIZE, USER_BASE, USER_TOP};
use crate::vm::{self, MmapRecord, VmEntry, VmMap, VmType};

/// First file descriptor backed by a file; 0 and 1 are the console.
pub const FD_BASE: usize = 2;

pub struct Task {
    id: usize,
    fs: Arc<FileSys>,
    mm: Arc<MemSys>,
    pub(crate) pd: Mutex<PageDir>,
    pub(crate) vm: Mutex<VmMap>,
    mmaps: Mutex<Vec<MmapRecord>>,
    next_mapid: AtomicI32,
    files: Mutex<Vec<Option<Arc<File>>>>,
    images: Mutex<Vec<Arc<File>>>, // executable images, write-denied
    cwd: Mutex<Option<Dir>>,
    exit_status: Mutex<Option<i32>>,
}

impl Task {
    pub(crate) fn new(
        id: usize,
        fs: Arc<FileSys>,
        mm: Arc<MemSys>,
        parent: Option<&Task>,
    ) -> Arc<Task> {
        // The child starts where the parent was; a task with no parent
        // starts at the root.
        let cwd = match parent {
            Some(p) => p
                .cwd
                .lock()
                .unwrap()
                .as_ref()
                .map(|d| d.reopen())
                .unwrap_or_else(|| Dir::open_root(&fs)),
            None => Dir::open_root(&fs),
        };
        Arc::new(Task {
            id,
            fs,
            mm,
            pd: Mutex::new(PageDir::new()),
            vm: Mutex::new(VmMap::new()),
            mmaps: Mutex::new(Vec::new()),
            next_mapid: AtomicI32::new(1),
            files: Mutex::new(Vec::new()),
            images: Mutex::new(Vec::new()),
            cwd: Mutex::new(Some(cwd)),
            exit_status: Mutex::new(None),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn exit_status(&self) -> Option<i32> {
        *self.exit_status.lock().unwrap()
    }

    /// Runs `f` with the task's current directory.
    pub fn with_cwd<R>(&self, f: impl FnOnce(Option<&Dir>) -> R) -> R {
        let cwd = self.cwd.lock().unwrap();
        f(cwd.as_ref())
    }

    /// Switches the current directory; the path resolves relative to the
    /// old one.
    pub fn chdir(&self, path: &str) -> Result<()> {
        let new = {
            let cwd = self.cwd.lock().unwrap();
            self.fs.open_dir(cwd.as_ref(), path)?
        };
        if let Some(old) = self.cwd.lock().unwrap().replace(new) {
            old.close(&self.fs);
        }
        Ok(())
    }

    // File descriptors.

    pub fn add_file(&self, file: Arc<File>) -> usize {
        let mut files = self.files.lock().unwrap();
        for (i, slot) in files.iter_mut().enumerate() {
            if slot.is_none() {
                slot.replace(file);
                return i + FD_BASE;
            }
        }
        files.push(Some(file));
        files.len() - 1 + FD_BASE
    }

    pub fn get_file(&self, fd: usize) -> Result<Arc<File>> {
        fd.checked_sub(FD_BASE)
            .and_then(|i| self.files.lock().unwrap().get(i).cloned().flatten())
            .ok_or(Error::BadFd)
    }

    pub fn close_fd(&self, fd: usize) -> Result<()> {
        let file = fd
            .checked_sub(FD_BASE)
            .and_then(|i| self.files.lock().unwrap().get_mut(i).and_then(|s| s.take()))
            .ok_or(Error::BadFd)?;
        file.close(&self.fs);
        Ok(())
    }

    // Address-space setup.

    fn check_user_range(&self, vaddr: usize, len: usize) -> Result<()> {
        let end = vaddr.checked_add(len).ok_or(Error::Fault(vaddr))?;
        if vaddr < USER_BASE || end > USER_TOP {
            return Err(Error::Fault(vaddr));
        }
        Ok(())
    }

    /// Covers `[vaddr, vaddr + read_bytes + zero_bytes)` with lazy
    /// image-backed pages and write-denies the image for the task's
    /// lifetime. `read_bytes + zero_bytes` must be page-aligned, as must
    /// `vaddr`.
    pub fn load_segment(
        &self,
        file: &Arc<File>,
        offset: u32,
        vaddr: usize,
        read_bytes: u32,
        zero_bytes: u32,
        writable: bool,
    ) -> Result<()> {
        assert_eq!(pg_ofs(vaddr), 0);
        assert_eq!((read_bytes + zero_bytes) as usize % PGSIZE, 0);
        self.check_user_range(vaddr, (read_bytes + zero_bytes) as usize)
            .map_err(|_| Error::BadMap)?;

        let pages = (read_bytes + zero_bytes) as usize / PGSIZE;
        let image = file.reopen();
        image.deny_write();

        let mut vm = self.vm.lock().unwrap();
        for i in 0..pages {
            if vm.find(vaddr + i * PGSIZE).is_some() {
                drop(vm);
                image.close(&self.fs);
                return Err(Error::BadMap);
            }
        }
        let mut remaining = read_bytes;
        let mut offset = offset;
        for i in 0..pages {
            let page_read = remaining.min(PGSIZE as u32);
            vm.insert(VmEntry::backed(
                VmType::Bin,
                vaddr + i * PGSIZE,
                writable,
                Arc::clone(&image),
                offset,
                page_read,
            ));
            remaining -= page_read;
            offset += PGSIZE as u32;
        }
        drop(vm);
        self.images.lock().unwrap().push(image);
        Ok(())
    }

    /// Maps `pages` zero-filled anonymous pages at `vaddr` and faults them
    /// in (stack-style growth is eager).
    pub fn map_anon(self: &Arc<Self>, vaddr: usize, pages: usize) -> Result<()> {
        assert_eq!(pg_ofs(vaddr), 0);
        self.check_user_range(vaddr, pages * PGSIZE)
            .map_err(|_| Error::BadMap)?;
        {
            let mut vm = self.vm.lock().unwrap();
            for i in 0..pages {
                if vm.find(vaddr + i * PGSIZE).is_some() {
                    return Err(Error::BadMap);
                }
            }
            for i in 0..pages {
                vm.insert(VmEntry::anon(vaddr + i * PGSIZE));
            }
        }
        for i in 0..pages {
            let va = vaddr + i * PGSIZE;
            if !self.handle_fault(va) {
                return Err(Error::Fault(va));
            }
        }
        Ok(())
    }

    // Fault path: look the page up, get a frame (reclaiming if need be),
    // fill it from its source, install the mapping, mark the descriptor
    // loaded. True on success; false ends in task termination upstream.
    pub fn handle_fault(self: &Arc<Self>, vaddr: usize) -> bool {
        if !(USER_BASE..USER_TOP).contains(&vaddr) {
            return false;
        }
        let va = pg_round_down(vaddr);
        if self.pd.lock().unwrap().get_page(va).is_some() {
            return true;
        }
        let (vtype, writable, file, offset, read_bytes, swap_slot) = {
            let vm = self.vm.lock().unwrap();
            match vm.find(va) {
                Some(v) => (
                    v.vtype,
                    v.writable,
                    v.file.clone(),
                    v.offset,
                    v.read_bytes,
                    v.swap_slot,
                ),
                None => return false,
            }
        };

        let kaddr = self.mm.alloc_page(PallocFlags::USER, self, va);
        let filled = match vtype {
            VmType::Bin | VmType::File => {
                let src = VmEntry::backed(
                    vtype,
                    va,
                    writable,
                    file.expect("file-backed descriptor"),
                    offset,
                    read_bytes,
                );
                vm::load_file(&self.fs, &self.mm.pool, kaddr, &src)
            }
            VmType::Anon => {
                match swap_slot {
                    Some(slot) => {
                        self.mm.swap.swap_in(&self.mm.pool, slot, kaddr);
                        let mut vm = self.vm.lock().unwrap();
                        if let Some(v) = vm.find_mut(va) {
                            v.swap_slot = None;
                        }
                    }
                    None => self.mm.pool.with_page(kaddr, |p| p.fill(0)),
                }
                true
            }
        };
        if !filled {
            self.mm.free_page(kaddr);
            return false;
        }

        let installed = self.pd.lock().unwrap().set_page(va, kaddr, writable);
        debug_assert!(installed, "double mapping at {:#x}", va);
        if let Some(v) = self.vm.lock().unwrap().find_mut(va) {
            v.is_loaded = true;
        }
        debug!("task {} fault {:#x} -> frame {} ({:?})", self.id, va, kaddr, vtype);
        true
    }

    fn ensure_resident(self: &Arc<Self>, vaddr: usize) -> Result<Pte> {
        loop {
            if let Some(pte) = self.pd.lock().unwrap().get_page(vaddr) {
                return Ok(pte);
            }
            if !self.handle_fault(vaddr) {
                return Err(Error::Fault(vaddr));
            }
        }
    }

    // User memory access.

    pub fn read_user(self: &Arc<Self>, vaddr: usize, dst: &mut [u8]) -> Result<()> {
        self.check_user_range(vaddr, dst.len())?;
        let mut addr = vaddr;
        let mut done = 0;
        while done < dst.len() {
            let pte = self.ensure_resident(addr)?;
            let ofs = pg_ofs(addr);
            let chunk = (dst.len() - done).min(PGSIZE - ofs);
            self.mm.pool.with_page(pte.kaddr, |p| {
                dst[done..done + chunk].copy_from_slice(&p[ofs..ofs + chunk])
            });
            self.pd.lock().unwrap().set_accessed(addr, true);
            done += chunk;
            addr += chunk;
        }
        Ok(())
    }

    pub fn write_user(self: &Arc<Self>, vaddr: usize, src: &[u8]) -> Result<()> {
        self.check_user_range(vaddr, src.len())?;
        let mut addr = vaddr;
        let mut done = 0;
        while done < src.len() {
            let pte = self.ensure_resident(addr)?;
            if !pte.writable {
                return Err(Error::Fault(addr));
            }
            let ofs = pg_ofs(addr);
            let chunk = (src.len() - done).min(PGSIZE - ofs);
            self.mm.pool.with_page(pte.kaddr, |p| {
                p[ofs..ofs + chunk].copy_from_slice(&src[done..done + chunk])
            });
            let mut pd = self.pd.lock().unwrap();
            pd.set_accessed(addr, true);
            pd.set_dirty(addr, true);
            drop(pd);
            done += chunk;
            addr += chunk;
        }
        Ok(())
    }

    // Memory-mapped files.

    /// Maps the file behind `fd` at `addr`, one descriptor per page, lazily
    /// loaded and writable. The file handle is reopened so writeback works
    /// even after the descriptor is closed. Returns the mapping id.
    pub fn mmap(self: &Arc<Self>, fd: usize, addr: usize) -> Result<i32> {
        if addr == 0 || pg_ofs(addr) != 0 {
            return Err(Error::BadMap);
        }
        let file = self.get_file(fd)?;
        let len = file.length(&self.fs);
        self.check_user_range(addr, len as usize)
            .map_err(|_| Error::BadMap)?;
        let pages = (len as usize + PGSIZE - 1) / PGSIZE;

        let map_file = file.reopen();
        let mut record = MmapRecord {
            mapid: self.next_mapid.fetch_add(1, Ordering::SeqCst),
            file: Arc::clone(&map_file),
            pages: Vec::with_capacity(pages),
        };
        {
            let mut vm = self.vm.lock().unwrap();
            for i in 0..pages {
                if vm.find(addr + i * PGSIZE).is_some() {
                    drop(vm);
                    map_file.close(&self.fs);
                    return Err(Error::BadMap);
                }
            }
            let mut remaining = len;
            let mut offset = 0u32;
            for i in 0..pages {
                let va = addr + i * PGSIZE;
                let page_read = remaining.min(PGSIZE as u32);
                vm.insert(VmEntry::backed(
                    VmType::File,
                    va,
                    true,
                    Arc::clone(&map_file),
                    offset,
                    page_read,
                ));
                record.pages.push(va);
                remaining -= page_read;
                offset += PGSIZE as u32;
            }
        }
        let mapid = record.mapid;
        self.mmaps.lock().unwrap().push(record);
        Ok(mapid)
    }

    /// Unmaps one mapping, or every mapping for `mapid == -1`. Dirty
    /// resident pages are written back to the file first.
    pub fn munmap(&self, mapid: i32) -> Result<()> {
        let records: Vec<MmapRecord> = {
            let mut mmaps = self.mmaps.lock().unwrap();
            if mapid == -1 {
                mmaps.drain(..).collect()
            } else {
                let idx = mmaps
                    .iter()
                    .position(|r| r.mapid == mapid)
                    .ok_or(Error::BadMap)?;
                vec![mmaps.remove(idx)]
            }
        };
        for record in records {
            self.do_munmap(record);
        }
        Ok(())
    }

    fn do_munmap(&self, record: MmapRecord) {
        for va in &record.pages {
            let vme = match self.vm.lock().unwrap().delete(*va) {
                Some(v) => v,
                None => continue,
            };
            if !vme.is_loaded {
                continue;
            }
            let pte = self.pd.lock().unwrap().get_page(*va);
            if let Some(pte) = pte {
                if pte.dirty {
                    let mut buf = vec![0u8; vme.read_bytes as usize];
                    let len = buf.len();
                    self.mm
                        .pool
                        .with_page(pte.kaddr, |p| buf.copy_from_slice(&p[..len]));
                    let _fs_lock = self.fs.lock.lock().unwrap();
                    let n = record.file.write_at(&self.fs, &buf, vme.offset);
                    debug_assert_eq!(n, buf.len());
                }
                self.pd.lock().unwrap().clear_page(*va);
                self.mm.free_page(pte.kaddr);
            }
        }
        record.file.close(&self.fs);
    }

    // Teardown.

    /// Terminates the task: unmaps files (writing dirty pages back), frees
    /// every frame and swap slot the address space holds, closes the fd
    /// table, the denied images and the working directory.
    pub fn exit(&self, status: i32) {
        {
            let mut st = self.exit_status.lock().unwrap();
            if st.is_some() {
                return;
            }
            *st = Some(status);
        }
        debug!("task {} exit({})", self.id, status);

        let records: Vec<MmapRecord> = self.mmaps.lock().unwrap().drain(..).collect();
        for record in records {
            self.do_munmap(record);
        }

        let addrs = self.vm.lock().unwrap().addresses();
        for va in addrs {
            let vme = match self.vm.lock().unwrap().delete(va) {
                Some(v) => v,
                None => continue,
            };
            if vme.is_loaded {
                if let Some(pte) = self.pd.lock().unwrap().clear_page(va) {
                    self.mm.free_page(pte.kaddr);
                }
            }
            if let Some(slot) = vme.swap_slot {
                self.mm.swap.release(slot);
            }
        }

        for image in self.images.lock().unwrap().drain(..) {
            image.close(&self.fs);
        }
        let files: Vec<_> = self.files.lock().unwrap().drain(..).collect();
        for file in files.into_iter().flatten() {
            file.close(&self.fs);
        }
        if let Some(cwd) = self.cwd.lock().unwrap().take() {
            cwd.close(&self.fs);
        }
    }
}
