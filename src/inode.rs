// Inode store.
//
// An inode describes one unnamed file or directory and occupies exactly one
// sector. Its index has three tiers: 123 direct sector slots, one indirect
// block of 128 slots, and one double-indirect block whose 128 slots each
// name another indirect block. A slot holding all-ones is unallocated; a
// fresh inode or index block is initialized by filling it with 0xFF bytes,
// so every slot starts out empty.
//
// The crate keeps a table of open inodes so that opening the same sector
// twice yields the same in-memory object. The in-memory inode carries only
// bookkeeping (open count, removed flag, write-denial count); the length and
// index live on disk and are fetched through the buffer cache on every
// operation.
//
// A typical sequence is:
//   let ip = fs.itable.open(sector);
//   inode::write_at(fs, &ip, data, off);
//   fs.itable.close(fs, ip);
//
// The per-inode extend lock is held for the whole of read_at/write_at, so a
// reader never observes a file mid-extension.

use std::mem::size_of;
use std::sync::{Arc, Mutex};

use log::debug;
use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use crate::block::SectorId;
use crate::error::Result;
use crate::fs::FileSys;
use crate::param::{INODE_MAGIC, MAX_FILE_SIZE, NDIRECT, NINDIRECT, SECTOR_SIZE};

/// An unallocated index slot reads as all-ones.
pub const SECTOR_NONE: u32 = u32::MAX;

// On-disk inode. Field order and widths are part of the disk format.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct DiskInode {
    length: i32, // file size in bytes
    magic: u32,
    is_dir: u32,
    direct: [u32; NDIRECT],
    indirect: u32,
    double_indirect: u32,
}

const_assert!(size_of::<DiskInode>() == SECTOR_SIZE);

// One sector of sector numbers.
#[repr(C)]
#[derive(AsBytes, FromBytes)]
struct IndirectBlock {
    slots: [u32; NINDIRECT],
}

const_assert!(size_of::<IndirectBlock>() == SECTOR_SIZE);

impl IndirectBlock {
    fn zeroed() -> Self {
        Self {
            slots: [0; NINDIRECT],
        }
    }

    fn all_ones() -> Self {
        Self {
            slots: [SECTOR_NONE; NINDIRECT],
        }
    }
}

// Where a byte position lands in the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Location {
    Direct(usize),
    Indirect(usize),
    Double(usize, usize),
    OutOfRange,
}

fn locate(pos: u32) -> Location {
    let s = pos as usize / SECTOR_SIZE;
    if s < NDIRECT {
        Location::Direct(s)
    } else if s < NDIRECT + NINDIRECT {
        Location::Indirect(s - NDIRECT)
    } else if s < NDIRECT + NINDIRECT + NINDIRECT * NINDIRECT {
        let s = s - NDIRECT - NINDIRECT;
        Location::Double(s / NINDIRECT, s % NINDIRECT)
    } else {
        Location::OutOfRange
    }
}

fn slot(raw: u32) -> Option<SectorId> {
    (raw != SECTOR_NONE).then(|| raw)
}

struct InodeState {
    open_count: u32,
    removed: bool,
    deny_write_count: u32,
}

/// In-memory inode: bookkeeping for one on-disk inode sector.
pub struct Inode {
    sector: SectorId,
    state: Mutex<InodeState>,
    // Serializes read_at/write_at, and in particular extension against
    // readers of the same inode.
    extend: Mutex<()>,
}

impl Inode {
    pub fn sector(&self) -> SectorId {
        self.sector
    }

    /// Marks the inode for deletion; its sectors are freed once the last
    /// opener closes it.
    pub fn remove(&self) {
        self.state.lock().unwrap().removed = true;
    }

    pub fn is_removed(&self) -> bool {
        self.state.lock().unwrap().removed
    }

    /// Another opener of the same in-memory inode.
    pub fn reopen(self: &Arc<Self>) -> Arc<Inode> {
        self.state.lock().unwrap().open_count += 1;
        Arc::clone(self)
    }

    // Writes are refused while an executable image backed by this inode is
    // mapped. At most one denial per opener.
    pub fn deny_write(&self) {
        let mut st = self.state.lock().unwrap();
        st.deny_write_count += 1;
        assert!(st.deny_write_count <= st.open_count);
    }

    pub fn allow_write(&self) {
        let mut st = self.state.lock().unwrap();
        assert!(st.deny_write_count > 0);
        assert!(st.deny_write_count <= st.open_count);
        st.deny_write_count -= 1;
    }
}

/// Table of open inodes; at most one in-memory inode per sector.
pub struct ITable {
    list: Mutex<Vec<Arc<Inode>>>,
}

impl ITable {
    pub fn new() -> Self {
        Self {
            list: Mutex::new(Vec::new()),
        }
    }

    /// Opens the inode at `sector`, reusing the in-memory object if some
    /// other opener already holds it.
    pub fn open(&self, sector: SectorId) -> Arc<Inode> {
        let mut list = self.list.lock().unwrap();
        for ip in list.iter() {
            if ip.sector == sector {
                ip.state.lock().unwrap().open_count += 1;
                return Arc::clone(ip);
            }
        }
        let ip = Arc::new(Inode {
            sector,
            state: Mutex::new(InodeState {
                open_count: 1,
                removed: false,
                deny_write_count: 0,
            }),
            extend: Mutex::new(()),
        });
        list.push(Arc::clone(&ip));
        ip
    }

    /// Drops one opener. The last close of a removed inode frees every
    /// sector reachable from it, then the inode sector itself.
    pub fn close(&self, fs: &FileSys, inode: Arc<Inode>) {
        let mut list = self.list.lock().unwrap();
        let (count, removed) = {
            let mut st = inode.state.lock().unwrap();
            st.open_count -= 1;
            (st.open_count, st.removed)
        };
        if count > 0 {
            return;
        }
        list.retain(|ip| !Arc::ptr_eq(ip, &inode));
        drop(list);
        if removed {
            debug!("freeing removed inode at sector {}", inode.sector);
            let disk = get_disk(fs, inode.sector);
            free_sectors(fs, &disk);
            fs.freemap.release(inode.sector, 1);
        }
    }

    #[cfg(test)]
    pub(crate) fn open_inodes(&self) -> usize {
        self.list.lock().unwrap().len()
    }
}

fn get_disk(fs: &FileSys, sector: SectorId) -> DiskInode {
    let mut disk = DiskInode {
        length: 0,
        magic: 0,
        is_dir: 0,
        direct: [0; NDIRECT],
        indirect: 0,
        double_indirect: 0,
    };
    fs.cache.read(sector, disk.as_bytes_mut(), 0);
    debug_assert_eq!(disk.magic, INODE_MAGIC, "bad inode at sector {}", sector);
    disk
}

fn put_disk(fs: &FileSys, sector: SectorId, disk: &DiskInode) {
    fs.cache.write(sector, disk.as_bytes(), 0);
}

/// Builds a fresh on-disk inode at `sector`. A nonzero `length` grows the
/// file to cover `[0, length)`, zero-filled.
pub fn create(fs: &FileSys, sector: SectorId, length: u32, is_dir: bool) -> Result<()> {
    let length = length.min(MAX_FILE_SIZE);
    // Start from all-ones so every index slot reads as unallocated.
    let mut disk = DiskInode {
        length: 0,
        magic: INODE_MAGIC,
        is_dir: is_dir as u32,
        direct: [SECTOR_NONE; NDIRECT],
        indirect: SECTOR_NONE,
        double_indirect: SECTOR_NONE,
    };
    let grown = if length > 0 {
        update_length(fs, &mut disk, 0, length - 1)
    } else {
        Ok(())
    };
    put_disk(fs, sector, &disk);
    grown
}

/// File length in bytes.
pub fn length(fs: &FileSys, inode: &Inode) -> u32 {
    get_disk(fs, inode.sector).length.max(0) as u32
}

pub fn is_dir(fs: &FileSys, inode: &Inode) -> bool {
    get_disk(fs, inode.sector).is_dir != 0
}

/// Reads up to `dst.len()` bytes starting at byte `off`. Returns the number
/// of bytes read; short at end of file, and a hole left by a failed
/// extension ends the read early.
pub fn read_at(fs: &FileSys, inode: &Inode, dst: &mut [u8], off: u32) -> usize {
    let _extend = inode.extend.lock().unwrap();
    let disk = get_disk(fs, inode.sector);
    let len = disk.length.max(0) as u32;

    let mut done = 0usize;
    let mut off = off;
    while done < dst.len() && off < len {
        let sector = match byte_to_sector(fs, &disk, off) {
            Some(s) => s,
            None => break,
        };
        let sector_ofs = off as usize % SECTOR_SIZE;
        let chunk = (dst.len() - done)
            .min(SECTOR_SIZE - sector_ofs)
            .min((len - off) as usize);
        if chunk == 0 {
            break;
        }
        fs.cache.read(sector, &mut dst[done..done + chunk], sector_ofs);
        done += chunk;
        off += chunk as u32;
    }
    done
}

/// Writes `src` starting at byte `off`, growing the file when the write
/// lands past the current end. Returns the number of bytes written: zero
/// while writes are denied, short when the device fills up or the write
/// runs past the maximum file size.
pub fn write_at(fs: &FileSys, inode: &Inode, src: &[u8], off: u32) -> usize {
    if inode.state.lock().unwrap().deny_write_count > 0 {
        return 0;
    }
    let _extend = inode.extend.lock().unwrap();
    let mut disk = get_disk(fs, inode.sector);

    // Anything past the index range is silently cut off.
    if off >= MAX_FILE_SIZE || src.is_empty() {
        return 0;
    }
    let size = src.len().min((MAX_FILE_SIZE - off) as usize);
    let write_end = off + size as u32 - 1;

    if i64::from(write_end) > i64::from(disk.length) - 1 {
        let start = disk.length.max(0) as u32;
        if let Err(err) = update_length(fs, &mut disk, start, write_end) {
            debug!("growth to {} failed: {}", write_end + 1, err);
        }
        // Persist the inode even after a failed growth: the enlarged length
        // stays, the missing tail reads as nothing.
        put_disk(fs, inode.sector, &disk);
    }

    let mut done = 0usize;
    let mut off = off;
    while done < size {
        let sector = match byte_to_sector(fs, &disk, off) {
            Some(s) => s,
            None => break,
        };
        let sector_ofs = off as usize % SECTOR_SIZE;
        let length_left = (disk.length.max(0) as u32 - off) as usize;
        let chunk = (size - done).min(SECTOR_SIZE - sector_ofs).min(length_left);
        if chunk == 0 {
            break;
        }
        fs.cache.write(sector, &src[done..done + chunk], sector_ofs);
        done += chunk;
        off += chunk as u32;
    }
    done
}

// Maps byte `pos` to its data sector, walking the index blocks through the
// cache. Nothing is allocated here; a miss means the position was never
// grown (or its extension failed part-way).
fn byte_to_sector(fs: &FileSys, disk: &DiskInode, pos: u32) -> Option<SectorId> {
    if i64::from(pos) >= i64::from(disk.length) {
        return None;
    }
    match locate(pos) {
        Location::Direct(i) => slot(disk.direct[i]),
        Location::Indirect(i) => {
            let first = read_indirect(fs, slot(disk.indirect)?);
            slot(first.slots[i])
        }
        Location::Double(i, j) => {
            let first = read_indirect(fs, slot(disk.double_indirect)?);
            let second = read_indirect(fs, slot(first.slots[i])?);
            slot(second.slots[j])
        }
        Location::OutOfRange => None,
    }
}

fn read_indirect(fs: &FileSys, sector: SectorId) -> IndirectBlock {
    let mut block = IndirectBlock::zeroed();
    fs.cache.read(sector, block.as_bytes_mut(), 0);
    block
}

fn write_indirect(fs: &FileSys, sector: SectorId, block: &IndirectBlock) {
    fs.cache.write(sector, block.as_bytes(), 0);
}

// Installs `new_sector` into the index at `loc`, allocating and initializing
// indirect scaffolding as needed.
fn register_sector(fs: &FileSys, disk: &mut DiskInode, new_sector: SectorId, loc: Location) -> Result<()> {
    match loc {
        Location::Direct(i) => {
            disk.direct[i] = new_sector;
        }
        Location::Indirect(i) => match slot(disk.indirect) {
            Some(first_sec) => {
                let mut first = read_indirect(fs, first_sec);
                first.slots[i] = new_sector;
                write_indirect(fs, first_sec, &first);
            }
            None => {
                let first_sec = fs.freemap.allocate(1)?;
                disk.indirect = first_sec;
                let mut first = IndirectBlock::all_ones();
                first.slots[i] = new_sector;
                write_indirect(fs, first_sec, &first);
            }
        },
        Location::Double(i, j) => {
            let first_sec = match slot(disk.double_indirect) {
                Some(s) => s,
                None => {
                    let s = fs.freemap.allocate(1)?;
                    disk.double_indirect = s;
                    write_indirect(fs, s, &IndirectBlock::all_ones());
                    s
                }
            };
            let mut first = read_indirect(fs, first_sec);
            let second_sec = match slot(first.slots[i]) {
                Some(s) => s,
                None => {
                    let s = fs.freemap.allocate(1)?;
                    first.slots[i] = s;
                    write_indirect(fs, first_sec, &first);
                    write_indirect(fs, s, &IndirectBlock::all_ones());
                    s
                }
            };
            let mut second = read_indirect(fs, second_sec);
            second.slots[j] = new_sector;
            write_indirect(fs, second_sec, &second);
        }
        Location::OutOfRange => unreachable!("register past index range"),
    }
    Ok(())
}

// Grows the file so every byte of [start, end] (inclusive) is backed: the
// length becomes end+1 and a zero-filled sector is allocated at every sector
// boundary in the range. A position mid-sector at `start` is assumed to sit
// in an already-allocated tail sector. On allocation failure the length
// keeps its new value and the sectors grown so far stay; the caller persists
// the inode either way.
fn update_length(fs: &FileSys, disk: &mut DiskInode, start: u32, end: u32) -> Result<()> {
    debug_assert!(end >= start || start == 0);
    debug_assert!(end < MAX_FILE_SIZE);
    disk.length = end as i32 + 1;

    let zeros = [0u8; SECTOR_SIZE];
    let mut offset = u64::from(start);
    let end = u64::from(end);
    while offset <= end {
        let sector_ofs = (offset % SECTOR_SIZE as u64) as usize;
        if sector_ofs == 0 {
            let sector = fs.freemap.allocate(1)?;
            register_sector(fs, disk, sector, locate(offset as u32))?;
            fs.cache.write(sector, &zeros, 0);
        }
        offset += (SECTOR_SIZE - sector_ofs) as u64;
    }
    Ok(())
}

// Releases every data and index sector reachable from the inode. Holes are
// skipped, so a partially-grown file still frees everything it got.
fn free_sectors(fs: &FileSys, disk: &DiskInode) {
    for raw in disk.direct.iter() {
        if let Some(s) = slot(*raw) {
            fs.freemap.release(s, 1);
        }
    }
    if let Some(first_sec) = slot(disk.indirect) {
        let first = read_indirect(fs, first_sec);
        for raw in first.slots.iter() {
            if let Some(s) = slot(*raw) {
                fs.freemap.release(s, 1);
            }
        }
        fs.freemap.release(first_sec, 1);
    }
    if let Some(first_sec) = slot(disk.double_indirect) {
        let first = read_indirect(fs, first_sec);
        for raw in first.slots.iter() {
            if let Some(second_sec) = slot(*raw) {
                let second = read_indirect(fs, second_sec);
                for raw in second.slots.iter() {
                    if let Some(s) = slot(*raw) {
                        fs.freemap.release(s, 1);
                    }
                }
                fs.freemap.release(second_sec, 1);
            }
        }
        fs.freemap.release(first_sec, 1);
    }
}
