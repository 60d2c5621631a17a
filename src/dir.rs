// Directories.
//
// A directory is an inode whose data is a dense array of fixed-size entries.
// Creation writes a run of zeroed (unused) entries; add reuses the first
// free slot and extends the inode only when every slot is taken. The first
// two live entries are conventionally "." and "..", written by the format
// path and mkdir. An entry toggles in and out of use with a single flag
// byte, so readers never see a torn name.

use std::mem::size_of;
use std::sync::{Arc, Mutex};

use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use crate::block::SectorId;
use crate::error::{Error, Result};
use crate::fs::FileSys;
use crate::inode::{self, Inode};
use crate::param::NAME_MAX;

#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
struct DirEntry {
    sector: u32,
    name: [u8; NAME_MAX + 1], // NUL-terminated
    in_use: u8,
}

const ENTRY_SIZE: usize = size_of::<DirEntry>();
const_assert!(ENTRY_SIZE == 20);

impl DirEntry {
    fn zeroed() -> Self {
        Self {
            sector: 0,
            name: [0; NAME_MAX + 1],
            in_use: 0,
        }
    }

    fn new(name: &str, sector: SectorId) -> Self {
        let mut e = Self {
            sector,
            name: [0; NAME_MAX + 1],
            in_use: 1,
        };
        e.name[..name.len()].copy_from_slice(name.as_bytes());
        e
    }

    fn name_matches(&self, name: &str) -> bool {
        let len = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(NAME_MAX + 1);
        &self.name[..len] == name.as_bytes()
    }

    fn name_str(&self) -> String {
        let len = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(NAME_MAX + 1);
        String::from_utf8_lossy(&self.name[..len]).into_owned()
    }
}

/// An open directory: an inode handle plus an iteration cursor.
pub struct Dir {
    inode: Arc<Inode>,
    pos: Mutex<u32>, // readdir cursor, in entries
}

/// Builds a directory inode at `sector` with room for `entry_cnt` entries.
pub fn create(fs: &FileSys, sector: SectorId, entry_cnt: u32) -> Result<()> {
    inode::create(fs, sector, entry_cnt * ENTRY_SIZE as u32, true)
}

impl Dir {
    pub fn open(inode: Arc<Inode>) -> Dir {
        Dir {
            inode,
            pos: Mutex::new(0),
        }
    }

    pub fn open_root(fs: &FileSys) -> Dir {
        Dir::open(fs.itable.open(crate::param::ROOT_DIR_SECTOR))
    }

    /// A second independent handle on the same directory.
    pub fn reopen(&self) -> Dir {
        Dir::open(self.inode.reopen())
    }

    pub fn close(self, fs: &FileSys) {
        fs.itable.close(fs, self.inode);
    }

    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    pub fn sector(&self) -> SectorId {
        self.inode.sector()
    }

    fn entry_count(&self, fs: &FileSys) -> u32 {
        inode::length(fs, &self.inode) / ENTRY_SIZE as u32
    }

    fn read_entry(&self, fs: &FileSys, idx: u32) -> Option<DirEntry> {
        let mut entry = DirEntry::zeroed();
        let off = idx * ENTRY_SIZE as u32;
        let n = inode::read_at(fs, &self.inode, entry.as_bytes_mut(), off);
        (n == ENTRY_SIZE).then(|| entry)
    }

    fn write_entry(&self, fs: &FileSys, idx: u32, entry: &DirEntry) -> Result<()> {
        let off = idx * ENTRY_SIZE as u32;
        let n = inode::write_at(fs, &self.inode, entry.as_bytes(), off);
        if n != ENTRY_SIZE {
            return Err(Error::DiskFull);
        }
        Ok(())
    }

    // Linear scan for a live entry named `name`.
    fn find(&self, fs: &FileSys, name: &str) -> Option<(u32, DirEntry)> {
        for idx in 0..self.entry_count(fs) {
            let entry = self.read_entry(fs, idx)?;
            if entry.in_use != 0 && entry.name_matches(name) {
                return Some((idx, entry));
            }
        }
        None
    }

    /// Opens the inode named `name` in this directory.
    pub fn lookup(&self, fs: &FileSys, name: &str) -> Option<Arc<Inode>> {
        let (_, entry) = self.find(fs, name)?;
        Some(fs.itable.open(entry.sector))
    }

    /// Links `name` to the inode at `sector`. Rejects duplicates; reuses the
    /// first free slot, extending the directory only when none is free.
    pub fn add(&self, fs: &FileSys, name: &str, sector: SectorId) -> Result<()> {
        if name.is_empty() || name.len() > NAME_MAX {
            return Err(Error::NameTooLong);
        }
        if self.find(fs, name).is_some() {
            return Err(Error::Exists);
        }
        let count = self.entry_count(fs);
        let idx = (0..count)
            .find(|&i| matches!(self.read_entry(fs, i), Some(e) if e.in_use == 0))
            .unwrap_or(count);
        self.write_entry(fs, idx, &DirEntry::new(name, sector))
    }

    /// Unlinks `name`: the slot is freed and the inode is marked removed, so
    /// its sectors return to the free map once the last opener closes it.
    pub fn remove(&self, fs: &FileSys, name: &str) -> Result<()> {
        let (idx, mut entry) = self.find(fs, name).ok_or(Error::NotFound)?;
        let victim = fs.itable.open(entry.sector);
        victim.remove();
        entry.in_use = 0;
        // Rewrites an existing slot, so this cannot need to grow.
        let res = self.write_entry(fs, idx, &entry);
        fs.itable.close(fs, victim);
        res
    }

    /// Next entry name, skipping "." and "..". The cursor lives in the
    /// handle, so independent handles iterate independently.
    pub fn readdir(&self, fs: &FileSys) -> Option<String> {
        let mut pos = self.pos.lock().unwrap();
        while *pos < self.entry_count(fs) {
            let entry = self.read_entry(fs, *pos)?;
            *pos += 1;
            if entry.in_use != 0 && !entry.name_matches(".") && !entry.name_matches("..") {
                return Some(entry.name_str());
            }
        }
        None
    }

    /// True when nothing but "." and ".." is left.
    pub fn is_empty(&self, fs: &FileSys) -> bool {
        for idx in 0..self.entry_count(fs) {
            if let Some(entry) = self.read_entry(fs, idx) {
                if entry.in_use != 0 && !entry.name_matches(".") && !entry.name_matches("..") {
                    return false;
                }
            }
        }
        true
    }
}
