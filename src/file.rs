// Open files.
//
// A File is one opener's view of an inode: a byte position that read/write
// advance, plus the write-denial handshake used while an executable image
// backed by the inode is mapped. Independent opens of the same path get
// independent positions over the same inode.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::fs::FileSys;
use crate::inode::{self, Inode};

pub struct File {
    inode: Arc<Inode>,
    pos: Mutex<u32>,
    denied: AtomicBool, // this handle's charge against the inode
}

impl File {
    /// Wraps an opened inode. The inode's open count already accounts for
    /// this handle.
    pub fn open(inode: Arc<Inode>) -> Arc<File> {
        Arc::new(File {
            inode,
            pos: Mutex::new(0),
            denied: AtomicBool::new(false),
        })
    }

    /// A fresh handle on the same inode, position reset to zero.
    pub fn reopen(&self) -> Arc<File> {
        File::open(self.inode.reopen())
    }

    /// Closes the handle, restoring a write denial it charged.
    pub fn close(&self, fs: &FileSys) {
        if self.denied.swap(false, Ordering::SeqCst) {
            self.inode.allow_write();
        }
        fs.itable.close(fs, Arc::clone(&self.inode));
    }

    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    pub fn length(&self, fs: &FileSys) -> u32 {
        inode::length(fs, &self.inode)
    }

    /// Reads at the current position, advancing it by the bytes read.
    pub fn read(&self, fs: &FileSys, dst: &mut [u8]) -> usize {
        let mut pos = self.pos.lock().unwrap();
        let n = inode::read_at(fs, &self.inode, dst, *pos);
        *pos += n as u32;
        n
    }

    /// Writes at the current position, advancing it by the bytes written.
    pub fn write(&self, fs: &FileSys, src: &[u8]) -> usize {
        let mut pos = self.pos.lock().unwrap();
        let n = inode::write_at(fs, &self.inode, src, *pos);
        *pos += n as u32;
        n
    }

    // Positionless transfers; mmap writeback and eviction use these so they
    // never disturb the opener's cursor.
    pub fn read_at(&self, fs: &FileSys, dst: &mut [u8], off: u32) -> usize {
        inode::read_at(fs, &self.inode, dst, off)
    }

    pub fn write_at(&self, fs: &FileSys, src: &[u8], off: u32) -> usize {
        inode::write_at(fs, &self.inode, src, off)
    }

    pub fn seek(&self, pos: u32) {
        *self.pos.lock().unwrap() = pos;
    }

    pub fn tell(&self) -> u32 {
        *self.pos.lock().unwrap()
    }

    /// Refuses writes through any handle while this one is live (or until
    /// allow_write). At most one charge per handle.
    pub fn deny_write(&self) {
        if !self.denied.swap(true, Ordering::SeqCst) {
            self.inode.deny_write();
        }
    }

    pub fn allow_write(&self) {
        if self.denied.swap(false, Ordering::SeqCst) {
            self.inode.allow_write();
        }
    }
}
