// Physical page pool.
//
// A fixed budget of 4 KiB frames standing in for user-pool physical memory.
// The frame count is chosen at boot, so exhaustion (and hence reclaim) is a
// configuration away. A frame is addressed by its index; the bytes live
// behind a per-frame mutex.

use std::sync::Mutex;

use bitflags::bitflags;

use crate::param::PGSIZE;

bitflags! {
    pub struct PallocFlags: u32 {
        /// Allocation on behalf of a user page.
        const USER = 1 << 0;
        /// Hand the frame back zero-filled.
        const ZERO = 1 << 1;
    }
}

/// Frame handle: an index into the pool.
pub type Kaddr = usize;

pub struct PagePool {
    frames: Vec<Mutex<Box<[u8; PGSIZE]>>>,
    free: Mutex<Vec<Kaddr>>,
}

impl PagePool {
    pub fn new(count: usize) -> Self {
        Self {
            frames: (0..count).map(|_| Mutex::new(Box::new([0; PGSIZE]))).collect(),
            free: Mutex::new((0..count).rev().collect()),
        }
    }

    /// Grabs a frame, or nothing when the pool is exhausted; the caller is
    /// expected to reclaim and retry.
    pub fn get_page(&self, flags: PallocFlags) -> Option<Kaddr> {
        let kaddr = self.free.lock().unwrap().pop()?;
        if flags.contains(PallocFlags::ZERO) {
            self.frames[kaddr].lock().unwrap().fill(0);
        }
        Some(kaddr)
    }

    pub fn free_page(&self, kaddr: Kaddr) {
        let mut free = self.free.lock().unwrap();
        debug_assert!(!free.contains(&kaddr), "frame freed twice");
        free.push(kaddr);
    }

    /// Runs `f` over the frame's bytes.
    pub fn with_page<R>(&self, kaddr: Kaddr, f: impl FnOnce(&mut [u8; PGSIZE]) -> R) -> R {
        let mut frame = self.frames[kaddr].lock().unwrap();
        f(&mut frame)
    }

    pub fn free_frames(&self) -> usize {
        self.free.lock().unwrap().len()
    }

    pub fn total_frames(&self) -> usize {
        self.frames.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_exhausts_and_recycles() {
        let pool = PagePool::new(2);
        let a = pool.get_page(PallocFlags::USER).unwrap();
        let b = pool.get_page(PallocFlags::USER).unwrap();
        assert!(pool.get_page(PallocFlags::USER).is_none());

        pool.with_page(a, |p| p[0] = 9);
        pool.free_page(a);
        let c = pool.get_page(PallocFlags::USER | PallocFlags::ZERO).unwrap();
        assert_eq!(c, a);
        pool.with_page(c, |p| assert_eq!(p[0], 0));
        pool.free_page(b);
        pool.free_page(c);
        assert_eq!(pool.free_frames(), 2);
    }
}
