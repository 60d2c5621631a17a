// Swap manager.
//
// The swap device is carved into page-sized slots of 8 consecutive sectors.
// A bitmap tracks allocation: a set bit is an occupied slot. The swap lock
// covers both the bitmap flip and the device transfer, so slot contents are
// never observed half-written.

use std::sync::{Arc, Mutex};

use log::debug;

use crate::bitmap::Bitmap;
use crate::block::BlockDevice;
use crate::error::{Error, Result};
use crate::palloc::{Kaddr, PagePool};
use crate::param::{SECTORS_PER_PAGE, SECTOR_SIZE, SWAP_SLOTS};

pub struct Swap {
    dev: Arc<dyn BlockDevice>,
    bits: Mutex<Bitmap>, // set bit = slot in use
}

impl Swap {
    pub fn new(dev: Arc<dyn BlockDevice>) -> Self {
        let slots = SWAP_SLOTS.min(dev.capacity() as usize / SECTORS_PER_PAGE);
        Self {
            dev,
            bits: Mutex::new(Bitmap::new(slots)),
        }
    }

    /// Copies the frame at `kaddr` out to a fresh slot and returns it.
    pub fn swap_out(&self, pool: &PagePool, kaddr: Kaddr) -> Result<usize> {
        let mut bits = self.bits.lock().unwrap();
        let slot = bits.scan_and_set(0).ok_or(Error::SwapFull)?;
        pool.with_page(kaddr, |page| {
            let mut sec = [0u8; SECTOR_SIZE];
            for i in 0..SECTORS_PER_PAGE {
                sec.copy_from_slice(&page[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE]);
                self.dev
                    .write((slot * SECTORS_PER_PAGE + i) as u32, &sec);
            }
        });
        debug!("swap out -> slot {}", slot);
        Ok(slot)
    }

    /// Reads `slot` back into the frame at `kaddr` and frees the slot.
    pub fn swap_in(&self, pool: &PagePool, slot: usize, kaddr: Kaddr) {
        let mut bits = self.bits.lock().unwrap();
        assert!(bits.test(slot), "swapping in a free slot");
        pool.with_page(kaddr, |page| {
            let mut sec = [0u8; SECTOR_SIZE];
            for i in 0..SECTORS_PER_PAGE {
                self.dev.read((slot * SECTORS_PER_PAGE + i) as u32, &mut sec);
                page[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE].copy_from_slice(&sec);
            }
        });
        bits.clear(slot);
        debug!("swap in <- slot {}", slot);
    }

    /// Frees a slot whose page descriptor went away without being read back
    /// (task teardown).
    pub fn release(&self, slot: usize) {
        let mut bits = self.bits.lock().unwrap();
        assert!(bits.test(slot), "releasing a free slot");
        bits.clear(slot);
    }

    pub fn slots_in_use(&self) -> usize {
        self.bits.lock().unwrap().count_set()
    }

    pub fn slot_count(&self) -> usize {
        self.bits.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemDisk;
    use crate::palloc::PallocFlags;
    use crate::param::PGSIZE;

    #[test]
    fn out_in_roundtrip() {
        let pool = PagePool::new(2);
        let swap = Swap::new(Arc::new(MemDisk::new(64)));
        assert_eq!(swap.slot_count(), 8);

        let a = pool.get_page(PallocFlags::ZERO).unwrap();
        pool.with_page(a, |p| {
            p[0] = 0xDE;
            p[PGSIZE - 1] = 0xAD;
        });
        let slot = swap.swap_out(&pool, a).unwrap();
        assert_eq!(swap.slots_in_use(), 1);

        let b = pool.get_page(PallocFlags::ZERO).unwrap();
        swap.swap_in(&pool, slot, b);
        assert_eq!(swap.slots_in_use(), 0);
        pool.with_page(b, |p| {
            assert_eq!(p[0], 0xDE);
            assert_eq!(p[PGSIZE - 1], 0xAD);
        });
    }

    #[test]
    fn fills_up() {
        let pool = PagePool::new(1);
        let swap = Swap::new(Arc::new(MemDisk::new(2 * SECTORS_PER_PAGE as u32)));
        let a = pool.get_page(PallocFlags::ZERO).unwrap();
        swap.swap_out(&pool, a).unwrap();
        swap.swap_out(&pool, a).unwrap();
        assert!(matches!(swap.swap_out(&pool, a), Err(Error::SwapFull)));
    }
}
