// Free-sector map.
//
// One bit per device sector; a set bit means the sector is free. The map
// itself is persistent: it is the content of a reserved inode at a fixed
// sector, read at mount and written back at shutdown. While mounted, the
// in-memory bitmap is authoritative.

use std::sync::Mutex;

use log::debug;

use crate::block::SectorId;
use crate::error::{Error, Result};

pub struct FreeMap {
    bits: Mutex<crate::bitmap::Bitmap>,
}

impl FreeMap {
    /// An all-used map sized for a device of `sectors` sectors. Mount fills
    /// it in from disk; format rebuilds it from scratch.
    pub fn new(sectors: u32) -> Self {
        Self {
            bits: Mutex::new(crate::bitmap::Bitmap::new(sectors as usize)),
        }
    }

    /// Rebuilds the map for a fresh image: everything free except the
    /// reserved low sectors (boot, free-map inode, root directory).
    pub fn format(&self, reserved: u32) {
        let mut bits = self.bits.lock().unwrap();
        bits.set_all();
        for s in 0..reserved as usize {
            bits.clear(s);
        }
    }

    /// Allocates `cnt` contiguous sectors, returning the first.
    pub fn allocate(&self, cnt: u32) -> Result<SectorId> {
        let mut bits = self.bits.lock().unwrap();
        match bits.scan_and_clear(0, cnt as usize) {
            Some(start) => Ok(start as SectorId),
            None => {
                debug!("free map exhausted (cnt={})", cnt);
                Err(Error::DiskFull)
            }
        }
    }

    /// Returns `cnt` sectors starting at `start` to the map.
    pub fn release(&self, start: SectorId, cnt: u32) {
        let mut bits = self.bits.lock().unwrap();
        for s in start..start + cnt {
            assert!(!bits.test(s as usize), "releasing a free sector");
            bits.set(s as usize);
        }
    }

    /// Number of free sectors; shutdown and the tests use it.
    pub fn free_count(&self) -> usize {
        self.bits.lock().unwrap().count_set()
    }

    /// Size of the persistent image in bytes.
    pub fn byte_len(&self) -> u32 {
        self.bits.lock().unwrap().as_bytes().len() as u32
    }

    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        self.bits.lock().unwrap().as_bytes().to_vec()
    }

    pub(crate) fn from_bytes(&self, bytes: &[u8]) {
        let mut bits = self.bits.lock().unwrap();
        bits.as_bytes_mut().copy_from_slice(bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_reserves_low_sectors() {
        let map = FreeMap::new(64);
        map.format(3);
        assert_eq!(map.free_count(), 61);
        // First fit starts right after the reserved range.
        assert_eq!(map.allocate(1).unwrap(), 3);
        assert_eq!(map.allocate(2).unwrap(), 4);
        map.release(3, 1);
        assert_eq!(map.allocate(1).unwrap(), 3);
    }

    #[test]
    fn exhaustion_reports_disk_full() {
        let map = FreeMap::new(8);
        map.format(3);
        for _ in 0..5 {
            map.allocate(1).unwrap();
        }
        assert!(matches!(map.allocate(1), Err(Error::DiskFull)));
    }
}
