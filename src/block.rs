// Sector devices.
//
// Everything below the buffer cache talks to a BlockDevice: synchronous
// whole-sector reads and writes, no partial transfers, no error reporting.
// A device that cannot complete a transfer panics; the layers above assume
// device I/O is total.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

use crate::error::Result;
use crate::param::SECTOR_SIZE;

pub type SectorId = u32;

pub trait BlockDevice: Send + Sync {
    fn read(&self, sector: SectorId, buf: &mut [u8; SECTOR_SIZE]);
    fn write(&self, sector: SectorId, buf: &[u8; SECTOR_SIZE]);
    /// Device capacity in sectors.
    fn capacity(&self) -> u32;
}

// In-memory device. Backs the test images and the swap device.
pub struct MemDisk {
    sectors: Mutex<Vec<[u8; SECTOR_SIZE]>>,
}

impl MemDisk {
    pub fn new(capacity: u32) -> Self {
        Self {
            sectors: Mutex::new(vec![[0; SECTOR_SIZE]; capacity as usize]),
        }
    }
}

impl BlockDevice for MemDisk {
    fn read(&self, sector: SectorId, buf: &mut [u8; SECTOR_SIZE]) {
        let sectors = self.sectors.lock().unwrap();
        buf.copy_from_slice(&sectors[sector as usize]);
    }

    fn write(&self, sector: SectorId, buf: &[u8; SECTOR_SIZE]) {
        let mut sectors = self.sectors.lock().unwrap();
        sectors[sector as usize].copy_from_slice(buf);
    }

    fn capacity(&self) -> u32 {
        self.sectors.lock().unwrap().len() as u32
    }
}

// Host-file device: a flat image, one sector every SECTOR_SIZE bytes.
pub struct FileDisk {
    img: Mutex<File>,
    capacity: u32,
}

impl FileDisk {
    /// Opens (or creates) an image file of `capacity` sectors.
    pub fn open<P: AsRef<Path>>(path: P, capacity: u32) -> Result<Self> {
        let img = File::options()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        img.set_len(capacity as u64 * SECTOR_SIZE as u64)?;
        Ok(Self {
            img: Mutex::new(img),
            capacity,
        })
    }
}

impl BlockDevice for FileDisk {
    fn read(&self, sector: SectorId, buf: &mut [u8; SECTOR_SIZE]) {
        assert!(sector < self.capacity, "read past device end");
        let mut img = self.img.lock().unwrap();
        img.seek(SeekFrom::Start(sector as u64 * SECTOR_SIZE as u64))
            .expect("seek");
        img.read_exact(buf).expect("sector read");
    }

    fn write(&self, sector: SectorId, buf: &[u8; SECTOR_SIZE]) {
        assert!(sector < self.capacity, "write past device end");
        let mut img = self.img.lock().unwrap();
        img.seek(SeekFrom::Start(sector as u64 * SECTOR_SIZE as u64))
            .expect("seek");
        img.write_all(buf).expect("sector write");
    }

    fn capacity(&self) -> u32 {
        self.capacity
    }
}
