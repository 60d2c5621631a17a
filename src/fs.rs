// File system assembly. Five layers:
//   - Sectors: the raw device, reached only through the buffer cache.
//   - Free map: allocator for raw sectors, persistent in its own inode.
//   - Inodes: file metadata and the multi-level index.
//   - Directories: inodes whose contents are name/sector entries.
//   - Names: paths like /d1/d2/f resolved to (parent directory, leaf).
//
// This file wires the layers into a mountable FileSys value and carries the
// name-level operations. The lower-level routines live in bio.rs, freemap.rs,
// inode.rs and dir.rs; the system-call surface is in syscall.rs.

use std::sync::{Arc, Mutex};

use log::info;

use crate::bio::BufferCache;
use crate::block::BlockDevice;
use crate::dir::{self, Dir};
use crate::error::{Error, Result};
use crate::freemap::FreeMap;
use crate::inode::{self, ITable, Inode};
use crate::param::{DIR_INIT_ENTRIES, FREE_MAP_SECTOR, PATH_MAX, ROOT_DIR_SECTOR};

pub struct FileSys {
    pub cache: BufferCache,
    pub freemap: FreeMap,
    pub itable: ITable,
    // Global file-system lock: the syscall layer holds it across any file
    // operation that reaches the buffer cache, and reclaim holds it while
    // writing a file-backed page out.
    pub lock: Mutex<()>,
}

impl FileSys {
    /// Mounts the file system on `dev`, formatting a fresh image first when
    /// `format` is set.
    pub fn mount(dev: Arc<dyn BlockDevice>, format: bool) -> Result<Arc<FileSys>> {
        let capacity = dev.capacity();
        let fs = Arc::new(FileSys {
            cache: BufferCache::new(dev),
            freemap: FreeMap::new(capacity),
            itable: ITable::new(),
            lock: Mutex::new(()),
        });
        if format {
            fs.format()?;
        } else {
            fs.freemap_load();
        }
        info!(
            "mounted {} sectors, {} free",
            capacity,
            fs.freemap.free_count()
        );
        Ok(fs)
    }

    // Builds a fresh image: free map with the reserved sectors taken, an
    // empty root directory holding "." and "..", and the free-map inode
    // written last so its content reflects every allocation made here.
    fn format(&self) -> Result<()> {
        info!("formatting file system");
        self.freemap.format(ROOT_DIR_SECTOR + 1);
        dir::create(self, ROOT_DIR_SECTOR, DIR_INIT_ENTRIES)?;
        let root = Dir::open_root(self);
        let linked = root
            .add(self, ".", ROOT_DIR_SECTOR)
            .and_then(|_| root.add(self, "..", ROOT_DIR_SECTOR));
        root.close(self);
        linked?;
        inode::create(self, FREE_MAP_SECTOR, self.freemap.byte_len(), false)?;
        self.freemap_store();
        Ok(())
    }

    fn freemap_load(&self) {
        let ip = self.itable.open(FREE_MAP_SECTOR);
        let len = inode::length(self, &ip);
        assert_eq!(len, self.freemap.byte_len(), "free map does not fit the device");
        let mut bytes = vec![0u8; len as usize];
        let n = inode::read_at(self, &ip, &mut bytes, 0);
        assert_eq!(n as u32, len, "short free map read");
        self.freemap.from_bytes(&bytes);
        self.itable.close(self, ip);
    }

    fn freemap_store(&self) {
        let ip = self.itable.open(FREE_MAP_SECTOR);
        let bytes = self.freemap.to_bytes();
        let n = inode::write_at(self, &ip, &bytes, 0);
        assert_eq!(n, bytes.len(), "short free map write");
        self.itable.close(self, ip);
    }

    /// Writes the free map and every dirty cache entry back, releasing the
    /// device in a state that decodes to the live file system.
    pub fn shutdown(&self) {
        self.freemap_store();
        self.cache.flush_all();
        info!("file system flushed, {} sectors free", self.freemap.free_count());
    }

    // Resolves a path to its parent directory and leaf name. An absolute
    // path starts at the root, anything else at `cwd` (a reopened handle;
    // falling back to the root when the caller has none). Every component
    // before the leaf must exist and be a directory. A path with no
    // components ("/") resolves to (root, ".").
    pub fn resolve_parent(&self, cwd: Option<&Dir>, path: &str) -> Result<(Dir, String)> {
        if path.is_empty() || path.len() > PATH_MAX {
            return Err(Error::InvalidPath);
        }
        let mut dir = if path.starts_with('/') {
            Dir::open_root(self)
        } else {
            match cwd {
                Some(d) => d.reopen(),
                None => Dir::open_root(self),
            }
        };

        let mut tokens = path.split('/').filter(|t| !t.is_empty());
        let mut token = match tokens.next() {
            Some(t) => t,
            None => return Ok((dir, ".".to_string())),
        };
        for lookahead in tokens {
            let ip = match dir.lookup(self, token) {
                Some(ip) => ip,
                None => {
                    dir.close(self);
                    return Err(Error::NotFound);
                }
            };
            if !inode::is_dir(self, &ip) {
                self.itable.close(self, ip);
                dir.close(self);
                return Err(Error::NotDir);
            }
            dir.close(self);
            dir = Dir::open(ip);
            token = lookahead;
        }
        Ok((dir, token.to_string()))
    }

    /// Creates a file of `initial_size` zero bytes at `path`.
    pub fn create(&self, cwd: Option<&Dir>, path: &str, initial_size: u32) -> Result<()> {
        let (parent, name) = self.resolve_parent(cwd, path)?;
        let res = (|| {
            let sector = self.freemap.allocate(1)?;
            inode::create(self, sector, initial_size, false)
                .and_then(|_| parent.add(self, &name, sector))
                .map_err(|err| {
                    // Unwind through the removal path so any sectors the
                    // partial create grabbed go back to the free map.
                    let ip = self.itable.open(sector);
                    ip.remove();
                    self.itable.close(self, ip);
                    err
                })
        })();
        parent.close(self);
        res
    }

    /// Opens the inode named by `path`.
    pub fn open(&self, cwd: Option<&Dir>, path: &str) -> Result<Arc<Inode>> {
        let (parent, name) = self.resolve_parent(cwd, path)?;
        let ip = parent.lookup(self, &name);
        parent.close(self);
        ip.ok_or(Error::NotFound)
    }

    /// Opens `path`, which must name a directory.
    pub fn open_dir(&self, cwd: Option<&Dir>, path: &str) -> Result<Dir> {
        let ip = self.open(cwd, path)?;
        if !inode::is_dir(self, &ip) {
            self.itable.close(self, ip);
            return Err(Error::NotDir);
        }
        Ok(Dir::open(ip))
    }

    /// Unlinks `path`. A file goes away unconditionally (openers keep their
    /// handles until the last close frees the sectors); a directory must be
    /// empty apart from "." and "..", and the root cannot be removed.
    pub fn remove(&self, cwd: Option<&Dir>, path: &str) -> Result<()> {
        let (parent, name) = self.resolve_parent(cwd, path)?;
        let res = (|| {
            let ip = parent.lookup(self, &name).ok_or(Error::NotFound)?;
            let verdict = if inode::is_dir(self, &ip) {
                if ip.sector() == ROOT_DIR_SECTOR {
                    Err(Error::NotEmpty)
                } else {
                    let sub = Dir::open(ip.reopen());
                    let empty = sub.is_empty(self);
                    sub.close(self);
                    if empty {
                        parent.remove(self, &name)
                    } else {
                        Err(Error::NotEmpty)
                    }
                }
            } else {
                parent.remove(self, &name)
            };
            self.itable.close(self, ip);
            verdict
        })();
        parent.close(self);
        res
    }

    /// Creates a directory at `path`, linking its "." and ".." entries.
    pub fn mkdir(&self, cwd: Option<&Dir>, path: &str) -> Result<()> {
        let (parent, name) = self.resolve_parent(cwd, path)?;
        let res = (|| {
            let sector = self.freemap.allocate(1)?;
            let built = dir::create(self, sector, DIR_INIT_ENTRIES)
                .and_then(|_| parent.add(self, &name, sector))
                .and_then(|_| {
                    let nd = Dir::open(self.itable.open(sector));
                    let dots = nd
                        .add(self, ".", sector)
                        .and_then(|_| nd.add(self, "..", parent.sector()));
                    nd.close(self);
                    dots
                });
            built.map_err(|err| {
                let ip = self.itable.open(sector);
                ip.remove();
                self.itable.close(self, ip);
                err
            })
        })();
        parent.close(self);
        res
    }
}
