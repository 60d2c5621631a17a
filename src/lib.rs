// oxbow: the storage and memory subsystem of a small teaching kernel,
// hosted. A write-back buffer cache over a sector device, an inode store
// with a three-tier index and hierarchical directories, and a demand-paged
// virtual memory layer with clock reclaim and backing-store swap.
//
// A Kernel value wires the pieces over a pair of block devices:
//
//   let kernel = Kernel::boot(BootArgs {
//       fs_dev: Arc::new(MemDisk::new(4096)),
//       swap_dev: Arc::new(MemDisk::new(1024)),
//       user_pages: 64,
//       format: true,
//   })?;
//   let task = kernel.spawn(None);
//
// Tasks reach files through the syscall boundary (syscall.rs) or the fs
// layer directly; their memory through read_user/write_user, which demand-
// page against the frame pool. halt() flushes everything back to the
// device.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

pub mod bio;
pub mod bitmap;
pub mod block;
pub mod console;
pub mod dir;
pub mod error;
pub mod file;
pub mod frame;
pub mod freemap;
pub mod fs;
pub mod inode;
pub mod pagedir;
pub mod palloc;
pub mod param;
pub mod swap;
pub mod syscall;
pub mod task;
pub mod vm;

pub use error::{Error, Result};

use block::BlockDevice;
use console::Console;
use frame::MemSys;
use fs::FileSys;
use swap::Swap;
use task::Task;

pub struct BootArgs {
    pub fs_dev: Arc<dyn BlockDevice>,
    pub swap_dev: Arc<dyn BlockDevice>,
    /// Frames in the user pool; exhaustion drives reclaim.
    pub user_pages: usize,
    /// Format a fresh image instead of mounting an existing one.
    pub format: bool,
}

pub struct Kernel {
    pub fs: Arc<FileSys>,
    pub mm: Arc<MemSys>,
    pub console: Console,
    next_tid: AtomicUsize,
    halted: AtomicBool,
}

impl Kernel {
    pub fn boot(args: BootArgs) -> Result<Arc<Kernel>> {
        let fs = FileSys::mount(args.fs_dev, args.format)?;
        let mm = Arc::new(MemSys::new(
            Arc::clone(&fs),
            Swap::new(args.swap_dev),
            args.user_pages,
        ));
        Ok(Arc::new(Kernel {
            fs,
            mm,
            console: Console::new(),
            next_tid: AtomicUsize::new(1),
            halted: AtomicBool::new(false),
        }))
    }

    /// A new task; with a parent, the child starts in the parent's current
    /// directory.
    pub fn spawn(&self, parent: Option<&Arc<Task>>) -> Arc<Task> {
        Task::new(
            self.next_tid.fetch_add(1, Ordering::SeqCst),
            Arc::clone(&self.fs),
            Arc::clone(&self.mm),
            parent.map(|p| &**p),
        )
    }

    /// Flushes the file system; further work is the caller's mistake.
    pub fn halt(&self) {
        if !self.halted.swap(true, Ordering::SeqCst) {
            self.fs.shutdown();
        }
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }
}
