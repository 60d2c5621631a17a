// The system-call boundary: argument validation against the user window,
// descriptor plumbing, console routing, and the mmap surface, all driven the
// way the dispatch glue would drive them.

use std::sync::Arc;

use oxbow::block::MemDisk;
use oxbow::file::File;
use oxbow::param::PGSIZE;
use oxbow::syscall::{syscall, SysNo};
use oxbow::task::Task;
use oxbow::{BootArgs, Kernel};

const SCRATCH: usize = 0x0900_0000; // anonymous page for strings/buffers
const SEG_BASE: usize = 0x0980_0000;
const MAP_BASE: usize = 0x1000_0000;

fn boot() -> (Arc<Kernel>, Arc<Task>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let kernel = Kernel::boot(BootArgs {
        fs_dev: Arc::new(MemDisk::new(4096)),
        swap_dev: Arc::new(MemDisk::new(512)),
        user_pages: 16,
        format: true,
    })
    .unwrap();
    let task = kernel.spawn(None);
    task.map_anon(SCRATCH, 2).unwrap();
    (kernel, task)
}

// Plants a NUL-terminated string in user memory.
fn put_str(task: &Arc<Task>, addr: usize, s: &str) {
    let mut bytes = s.as_bytes().to_vec();
    bytes.push(0);
    task.write_user(addr, &bytes).unwrap();
}

#[test]
fn create_open_write_read_seek() {
    let (kernel, task) = boot();
    let path = SCRATCH;
    let buf = SCRATCH + 256;

    put_str(&task, path, "/notes");
    assert_eq!(syscall(&kernel, &task, SysNo::Create, [path, 0, 0]), 1);
    // Creating the same name again reports failure, not termination.
    assert_eq!(syscall(&kernel, &task, SysNo::Create, [path, 0, 0]), 0);

    let fd = syscall(&kernel, &task, SysNo::Open, [path, 0, 0]);
    assert!(fd >= 2);
    let fd = fd as usize;

    task.write_user(buf, b"0123456789").unwrap();
    assert_eq!(syscall(&kernel, &task, SysNo::Write, [fd, buf, 10]), 10);
    assert_eq!(syscall(&kernel, &task, SysNo::Filesize, [fd, 0, 0]), 10);
    assert_eq!(syscall(&kernel, &task, SysNo::Tell, [fd, 0, 0]), 10);

    assert_eq!(syscall(&kernel, &task, SysNo::Seek, [fd, 4, 0]), 0);
    let out = SCRATCH + 512;
    assert_eq!(syscall(&kernel, &task, SysNo::Read, [fd, out, 6]), 6);
    let mut got = [0u8; 6];
    task.read_user(out, &mut got).unwrap();
    assert_eq!(&got, b"456789");

    assert_eq!(syscall(&kernel, &task, SysNo::Close, [fd, 0, 0]), 0);
    assert_eq!(syscall(&kernel, &task, SysNo::Read, [fd, out, 1]), -1);

    put_str(&task, path, "/notes");
    assert_eq!(syscall(&kernel, &task, SysNo::Remove, [path, 0, 0]), 1);
    assert_eq!(syscall(&kernel, &task, SysNo::Open, [path, 0, 0]), -1);
    assert!(task.exit_status().is_none());
}

#[test]
fn bad_pointer_terminates_task() {
    let (kernel, task) = boot();
    // Below the user window: the task dies with status -1.
    assert_eq!(syscall(&kernel, &task, SysNo::Create, [0x1000, 0, 0]), -1);
    assert_eq!(task.exit_status(), Some(-1));
}

#[test]
fn unmapped_buffer_terminates_task() {
    let (kernel, task) = boot();
    let path = SCRATCH;
    put_str(&task, path, "/f");
    assert_eq!(syscall(&kernel, &task, SysNo::Create, [path, 16, 0]), 1);
    let fd = syscall(&kernel, &task, SysNo::Open, [path, 0, 0]) as usize;
    // In-window address with no page descriptor behind it.
    assert_eq!(
        syscall(&kernel, &task, SysNo::Read, [fd, 0x0B00_0000, 8]),
        -1
    );
    assert_eq!(task.exit_status(), Some(-1));
}

#[test]
fn read_into_readonly_buffer_terminates_task() {
    let (kernel, task) = boot();
    let fs = &kernel.fs;

    fs.create(None, "/img", PGSIZE as u32).unwrap();
    let img = File::open(fs.open(None, "/img").unwrap());
    task.load_segment(&img, 0, SEG_BASE, PGSIZE as u32, 0, false)
        .unwrap();
    img.close(fs);

    let path = SCRATCH;
    put_str(&task, path, "/img");
    let fd = syscall(&kernel, &task, SysNo::Open, [path, 0, 0]) as usize;
    // READ stores into the buffer, so a read-only mapping is a violation.
    assert_eq!(syscall(&kernel, &task, SysNo::Read, [fd, SEG_BASE, 4]), -1);
    assert_eq!(task.exit_status(), Some(-1));
}

#[test]
fn console_round_trip() {
    let (kernel, task) = boot();
    let buf = SCRATCH;

    task.write_user(buf, b"hello, console").unwrap();
    assert_eq!(syscall(&kernel, &task, SysNo::Write, [1, buf, 14]), 14);
    assert_eq!(kernel.console.take_output(), b"hello, console");

    kernel.console.feed_input(b"typed");
    let inbuf = SCRATCH + 64;
    assert_eq!(syscall(&kernel, &task, SysNo::Read, [0, inbuf, 5]), 5);
    let mut got = [0u8; 5];
    task.read_user(inbuf, &mut got).unwrap();
    assert_eq!(&got, b"typed");

    // Writing the input end and reading the output end both fail.
    assert_eq!(syscall(&kernel, &task, SysNo::Write, [0, buf, 1]), -1);
    assert_eq!(syscall(&kernel, &task, SysNo::Read, [1, inbuf, 1]), -1);
}

#[test]
fn exec_and_wait_are_stubs_with_real_validation() {
    let (kernel, task) = boot();
    put_str(&task, SCRATCH, "child");
    assert_eq!(syscall(&kernel, &task, SysNo::Exec, [SCRATCH, 0, 0]), -1);
    assert!(task.exit_status().is_none());
    assert_eq!(syscall(&kernel, &task, SysNo::Wait, [7, 0, 0]), -1);

    let victim = kernel.spawn(None);
    assert_eq!(syscall(&kernel, &victim, SysNo::Exec, [0x10, 0, 0]), -1);
    assert_eq!(victim.exit_status(), Some(-1));
}

#[test]
fn open_null_path_is_plain_failure() {
    let (kernel, task) = boot();
    assert_eq!(syscall(&kernel, &task, SysNo::Open, [0, 0, 0]), -1);
    assert!(task.exit_status().is_none());
}

#[test]
fn mmap_munmap_surface() {
    let (kernel, task) = boot();
    let path = SCRATCH;
    put_str(&task, path, "/m");
    assert_eq!(
        syscall(&kernel, &task, SysNo::Create, [path, 2 * PGSIZE, 0]),
        1
    );
    let fd = syscall(&kernel, &task, SysNo::Open, [path, 0, 0]) as usize;

    let mapid = syscall(&kernel, &task, SysNo::Mmap, [fd, MAP_BASE, 0]);
    assert!(mapid >= 0);
    // Unaligned and null addresses are refused without termination.
    assert_eq!(syscall(&kernel, &task, SysNo::Mmap, [fd, MAP_BASE + 1, 0]), -1);
    assert_eq!(syscall(&kernel, &task, SysNo::Mmap, [fd, 0, 0]), -1);

    task.write_user(MAP_BASE, b"mapped").unwrap();
    assert_eq!(
        syscall(&kernel, &task, SysNo::Munmap, [mapid as usize, 0, 0]),
        0
    );
    assert_eq!(
        syscall(&kernel, &task, SysNo::Munmap, [mapid as usize, 0, 0]),
        -1
    );

    let out = SCRATCH + 128;
    assert_eq!(syscall(&kernel, &task, SysNo::Seek, [fd, 0, 0]), 0);
    assert_eq!(syscall(&kernel, &task, SysNo::Read, [fd, out, 6]), 6);
    let mut got = [0u8; 6];
    task.read_user(out, &mut got).unwrap();
    assert_eq!(&got, b"mapped");
}

#[test]
fn exit_and_halt() {
    let (kernel, task) = boot();
    assert_eq!(syscall(&kernel, &task, SysNo::Exit, [3, 0, 0]), 3);
    assert_eq!(task.exit_status(), Some(3));

    assert_eq!(syscall(&kernel, &task, SysNo::Halt, [0, 0, 0]), 0);
    assert!(kernel.is_halted());
}

#[test]
fn child_inherits_working_directory() {
    let (kernel, parent) = boot();
    let fs = &kernel.fs;
    fs.mkdir(None, "/home").unwrap();
    fs.create(None, "/home/f", 4).unwrap();
    parent.chdir("/home").unwrap();

    let child = kernel.spawn(Some(&parent));
    child.map_anon(SCRATCH, 1).unwrap();
    put_str(&child, SCRATCH, "f");
    let fd = syscall(&kernel, &child, SysNo::Open, [SCRATCH, 0, 0]);
    assert!(fd >= 2, "relative open in inherited cwd failed");
    child.exit(0);
    parent.exit(0);
}
