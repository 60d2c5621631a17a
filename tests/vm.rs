// Virtual-memory scenarios: demand paging from an image, clock reclaim
// under memory pressure with the typed eviction policy, swap round trips,
// and mmap writeback.

use std::sync::Arc;

use oxbow::block::MemDisk;
use oxbow::file::File;
use oxbow::param::PGSIZE;
use oxbow::{BootArgs, Kernel};

const SEG_BASE: usize = 0x0900_0000;
const ANON_BASE: usize = 0x0A00_0000;
const MAP_BASE: usize = 0x1000_0000;

fn boot(user_pages: usize) -> Arc<Kernel> {
    let _ = env_logger::builder().is_test(true).try_init();
    Kernel::boot(BootArgs {
        fs_dev: Arc::new(MemDisk::new(4096)),
        swap_dev: Arc::new(MemDisk::new(2048)),
        user_pages,
        format: true,
    })
    .unwrap()
}

// Builds /img with `pages` pages of content, page i filled with marker(i).
fn build_image(kernel: &Kernel, pages: usize, marker: impl Fn(usize) -> u8) -> Arc<File> {
    let fs = &kernel.fs;
    fs.create(None, "/img", 0).unwrap();
    let f = File::open(fs.open(None, "/img").unwrap());
    for i in 0..pages {
        let n = f.write_at(fs, &vec![marker(i); PGSIZE], (i * PGSIZE) as u32);
        assert_eq!(n, PGSIZE);
    }
    f
}

// Reclaim with a dirty image page: under memory pressure a clean image page
// is discarded, but a dirtied one migrates to swap and later reads return
// the written data, not the image's.
#[test]
fn reclaim_migrates_dirty_image_page() {
    let kernel = boot(4);
    let task = kernel.spawn(None);
    let image = build_image(&kernel, 2, |i| [0x11, 0x22][i]);
    task.load_segment(&image, 0, SEG_BASE, (2 * PGSIZE) as u32, 0, true)
        .unwrap();

    // Fault both image pages in, then dirty the first.
    let mut byte = [0u8];
    task.read_user(SEG_BASE, &mut byte).unwrap();
    assert_eq!(byte[0], 0x11);
    task.read_user(SEG_BASE + PGSIZE, &mut byte).unwrap();
    assert_eq!(byte[0], 0x22);
    task.write_user(SEG_BASE, &[0x99]).unwrap();

    // Exhaust physical memory so both image pages get reclaimed.
    task.map_anon(ANON_BASE, 4).unwrap();
    for i in 0..4 {
        task.write_user(ANON_BASE + i * PGSIZE, &[i as u8]).unwrap();
    }
    assert_eq!(kernel.mm.pool.free_frames(), 0);

    // The dirty page can only have survived through the swap device.
    assert!(kernel.mm.swap.slots_in_use() > 0);
    let mut page0 = vec![0u8; PGSIZE];
    task.read_user(SEG_BASE, &mut page0).unwrap();
    assert_eq!(page0[0], 0x99);
    assert!(page0[1..].iter().all(|&b| b == 0x11));

    // The clean page still re-reads from the image.
    task.read_user(SEG_BASE + PGSIZE, &mut byte).unwrap();
    assert_eq!(byte[0], 0x22);

    task.exit(0);
}

// Anonymous pages cycle through swap and come back intact.
#[test]
fn anon_pages_survive_swap_cycles() {
    let kernel = boot(3);
    let task = kernel.spawn(None);

    task.map_anon(ANON_BASE, 6).unwrap();
    for i in 0..6 {
        task.write_user(ANON_BASE + i * PGSIZE, &[0xC0 + i as u8; 64])
            .unwrap();
    }
    // Only 3 frames exist, so walking all six pages forces swap traffic.
    for round in 0..2 {
        for i in 0..6 {
            let mut buf = [0u8; 64];
            task.read_user(ANON_BASE + i * PGSIZE, &mut buf).unwrap();
            assert_eq!(buf, [0xC0 + i as u8; 64], "page {} round {}", i, round);
        }
    }
    assert!(kernel.mm.swap.slots_in_use() > 0);

    // Exit returns every frame and swap slot.
    task.exit(0);
    assert_eq!(kernel.mm.resident_count(), 0);
    assert_eq!(kernel.mm.swap.slots_in_use(), 0);
    assert_eq!(
        kernel.mm.pool.free_frames(),
        kernel.mm.pool.total_frames()
    );
}

// A freshly faulted anonymous page is zero-filled.
#[test]
fn anon_pages_start_zeroed() {
    let kernel = boot(2);
    let task = kernel.spawn(None);
    task.map_anon(ANON_BASE, 1).unwrap();
    let mut buf = vec![0xFFu8; PGSIZE];
    task.read_user(ANON_BASE, &mut buf).unwrap();
    assert!(buf.iter().all(|&b| b == 0));
    task.exit(0);
}

// Mmap round trip: modify one byte per mapped page plus one mid-page byte,
// unmap, and check through ordinary file I/O that exactly those bytes
// changed.
#[test]
fn mmap_writeback_roundtrip() {
    let kernel = boot(8);
    let fs = &kernel.fs;
    let task = kernel.spawn(None);

    let len = 3 * PGSIZE + 100;
    fs.create(None, "/m", 0).unwrap();
    let f = File::open(fs.open(None, "/m").unwrap());
    assert_eq!(f.write_at(fs, &vec![0xAA; len], 0), len);

    let fd = task.add_file(f);
    let mapid = task.mmap(fd, MAP_BASE).unwrap();

    for page in 0..4 {
        task.write_user(MAP_BASE + page * PGSIZE, &[0xBB]).unwrap();
    }
    task.write_user(MAP_BASE + 3 * PGSIZE + 50, &[0xBB]).unwrap();
    task.munmap(mapid).unwrap();

    let check = File::open(fs.open(None, "/m").unwrap());
    let mut data = vec![0u8; len];
    assert_eq!(check.read_at(fs, &mut data, 0), len);
    check.close(fs);

    for (i, &b) in data.iter().enumerate() {
        let modified =
            i % PGSIZE == 0 && i / PGSIZE < 4 || i == 3 * PGSIZE + 50;
        let want = if modified { 0xBB } else { 0xAA };
        assert_eq!(b, want, "byte {}", i);
    }
    task.exit(0);
}

// Mapping over an existing descriptor, an unaligned address, or a null
// address is refused whole: no descriptors are left behind.
#[test]
fn mmap_rejects_bad_requests() {
    let kernel = boot(4);
    let fs = &kernel.fs;
    let task = kernel.spawn(None);

    fs.create(None, "/m", 2 * PGSIZE as u32).unwrap();
    let fd = task.add_file(File::open(fs.open(None, "/m").unwrap()));

    assert!(task.mmap(fd, 0).is_err());
    assert!(task.mmap(fd, MAP_BASE + 5).is_err());
    assert!(task.mmap(999, MAP_BASE).is_err());

    // Collide with the tail of an existing anonymous region.
    task.map_anon(MAP_BASE + PGSIZE, 1).unwrap();
    assert!(task.mmap(fd, MAP_BASE).is_err());
    // The refused map left nothing: the whole range except the anon page
    // is still free to map at a clean address.
    let mapid = task.mmap(fd, MAP_BASE + 4 * PGSIZE).unwrap();
    task.munmap(mapid).unwrap();
    task.exit(0);
}

// munmap(-1) unmaps every mapping the task holds.
#[test]
fn munmap_all() {
    let kernel = boot(8);
    let fs = &kernel.fs;
    let task = kernel.spawn(None);

    fs.create(None, "/a", PGSIZE as u32).unwrap();
    fs.create(None, "/b", PGSIZE as u32).unwrap();
    let fda = task.add_file(File::open(fs.open(None, "/a").unwrap()));
    let fdb = task.add_file(File::open(fs.open(None, "/b").unwrap()));

    task.mmap(fda, MAP_BASE).unwrap();
    task.mmap(fdb, MAP_BASE + 16 * PGSIZE).unwrap();
    task.write_user(MAP_BASE, b"aa").unwrap();
    task.write_user(MAP_BASE + 16 * PGSIZE, b"bb").unwrap();
    task.munmap(-1).unwrap();

    let mut two = [0u8; 2];
    let a = File::open(fs.open(None, "/a").unwrap());
    a.read_at(fs, &mut two, 0);
    assert_eq!(&two, b"aa");
    a.close(fs);
    let b = File::open(fs.open(None, "/b").unwrap());
    b.read_at(fs, &mut two, 0);
    assert_eq!(&two, b"bb");
    b.close(fs);
    task.exit(0);
}

// The frame pool never over-commits: resident pages match the busy frames.
#[test]
fn frame_accounting_balances() {
    let kernel = boot(4);
    let task = kernel.spawn(None);
    task.map_anon(ANON_BASE, 3).unwrap();
    assert_eq!(kernel.mm.resident_count(), 3);
    assert_eq!(kernel.mm.pool.free_frames(), 1);
    task.exit(0);
    assert_eq!(kernel.mm.resident_count(), 0);
    assert_eq!(kernel.mm.pool.free_frames(), 4);
}
