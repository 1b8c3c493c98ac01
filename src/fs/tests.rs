use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use super::*;
use crate::consts::driver::NDEV;
use crate::consts::fs::{BSIZE, LOGSIZE, MAXOPBLOCKS, NDIRECT, ROOTINUM};
use crate::error::FsError;
use crate::testing::{self, CrashDisk, FS_BLOCKS, FS_INODES};

fn write_file(fs: &FileSystem, path: &[u8], data: &[u8]) {
    let file = File::open(fs, path, OpenFlags::CREATE | OpenFlags::RDWR, None).unwrap();
    assert_eq!(file.write(data), Ok(data.len()));
}

fn read_file(fs: &FileSystem, path: &[u8]) -> Vec<u8> {
    let file = File::open(fs, path, OpenFlags::empty(), None).unwrap();
    let mut out = Vec::new();
    let mut chunk = [0u8; 700];
    loop {
        let n = file.read(&mut chunk).unwrap();
        if n == 0 {
            break
        }
        out.extend_from_slice(&chunk[..n]);
    }
    out
}

fn inum_of(fs: &FileSystem, path: &[u8]) -> u32 {
    let _tx = fs.transaction();
    let inum = fs.namei(path, None).unwrap().inum();
    inum
}

fn lookup_err(fs: &FileSystem, path: &[u8]) -> Option<FsError> {
    let _tx = fs.transaction();
    let err = fs.namei(path, None).err();
    err
}

fn nlink_of(fs: &FileSystem, path: &[u8]) -> u16 {
    fs.stat(path, None).unwrap().nlink
}

#[test]
fn fresh_volume_has_only_root() {
    let fs = testing::fresh_fs();
    let stat = fs.statfs();
    assert_eq!(stat.size, FS_BLOCKS);
    assert_eq!(stat.ninodes, FS_INODES);
    assert_eq!(stat.free_inodes, FS_INODES - 2);
    assert_eq!(stat.free_blocks, FS_BLOCKS - fs.superblock().data_start() - 1);

    let root = fs.stat(b"/", None).unwrap();
    assert_eq!(root.inum, ROOTINUM);
    assert_eq!(root.itype, InodeType::Directory);
    assert_eq!(root.size, 2 * DIRENT_SIZE as u64);
    assert_eq!(inum_of(fs, b"/.."), ROOTINUM);
}

#[test]
fn rename_parent_while_writing_survives_remount() {
    let disk = testing::formatted_disk();
    let fs = testing::mount(disk);
    fs.mkdir(b"/p", None).unwrap();
    let data: Vec<u8> = (0..3 * BSIZE).map(|i| (i % 251) as u8).collect();

    let file = File::open(fs, b"/p/f", OpenFlags::CREATE | OpenFlags::WRONLY, None).unwrap();
    assert_eq!(file.write(&data[..BSIZE]), Ok(BSIZE));
    fs.rename(b"/p", b"/q", None).unwrap();
    assert_eq!(file.write(&data[BSIZE..]), Ok(2 * BSIZE));
    drop(file);
    assert_eq!(lookup_err(fs, b"/p/f"), Some(FsError::NotFound));

    let fs = testing::mount(disk);
    assert_eq!(read_file(fs, b"/q/f"), data);
}

#[test]
fn indirect_block_is_allocated_once() {
    let fs = testing::fresh_fs();
    let file = File::open(fs, b"/c", OpenFlags::CREATE | OpenFlags::RDWR, None).unwrap();
    let block = [7u8; BSIZE];

    for _ in 0..NDIRECT {
        let free = fs.statfs().free_blocks;
        assert_eq!(file.write(&block), Ok(BSIZE));
        assert_eq!(free - fs.statfs().free_blocks, 1);
    }
    // 第一个落在一级间接范围内的块，连同间接块一起分配
    let free = fs.statfs().free_blocks;
    file.write(&block).unwrap();
    assert_eq!(free - fs.statfs().free_blocks, 2);

    let free = fs.statfs().free_blocks;
    file.write(&block).unwrap();
    assert_eq!(free - fs.statfs().free_blocks, 1);
    assert_eq!(file.stat().size, ((NDIRECT + 2) * BSIZE) as u64);
}

#[test]
fn unlinked_file_lives_until_last_close() {
    let fs = testing::fresh_fs();
    let before = fs.statfs();

    let file = File::open(fs, b"/d", OpenFlags::CREATE | OpenFlags::RDWR, None).unwrap();
    assert_eq!(file.write(&[1u8; 3000]), Ok(3000));
    fs.unlink(b"/d", None).unwrap();
    assert_eq!(lookup_err(fs, b"/d"), Some(FsError::NotFound));

    assert_eq!(file.write(&[2u8; 100]), Ok(100));
    assert_eq!(file.seek(SeekFrom::Start(0)), Ok(0));
    let mut buf = vec![0u8; 4000];
    assert_eq!(file.read(&mut buf), Ok(3100));
    assert!(buf[..3000].iter().all(|&b| b == 1));
    assert!(buf[3000..3100].iter().all(|&b| b == 2));
    assert_eq!(file.stat().nlink, 0);
    assert!(fs.statfs().free_blocks < before.free_blocks);
    assert_eq!(fs.statfs().free_inodes, before.free_inodes - 1);

    drop(file);
    assert_eq!(fs.statfs(), before);
}

#[test]
fn begin_op_waits_for_log_space() {
    let fs = testing::fresh_fs();
    let admitted = LOGSIZE / MAXOPBLOCKS;
    for _ in 0..admitted {
        fs.begin_op();
    }
    assert_eq!(fs.log.status(), (admitted as u32, false, 0));

    let entered = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&entered);
    let waiter = thread::spawn(move || {
        fs.begin_op();
        flag.store(true, Ordering::SeqCst);
        fs.end_op();
    });

    thread::sleep(Duration::from_millis(50));
    assert!(!entered.load(Ordering::SeqCst));
    assert_eq!(fs.log.status().0, admitted as u32);

    for _ in 0..admitted {
        fs.end_op();
    }
    waiter.join().unwrap();
    assert!(entered.load(Ordering::SeqCst));
    assert_eq!(fs.log.status(), (0, false, 0));
}

#[test]
fn concurrent_creates_in_one_directory() {
    let fs = testing::fresh_fs();
    let handles: Vec<_> = (0..4).map(|t| {
        thread::spawn(move || {
            for i in 0..5 {
                let name = format!("/t{}_{}", t, i);
                write_file(fs, name.as_bytes(), name.as_bytes());
            }
        })
    }).collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let root = fs.iget(ROOTINUM);
    let entries = root.lock().read_dir();
    drop(root);
    assert_eq!(entries.len(), 2 + 20);
    for t in 0..4 {
        for i in 0..5 {
            let name = format!("/t{}_{}", t, i);
            assert_eq!(read_file(fs, name.as_bytes()), name.as_bytes());
        }
    }
}

#[test]
fn directories_track_links() {
    let fs = testing::fresh_fs();
    fs.mkdir(b"/d", None).unwrap();
    assert_eq!(fs.mkdir(b"/d", None), Err(FsError::Exists));
    fs.mkdir(b"/d/e", None).unwrap();
    assert_eq!(nlink_of(fs, b"/"), 2);
    assert_eq!(nlink_of(fs, b"/d"), 2);
    assert_eq!(inum_of(fs, b"/d/e/.."), inum_of(fs, b"/d"));

    assert_eq!(fs.unlink(b"/d", None), Err(FsError::NotEmpty));
    assert_eq!(fs.unlink(b"/d/e/..", None), Err(FsError::Invalid));
    let free = fs.statfs();
    fs.unlink(b"/d/e", None).unwrap();
    assert_eq!(nlink_of(fs, b"/d"), 1);
    assert_eq!(fs.statfs().free_inodes, free.free_inodes + 1);
    fs.unlink(b"/d", None).unwrap();
    assert_eq!(nlink_of(fs, b"/"), 1);
    assert_eq!(fs.unlink(b"/d", None), Err(FsError::NotFound));
}

#[test]
fn create_reuses_existing_file() {
    let fs = testing::fresh_fs();
    write_file(fs, b"/f", b"first");
    let inum = inum_of(fs, b"/f");

    let tx = fs.transaction();
    let again = fs.create(b"/f", InodeType::File, 0, 0, None).unwrap();
    assert_eq!(again.inum(), inum);
    assert_eq!(fs.create(b"/f", InodeType::Directory, 0, 0, None).err(), Some(FsError::Exists));
    assert_eq!(fs.create(b"/f/g", InodeType::File, 0, 0, None).err(), Some(FsError::NotDir));
    drop(again);
    drop(tx);
    assert_eq!(read_file(fs, b"/f"), b"first");
}

#[test]
fn hard_links_share_one_inode() {
    let fs = testing::fresh_fs();
    fs.mkdir(b"/dir", None).unwrap();
    write_file(fs, b"/x", b"hi");
    fs.link(b"/x", b"/dir/y", None).unwrap();
    assert_eq!(inum_of(fs, b"/x"), inum_of(fs, b"/dir/y"));
    assert_eq!(nlink_of(fs, b"/x"), 2);

    assert_eq!(fs.link(b"/x", b"/dir/y", None), Err(FsError::Exists));
    assert_eq!(fs.link(b"/x", b"/nope/z", None), Err(FsError::NotFound));
    assert_eq!(fs.link(b"/dir", b"/z", None), Err(FsError::IsDir));
    assert_eq!(nlink_of(fs, b"/x"), 2);

    fs.unlink(b"/x", None).unwrap();
    assert_eq!(nlink_of(fs, b"/dir/y"), 1);
    assert_eq!(read_file(fs, b"/dir/y"), b"hi");
}

#[test]
fn unlinked_name_is_linked_again_in_place() {
    let fs = testing::fresh_fs();
    write_file(fs, b"/a", b"old");
    write_file(fs, b"/b", b"new");
    let size = fs.stat(b"/", None).unwrap().size;

    fs.unlink(b"/a", None).unwrap();
    assert_eq!(lookup_err(fs, b"/a"), Some(FsError::NotFound));
    fs.link(b"/b", b"/a", None).unwrap();

    assert_eq!(fs.stat(b"/", None).unwrap().size, size);
    assert_eq!(inum_of(fs, b"/a"), inum_of(fs, b"/b"));
    assert_eq!(read_file(fs, b"/a"), b"new");

    // "." 与 ".." 之后的第一个空位
    let tx = fs.transaction();
    let root = fs.iget(ROOTINUM);
    let entries = root.lock().read_dir();
    drop(root);
    drop(tx);
    assert_eq!(entries[2].0, DirName::new(b"a"));
    assert_eq!(entries[3].0, DirName::new(b"b"));
}

#[test]
fn link_count_limit_is_reported() {
    let fs = testing::fresh_fs();
    fs.mkdir(b"/d", None).unwrap();
    fs.mkdir(b"/m", None).unwrap();
    write_file(fs, b"/x", b"x");
    for path in [&b"/x"[..], b"/d"] {
        let tx = fs.transaction();
        let inode = fs.namei(path, None).unwrap();
        let mut guard = inode.lock();
        guard.set_nlink(u16::MAX);
        guard.update();
        drop(guard);
        drop(inode);
        drop(tx);
    }
    let before = fs.statfs();

    assert_eq!(fs.link(b"/x", b"/y", None), Err(FsError::TooManyLinks));
    assert_eq!(fs.mkdir(b"/d/e", None), Err(FsError::TooManyLinks));
    assert_eq!(fs.rename(b"/m", b"/d/m", None), Err(FsError::TooManyLinks));

    assert_eq!(nlink_of(fs, b"/x"), u16::MAX);
    assert_eq!(nlink_of(fs, b"/d"), u16::MAX);
    assert_eq!(lookup_err(fs, b"/y"), Some(FsError::NotFound));
    assert_eq!(lookup_err(fs, b"/d/e"), Some(FsError::NotFound));
    assert_eq!(lookup_err(fs, b"/d/m"), Some(FsError::NotFound));
    assert_eq!(inum_of(fs, b"/m/.."), ROOTINUM);
    assert_eq!(fs.statfs(), before);
}

#[test]
fn symlinks_resolve_relative_to_their_directory() {
    let fs = testing::fresh_fs();
    fs.mkdir(b"/s", None).unwrap();
    write_file(fs, b"/s/target", b"data");
    fs.symlink(b"target", b"/s/rel", None).unwrap();
    fs.symlink(b"/s/rel", b"/abs", None).unwrap();

    assert_eq!(read_file(fs, b"/s/rel"), b"data");
    assert_eq!(read_file(fs, b"/abs"), b"data");
    assert_eq!(fs.readlink(b"/s/rel", None), Ok(b"target".to_vec()));
    assert_eq!(fs.readlink(b"/s/target", None), Err(FsError::Invalid));
    assert_eq!(fs.stat(b"/abs", None).unwrap().itype, InodeType::Symlink);
    assert_eq!(fs.symlink(b"x", b"/abs", None), Err(FsError::Exists));

    let target = inum_of(fs, b"/s/target");
    let tx = fs.transaction();
    let cwd = fs.namei(b"/s", None).unwrap();
    assert_eq!(fs.namei_follow(b"rel", Some(&cwd)).unwrap().inum(), target);
    drop(cwd);
    drop(tx);

    fs.symlink(b"/loop", b"/loop", None).unwrap();
    assert_eq!(
        File::open(fs, b"/loop", OpenFlags::empty(), None).err(),
        Some(FsError::TooManyLinks),
    );
}

#[test]
fn rename_moves_directories_between_parents() {
    let fs = testing::fresh_fs();
    fs.mkdir(b"/a", None).unwrap();
    fs.mkdir(b"/c", None).unwrap();
    write_file(fs, b"/a/f", b"payload");
    assert_eq!(nlink_of(fs, b"/"), 3);

    fs.rename(b"/a", b"/c/a", None).unwrap();
    assert_eq!(lookup_err(fs, b"/a"), Some(FsError::NotFound));
    assert_eq!(read_file(fs, b"/c/a/f"), b"payload");
    assert_eq!(inum_of(fs, b"/c/a/.."), inum_of(fs, b"/c"));
    assert_eq!(nlink_of(fs, b"/"), 2);
    assert_eq!(nlink_of(fs, b"/c"), 2);

    write_file(fs, b"/g", b"");
    assert_eq!(fs.rename(b"/g", b"/c/a/f", None), Err(FsError::Exists));
    assert_eq!(fs.rename(b"/missing", b"/z", None), Err(FsError::NotFound));
    assert_eq!(fs.rename(b"/c/a/.", b"/z", None), Err(FsError::Invalid));
    assert_eq!(fs.rename(b"/c", b"/c/c", None), Err(FsError::Invalid));
    fs.rename(b"/g", b"/c/a/g", None).unwrap();
    assert_eq!(nlink_of(fs, b"/c/a/g"), 1);
}

#[test]
fn paths_report_lookup_errors() {
    let fs = testing::fresh_fs();
    fs.mkdir(b"/d", None).unwrap();
    fs.mkdir(b"/d/e", None).unwrap();
    write_file(fs, b"/f", b"");

    assert_eq!(lookup_err(fs, b"/f/x"), Some(FsError::NotDir));
    assert_eq!(lookup_err(fs, b"/missing/x"), Some(FsError::NotFound));
    assert_eq!(lookup_err(fs, b""), Some(FsError::NotFound));
    let e = inum_of(fs, b"/d/e");
    assert_eq!(inum_of(fs, b"//d///e/"), e);

    let tx = fs.transaction();
    assert_eq!(fs.namei_parent(b"/", None).err(), Some(FsError::NotFound));
    let cwd = fs.namei(b"/d", None).unwrap();
    assert_eq!(fs.namei(b"e", Some(&cwd)).unwrap().inum(), e);
    assert_eq!(fs.namei(b"../d/e/..", Some(&cwd)).unwrap().inum(), cwd.inum());
    let (parent, name) = fs.namei_parent(b"e/new", Some(&cwd)).unwrap();
    assert_eq!(parent.inum(), e);
    assert_eq!(name, DirName::new(b"new"));
    drop(parent);
    drop(cwd);
    drop(tx);
}

#[test]
fn permissions_persist_across_remount() {
    let disk = testing::formatted_disk();
    let fs = testing::mount(disk);
    write_file(fs, b"/y", b"");
    let perm = Permissions::USER_READ | Permissions::USER_WRITE;
    fs.set_permissions(b"/y", perm, None).unwrap();

    let fs = testing::mount(disk);
    let stat = fs.stat(b"/y", None).unwrap();
    assert_eq!(stat.perm, perm);
    assert_eq!(stat.itype, InodeType::File);
    assert_eq!(stat.mtime, testing::CLOCK.now());
}

#[test]
fn open_flags_are_enforced() {
    let fs = testing::fresh_fs();
    write_file(fs, b"/y", b"0123456789");

    let ro = File::open(fs, b"/y", OpenFlags::empty(), None).unwrap();
    assert!(ro.readable() && !ro.writable());
    assert_eq!(ro.write(b"x"), Err(FsError::BadAccess));
    let wo = File::open(fs, b"/y", OpenFlags::WRONLY, None).unwrap();
    assert!(!wo.readable() && wo.writable());
    assert_eq!(wo.read(&mut [0u8; 4]), Err(FsError::BadAccess));
    drop(ro);
    drop(wo);

    assert_eq!(File::open(fs, b"/", OpenFlags::WRONLY, None).err(), Some(FsError::IsDir));
    assert_eq!(File::open(fs, b"/nope", OpenFlags::empty(), None).err(), Some(FsError::NotFound));
    assert!(File::open(fs, b"/", OpenFlags::empty(), None).is_ok());

    let file = File::open(fs, b"/y", OpenFlags::RDWR, None).unwrap();
    assert_eq!(file.seek(SeekFrom::End(-4)), Ok(6));
    let mut buf = [0u8; 8];
    assert_eq!(file.read(&mut buf), Ok(4));
    assert_eq!(&buf[..4], b"6789");
    assert_eq!(file.seek(SeekFrom::Current(-100)), Err(FsError::OutOfRange));
    assert_eq!(file.seek(SeekFrom::Start(20)), Ok(20));
    assert_eq!(file.write(b"gap"), Err(FsError::OutOfRange));
    drop(file);

    let file = File::open(fs, b"/y", OpenFlags::WRONLY | OpenFlags::TRUNC, None).unwrap();
    assert_eq!(file.stat().size, 0);
}

fn fill_with_minor(minor: u16, dst: &mut [u8]) -> crate::error::Result<usize> {
    dst.fill(minor as u8);
    Ok(dst.len())
}

fn discard(_minor: u16, src: &[u8]) -> crate::error::Result<usize> {
    Ok(src.len())
}

#[test]
fn device_files_dispatch_to_drivers() {
    let fs = testing::fresh_fs();
    let device = Device { read: fill_with_minor, write: discard };
    assert_eq!(fs.register_device(NDEV as u16, device), Err(FsError::NoDevice));
    fs.register_device(2, device).unwrap();
    fs.mknod(b"/tty", 2, 9, None).unwrap();
    assert_eq!(fs.mknod(b"/tty", 2, 9, None), Err(FsError::Exists));

    fs.mknod(b"/null", 4, 0, None).unwrap();
    assert_eq!(File::open(fs, b"/null", OpenFlags::RDWR, None).err(), Some(FsError::NoDevice));
    fs.register_device(4, device).unwrap();
    assert!(File::open(fs, b"/null", OpenFlags::RDWR, None).is_ok());

    let file = File::open(fs, b"/tty", OpenFlags::RDWR, None).unwrap();
    let mut buf = [0u8; 4];
    assert_eq!(file.read(&mut buf), Ok(4));
    assert_eq!(buf, [9; 4]);
    assert_eq!(file.write(b"abc"), Ok(3));
    assert_eq!(file.seek(SeekFrom::Start(0)), Err(FsError::Invalid));
    assert_eq!(file.stat().itype, InodeType::Device);
    assert_eq!(file.stat().size, 0);
}

/// 移动目录涉及两个父目录、被移动的目录以及各自的 inode，是最能体现原子性的操作
fn move_dir(fs: &FileSystem) {
    fs.rename(b"/a", b"/c/a", None).unwrap();
}

/// 返回初始映像以及日志区之后第一个块的块号
fn base_image() -> (Vec<u8>, u32) {
    let disk = testing::formatted_disk();
    let fs = testing::mount(disk);
    fs.mkdir(b"/a", None).unwrap();
    fs.mkdir(b"/c", None).unwrap();
    write_file(fs, b"/a/f", b"payload");
    (disk.image(), fs.superblock().inodestart)
}

/// 在 `base` 上执行 `op`，允许落盘 `budget` 次写入后断电，
/// 返回断电时与重新挂载之后的磁盘映像，以及 `op` 期间实际落盘的次数。
fn crash_during(base: &[u8], budget: Option<usize>, op: fn(&FileSystem)) -> (Vec<u8>, Vec<u8>, usize) {
    let disk = CrashDisk::leak(FS_BLOCKS as usize);
    disk.restore(base);
    let fs = testing::mount(disk);
    let writes = disk.writes();
    if let Some(budget) = budget {
        disk.crash_after(budget);
    }
    op(fs);
    let written = disk.writes() - writes;
    disk.power_on();
    let crashed = disk.image();
    testing::mount(disk);
    (crashed, disk.image(), written)
}

/// 日志区之后的部分，即每个块的原位置
fn home(image: &[u8], start: u32) -> &[u8] {
    &image[start as usize * BSIZE..]
}

#[test]
fn crash_at_any_write_is_all_or_nothing() {
    let (base, start) = base_image();
    let (_, full, total) = crash_during(&base, None, move_dir);
    assert!(home(&full, start) != home(&base, start));

    let mut committed_at = None;
    for budget in 0..total {
        let (_, recovered, _) = crash_during(&base, Some(budget), move_dir);
        if home(&recovered, start) == home(&full, start) {
            committed_at.get_or_insert(budget);
        } else {
            assert!(committed_at.is_none(), "budget {} rolled back after a commit", budget);
            assert!(home(&recovered, start) == home(&base, start), "budget {} left a partial update", budget);
        }
    }
    // 日志块与日志头写完之后才算提交
    let committed_at = committed_at.unwrap();
    assert!(committed_at > 1 && committed_at < total);

    let disk = CrashDisk::leak(FS_BLOCKS as usize);
    disk.restore(&full);
    let fs = testing::mount(disk);
    assert_eq!(read_file(fs, b"/c/a/f"), b"payload");
    assert_eq!(inum_of(fs, b"/c/a/.."), inum_of(fs, b"/c"));
}

#[test]
fn recovery_is_idempotent() {
    let (base, _) = base_image();
    let (_, _, total) = crash_during(&base, None, move_dir);
    for budget in 0..total {
        let (crashed, recovered, _) = crash_during(&base, Some(budget), move_dir);
        let disk = CrashDisk::leak(FS_BLOCKS as usize);
        disk.restore(&crashed);
        testing::mount(disk);
        testing::mount(disk);
        assert!(disk.image() == recovered, "budget {} differs after a second recovery", budget);
    }
}
