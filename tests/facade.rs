//! 门面层端到端测试：在临时镜像上走完整的
//! 创建 → 格式化 → 挂载 → 操作 → 卸载生命周期。

use std::path::Path;
use std::path::PathBuf;

use mindfs::{DiskImage, FsError, MindFileSystem, ModeFlag, OpenMode, BLOCK_SIZE};
use tempfile::TempDir;

fn prepare_image(path: &Path, size_mb: u32) {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut disk = DiskImage::new();
    disk.create(path, size_mb).unwrap();
    disk.open(path).unwrap();
    disk.format().unwrap();
    disk.close();
}

fn mounted_fs(size_mb: u32) -> (TempDir, PathBuf, MindFileSystem) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fs.img");
    prepare_image(&path, size_mb);

    let fs = MindFileSystem::new();
    fs.mount(&path).unwrap();
    (dir, path, fs)
}

/// 从 `get_disk_info` 的输出里取一个数值字段。
fn info_value(fs: &MindFileSystem, field: &str) -> u64 {
    let info = fs.get_disk_info().unwrap();
    let line = info
        .lines()
        .find(|line| line.trim_start().starts_with(field))
        .unwrap_or_else(|| panic!("missing field {field} in:\n{info}"));
    line.split(':')
        .nth(1)
        .unwrap()
        .split_whitespace()
        .next()
        .unwrap()
        .parse()
        .unwrap()
}

fn write_new_file(fs: &MindFileSystem, path: &str, data: &[u8]) {
    let fd = fs.open_file(path, OpenMode::Write | OpenMode::Create).unwrap();
    assert_eq!(fs.write_file(fd, data).unwrap(), data.len());
    fs.close_file(fd).unwrap();
}

fn read_whole_file(fs: &MindFileSystem, path: &str) -> Vec<u8> {
    let fd = fs.open_file(path, OpenMode::Read.into()).unwrap();
    let mut content = Vec::new();
    let mut chunk = [0u8; BLOCK_SIZE];
    loop {
        let count = fs.read_file(fd, &mut chunk).unwrap();
        if count == 0 {
            break;
        }
        content.extend_from_slice(&chunk[..count]);
    }
    fs.close_file(fd).unwrap();
    content
}

#[test]
fn fresh_4mb_image_accounting() {
    let (_dir, path, fs) = mounted_fs(4);

    assert_eq!(std::fs::metadata(&path).unwrap().len(), 4 * 1024 * 1024);
    assert!(fs.is_mounted());

    assert_eq!(info_value(&fs, "Total Blocks"), 1024);
    assert_eq!(info_value(&fs, "Block Size"), 4096);
    assert_eq!(info_value(&fs, "Total Inodes"), 128);
    // 根目录占去一个 inode 和一个数据块
    assert_eq!(info_value(&fs, "Free Inodes"), 127);
    assert_eq!(info_value(&fs, "Free Blocks"), 1024 - 7 - 1);
}

#[test]
fn mount_rejects_bad_magic() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fs.img");

    let disk = DiskImage::new();
    disk.create(&path, 1).unwrap();

    let fs = MindFileSystem::new();
    assert_eq!(fs.mount(&path), Err(FsError::Io));
    assert!(!fs.is_mounted());
    // 挂载失败后镜像已被关闭,可以再次尝试
    prepare_image(&path, 1);
    fs.mount(&path).unwrap();
}

#[test]
fn root_reconciliation() {
    let (_dir, _path, fs) = mounted_fs(4);

    let entries = fs.list_directory("/").unwrap();
    let names: Vec<String> = entries.iter().map(|e| e.name()).collect();
    assert_eq!(names, vec![".", ".."]);
    assert!(entries.iter().all(|e| e.inode() == 0));
    assert!(fs.is_directory("/"));
    assert_eq!(fs.find_inode("/").unwrap(), 0);
}

#[test]
fn small_file_round_trip() {
    let (_dir, _path, fs) = mounted_fs(4);

    let inode = fs.create_file("/a.txt", ModeFlag::file_default()).unwrap();
    assert!(inode > 0);
    assert!(fs.file_exists("/a.txt"));

    write_new_file(&fs, "/a.txt", b"hello");
    assert_eq!(read_whole_file(&fs, "/a.txt"), b"hello");
}

#[test]
fn create_refuses_duplicates_and_orphans() {
    let (_dir, _path, fs) = mounted_fs(4);

    fs.create_file("/a.txt", ModeFlag::file_default()).unwrap();
    assert_eq!(
        fs.create_file("/a.txt", ModeFlag::file_default()),
        Err(FsError::AlreadyExists)
    );
    assert_eq!(
        fs.create_file("/no/such/dir/f", ModeFlag::file_default()),
        Err(FsError::NotFound)
    );
}

#[test]
fn cross_block_pattern_round_trip() {
    let (_dir, _path, fs) = mounted_fs(4);

    let data: Vec<u8> = (0..2 * BLOCK_SIZE).map(|i| b'A' + (i % 26) as u8).collect();
    write_new_file(&fs, "/big.bin", &data);
    assert_eq!(read_whole_file(&fs, "/big.bin"), data);
}

#[test]
fn boundary_sizes_round_trip() {
    let (_dir, _path, fs) = mounted_fs(4);

    for (index, size) in [
        0,
        1,
        BLOCK_SIZE - 1,
        BLOCK_SIZE,
        BLOCK_SIZE + 1,
        10 * BLOCK_SIZE,
        11 * BLOCK_SIZE,
    ]
    .into_iter()
    .enumerate()
    {
        let path = format!("/b{index}.bin");
        let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        write_new_file(&fs, &path, &data);
        assert_eq!(read_whole_file(&fs, &path), data, "size {size}");
    }
}

#[test]
fn double_indirect_file_round_trips() {
    // (10 + 1024 + 1) 块,越过一级间接容量
    let (_dir, _path, fs) = mounted_fs(8);

    let size = (10 + 1024 + 1) * BLOCK_SIZE;
    let data: Vec<u8> = (0..size).map(|i| (i % 249) as u8).collect();
    write_new_file(&fs, "/deep.bin", &data);

    let back = read_whole_file(&fs, "/deep.bin");
    assert_eq!(back.len(), data.len());
    assert_eq!(back, data);
}

#[test]
fn overwrite_in_the_middle() {
    let (_dir, _path, fs) = mounted_fs(4);

    write_new_file(&fs, "/f.bin", &vec![0xAA; 3 * BLOCK_SIZE]);

    let fd = fs.open_file("/f.bin", OpenMode::Write.into()).unwrap();
    fs.seek_file(fd, BLOCK_SIZE as i64 - 2).unwrap();
    fs.write_file(fd, &[0xBB; 4]).unwrap();
    fs.close_file(fd).unwrap();

    let back = read_whole_file(&fs, "/f.bin");
    assert_eq!(back.len(), 3 * BLOCK_SIZE);
    assert_eq!(&back[BLOCK_SIZE - 4..BLOCK_SIZE - 2], &[0xAA, 0xAA]);
    assert_eq!(&back[BLOCK_SIZE - 2..BLOCK_SIZE + 2], &[0xBB; 4]);
    assert_eq!(&back[BLOCK_SIZE + 2..BLOCK_SIZE + 4], &[0xAA, 0xAA]);
}

#[test]
fn seek_bounds_and_append() {
    let (_dir, _path, fs) = mounted_fs(4);

    write_new_file(&fs, "/s.txt", b"abc");

    let fd = fs.open_file("/s.txt", OpenMode::Read | OpenMode::Write).unwrap();
    fs.seek_file(fd, 0).unwrap();
    fs.seek_file(fd, 3).unwrap();
    assert_eq!(fs.seek_file(fd, 4), Err(FsError::InvalidArgument));
    assert_eq!(fs.seek_file(fd, -1), Err(FsError::InvalidArgument));
    fs.close_file(fd).unwrap();

    // 追加模式:游标落在文件末尾
    let fd = fs
        .open_file("/s.txt", OpenMode::Write | OpenMode::Append)
        .unwrap();
    fs.write_file(fd, b"def").unwrap();
    fs.close_file(fd).unwrap();
    assert_eq!(read_whole_file(&fs, "/s.txt"), b"abcdef");
}

#[test]
fn mode_flags_are_enforced() {
    let (_dir, _path, fs) = mounted_fs(4);

    assert_eq!(
        fs.open_file("/missing", OpenMode::Read.into()),
        Err(FsError::NotFound)
    );

    // WRITE|CREATE 按默认读写权限补建缺失文件
    let fd = fs
        .open_file("/w.txt", OpenMode::Write | OpenMode::Create)
        .unwrap();
    let mut buf = [0u8; 4];
    assert_eq!(fs.read_file(fd, &mut buf), Err(FsError::InvalidArgument));
    fs.close_file(fd).unwrap();

    let fd = fs.open_file("/w.txt", OpenMode::Read.into()).unwrap();
    assert_eq!(fs.write_file(fd, b"x"), Err(FsError::InvalidArgument));
    fs.close_file(fd).unwrap();

    assert_eq!(fs.read_file(999, &mut buf), Err(FsError::InvalidDescriptor));
    assert_eq!(fs.close_file(999), Err(FsError::InvalidDescriptor));
}

#[test]
fn directory_fill_and_spill() {
    let (_dir, _path, fs) = mounted_fs(4);

    fs.create_directory("/d").unwrap();
    for i in 0..33 {
        fs.create_file(&format!("/d/f{i:03}"), ModeFlag::file_default())
            .unwrap();
    }

    let entries = fs.list_directory("/d").unwrap();
    assert_eq!(entries.len(), 35);

    let names: Vec<String> = entries.iter().map(|e| e.name()).collect();
    assert!(names.contains(&String::from(".")));
    assert!(names.contains(&String::from("..")));
    for i in 0..33 {
        assert!(names.contains(&format!("f{i:03}")), "missing f{i:03}");
    }
}

#[test]
fn nested_directories_resolve() {
    let (_dir, _path, fs) = mounted_fs(4);

    fs.create_directory("/a").unwrap();
    fs.create_directory("/a/b").unwrap();
    write_new_file(&fs, "/a/b/c.txt", b"nested");

    assert_eq!(read_whole_file(&fs, "/a/b/c.txt"), b"nested");
    assert!(fs.is_directory("/a/b"));
    assert!(!fs.is_directory("/a/b/c.txt"));

    // `.` 与 `..` 是货真价实的目录项
    assert_eq!(read_whole_file(&fs, "/a/./b/../b/c.txt"), b"nested");
}

#[test]
fn remove_directory_guards() {
    let (_dir, _path, fs) = mounted_fs(4);

    fs.create_directory("/d").unwrap();
    fs.create_file("/d/f", ModeFlag::file_default()).unwrap();

    assert_eq!(fs.remove_directory("/"), Err(FsError::InvalidArgument));
    assert_eq!(fs.remove_directory("/d"), Err(FsError::DirectoryNotEmpty));
    assert_eq!(fs.remove_directory("/d/f"), Err(FsError::NotADirectory));
    assert_eq!(fs.delete_file("/d"), Err(FsError::IsADirectory));

    fs.delete_file("/d/f").unwrap();
    fs.remove_directory("/d").unwrap();
    assert!(!fs.file_exists("/d"));
}

#[test]
fn delete_restores_free_counters() {
    let (_dir, _path, fs) = mounted_fs(4);

    let free_inodes = info_value(&fs, "Free Inodes");
    let free_blocks = info_value(&fs, "Free Blocks");

    // 20KB = 5 块
    write_new_file(&fs, "/t.bin", &vec![7u8; 20 * 1024]);
    assert_eq!(info_value(&fs, "Free Inodes"), free_inodes - 1);
    assert!(info_value(&fs, "Free Blocks") < free_blocks);

    fs.delete_file("/t.bin").unwrap();
    assert_eq!(info_value(&fs, "Free Inodes"), free_inodes);
    assert_eq!(info_value(&fs, "Free Blocks"), free_blocks);
}

#[test]
fn mkdir_rmdir_restores_free_counters() {
    let (_dir, _path, fs) = mounted_fs(4);

    let free_inodes = info_value(&fs, "Free Inodes");
    let free_blocks = info_value(&fs, "Free Blocks");

    fs.create_directory("/d").unwrap();
    fs.remove_directory("/d").unwrap();

    assert_eq!(info_value(&fs, "Free Inodes"), free_inodes);
    assert_eq!(info_value(&fs, "Free Blocks"), free_blocks);
}

#[test]
fn format_is_idempotent_and_wipes_content() {
    let (_dir, _path, fs) = mounted_fs(4);

    write_new_file(&fs, "/junk.bin", &vec![1u8; 3 * BLOCK_SIZE]);
    fs.create_directory("/d").unwrap();

    fs.format().unwrap();
    assert!(!fs.file_exists("/junk.bin"));
    assert_eq!(fs.list_directory("/").unwrap().len(), 2);
    assert_eq!(info_value(&fs, "Free Inodes"), 127);
    assert_eq!(info_value(&fs, "Free Blocks"), 1016);

    fs.format().unwrap();
    assert_eq!(info_value(&fs, "Free Inodes"), 127);
    assert_eq!(info_value(&fs, "Free Blocks"), 1016);
}

#[test]
fn remount_preserves_live_content() {
    let (_dir, path, fs) = mounted_fs(4);

    write_new_file(&fs, "/keep.txt", b"survives remount");
    fs.create_directory("/d").unwrap();
    write_new_file(&fs, "/d/inner.txt", b"inner");

    let free_inodes = info_value(&fs, "Free Inodes");
    let free_blocks = info_value(&fs, "Free Blocks");
    fs.unmount().unwrap();
    assert!(!fs.is_mounted());

    let fs = MindFileSystem::new();
    fs.mount(&path).unwrap();
    assert_eq!(read_whole_file(&fs, "/keep.txt"), b"survives remount");
    assert_eq!(read_whole_file(&fs, "/d/inner.txt"), b"inner");
    assert_eq!(info_value(&fs, "Free Inodes"), free_inodes);
    assert_eq!(info_value(&fs, "Free Blocks"), free_blocks);
}

#[test]
fn operations_require_a_mount() {
    let fs = MindFileSystem::new();
    assert_eq!(fs.unmount(), Err(FsError::NotMounted));
    assert_eq!(fs.format(), Err(FsError::NotMounted));
    assert_eq!(fs.get_disk_info(), Err(FsError::NotMounted));
    assert_eq!(
        fs.create_file("/a", ModeFlag::file_default()),
        Err(FsError::NotMounted)
    );
    assert!(!fs.file_exists("/a"));
}

#[test]
fn unmount_closes_descriptors_and_releases_lock() {
    let (_dir, path, fs) = mounted_fs(4);

    let fd = fs
        .open_file("/open.txt", OpenMode::Write | OpenMode::Create)
        .unwrap();
    fs.write_file(fd, b"pending").unwrap();
    fs.unmount().unwrap();

    // 描述符随卸载一并失效
    assert_eq!(fs.close_file(fd), Err(FsError::NotMounted));

    // 镜像锁已释放,其它实例可以立即挂载
    let other = MindFileSystem::new();
    other.mount(&path).unwrap();
    assert_eq!(read_whole_file(&other, "/open.txt"), b"pending");
}

#[test]
fn paths_are_normalized() {
    let (_dir, _path, fs) = mounted_fs(4);

    fs.create_directory("/d").unwrap();
    write_new_file(&fs, "/d//file.txt/", b"x");
    assert!(fs.file_exists("\\d\\file.txt"));
    assert!(fs.file_exists("d/file.txt"));

    assert_eq!(fs.get_parent_path("/d/file.txt"), "/d");
    assert_eq!(fs.get_basename("/d/file.txt"), "file.txt");
}

#[test]
fn invalid_paths_are_rejected() {
    let (_dir, _path, fs) = mounted_fs(4);

    assert_eq!(
        fs.create_file("/bad\nname", ModeFlag::file_default()),
        Err(FsError::PathInvalid)
    );
    assert_eq!(
        fs.open_file("/bad\rname", OpenMode::Write | OpenMode::Create),
        Err(FsError::PathInvalid)
    );
}
