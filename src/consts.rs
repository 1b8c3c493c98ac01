//! 常量定义

pub mod fs {
    /// 磁盘块大小（字节）
    pub const BSIZE: usize = 1024;

    /// 每个文件系统操作最多写入的块数
    pub const MAXOPBLOCKS: usize = 10;

    /// 磁盘日志最多容纳的数据块数
    pub const LOGSIZE: usize = MAXOPBLOCKS * 3;

    /// 缓冲区缓存的块数
    pub const NBUF: usize = MAXOPBLOCKS * 6;

    /// 缓冲区缓存的哈希桶上限，实际桶数还受活动硬件线程数限制
    pub const NBUCKET: usize = 13;

    /// 内存中活跃索引节点的最大数量
    pub const NINODE: usize = 50;

    pub const NDIRECT: usize = 12;
    pub const NINDIRECT: usize = BSIZE / core::mem::size_of::<u32>();
    pub const NDINDIRECT: usize = NINDIRECT * NINDIRECT;
    pub const MAXFILE: usize = NDIRECT + NINDIRECT + NDINDIRECT;
    pub const MAX_FILE_SIZE: usize = MAXFILE * BSIZE;

    /// 目录项中文件名的固定长度
    pub const DIRSIZ: usize = 28;

    /// 路径名的最大长度，也是符号链接目标的上限
    pub const MAXPATH: usize = 128;

    /// 路径解析时最多解引用的符号链接次数
    pub const NLINK_DEREF: usize = 31;

    /// 每个位图块包含的位数
    pub const BPB: u32 = (BSIZE * 8) as u32;

    pub const FSMAGIC: u32 = 0x10203040;

    /// 根目录的索引节点号
    pub const ROOTINUM: u32 = 1;

    pub const DEFAULT_UID: u16 = 0;
    pub const DEFAULT_GID: u16 = 0;
}

pub mod driver {
    /// 设备主设备号上限
    pub const NDEV: usize = 10;
}
