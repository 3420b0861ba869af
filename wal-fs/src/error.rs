#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    AlreadyExists,
    NotFound,
    NotADirectory,
    IsADirectory,
    DirectoryNotEmpty,
    /// 硬链接跨越设备
    CrossDevice,
    /// 符号链接解析超出深度上限
    TooManyLinks,
    NameTooLong,
    /// 数据块耗尽
    NoSpace,
    /// 磁盘 inode 耗尽
    NoInodes,
    /// 写入偏移越过文件末尾，或长度溢出
    BadOffset,
    /// 超出单个文件的容量上限
    FileTooLarge,
    /// 超级块校验失败
    BadMagic,
    NotReadable,
    NotWritable,
    InvalidPath,
}

pub type Result<T> = core::result::Result<T, Error>;
