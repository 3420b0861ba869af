use clap::Parser;
use std::path::PathBuf;

/// 格式化一个 wal-fs 镜像，并可选地把一个目录下的文件导入根目录
#[derive(Parser)]
pub struct Cli {
    /// 输出镜像路径
    #[arg(long, short = 'O')]
    pub image: PathBuf,

    /// 镜像总块数
    #[arg(long, default_value_t = 4096)]
    pub blocks: usize,

    /// inode 总数
    #[arg(long, default_value_t = 512)]
    pub inodes: u32,

    /// 待导入的源目录
    #[arg(long, short)]
    pub source: Option<PathBuf>,
}
