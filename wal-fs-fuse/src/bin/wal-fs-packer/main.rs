mod cli;

use std::fs::OpenOptions;
use std::io;
use std::io::Read;
use std::sync::{Arc, Mutex};

use clap::Parser;
use cli::Cli;
use wal_fs::{BlockDevice, FileSystem, OpenFlag, BLOCK_SIZE};
use wal_fs_fuse::BlockFile;

fn main() -> io::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let fd = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&cli.image)?;
    fd.set_len((cli.blocks * BLOCK_SIZE) as u64)?;

    let device: Arc<dyn BlockDevice> = Arc::new(BlockFile(Mutex::new(fd)));
    wal_fs::format(&device, cli.blocks as u32, cli.inodes);

    let fs = FileSystem::mount(device).expect("mounting a freshly formatted image");
    let root = fs.root();

    if let Some(source) = &cli.source {
        for entry in std::fs::read_dir(source)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_str().expect("source file name is not UTF-8");
            println!("import: {name}");

            let mut bytes = Vec::new();
            std::fs::File::open(entry.path())?.read_to_end(&mut bytes)?;

            let path = format!("/{name}");
            let mut file = fs
                .open(&root, path.as_bytes(), OpenFlag::CREATE | OpenFlag::RDWR)
                .expect("creating file in image");
            let written = file.write(&bytes).expect("writing file into image");
            assert_eq!(written, bytes.len(), "image ran out of space");
        }
    }

    fs.release(root);
    Ok(())
}
