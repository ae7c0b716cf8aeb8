mod logging;

use std::fs::{File, OpenOptions};
use std::os::unix::prelude::FileExt;

use xfat::{
    BIOSParameterBlock, BlockDevice, DeviceReader, FormatOptions, FsError, FsResult, MountFlags,
    MountOptions, NodeHandle, NodeKind, Volume,
};

/// Size of a freshly created image when `--size` is not given.
const DEFAULT_IMAGE_MIB: u64 = 32;

const USAGE: &str = "Usage: xfat-debug [-v] [--format [--fat16] [--size MIB]] [--label LABEL] [--xde] [--ro] <disk_file>";

/// A disk image file as a block device.
#[derive(Debug)]
struct FileDisk {
    file: File,
    len: u64,
}

impl FileDisk {
    fn open(path: &str, writable: bool) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .create(writable)
            .truncate(false)
            .open(path)?;
        let len = file.metadata()?.len();
        Ok(Self { file, len })
    }

    fn set_len(&mut self, len: u64) -> std::io::Result<()> {
        self.file.set_len(len)?;
        self.len = len;
        Ok(())
    }
}

impl BlockDevice for FileDisk {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> FsResult<()> {
        self.file
            .read_exact_at(buf, offset)
            .map_err(|_| FsError::Io)
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> FsResult<()> {
        self.file
            .write_all_at(data, offset)
            .map_err(|_| FsError::Io)
    }

    fn flush(&self) -> FsResult<()> {
        self.file.sync_data().map_err(|_| FsError::Io)
    }
}

#[derive(Debug, Default)]
struct Args {
    disk_file: String,
    verbose: bool,
    format: bool,
    fat16: bool,
    size_mib: Option<u64>,
    label: Option<String>,
    xde: bool,
    read_only: bool,
}

fn parse_args() -> Option<Args> {
    let mut args = Args::default();
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-v" => args.verbose = true,
            "--format" => args.format = true,
            "--fat16" => args.fat16 = true,
            "--size" => args.size_mib = Some(iter.next()?.parse().ok()?),
            "--label" => args.label = Some(iter.next()?),
            "--xde" => args.xde = true,
            "--ro" => args.read_only = true,
            flag if flag.starts_with('-') => return None,
            _ if args.disk_file.is_empty() => args.disk_file = arg,
            _ => return None,
        }
    }
    (!args.disk_file.is_empty()).then_some(args)
}

fn main() {
    let Some(args) = parse_args() else {
        eprintln!("{USAGE}");
        std::process::exit(1);
    };
    logging::init(args.verbose);

    if let Err(err) = run(&args) {
        log::error!("{err} (errno {})", err.errno());
        std::process::exit(1);
    }
}

fn run(args: &Args) -> FsResult<()> {
    let writable = args.format || (!args.read_only && args.label.is_some());
    let mut disk = FileDisk::open(&args.disk_file, writable).map_err(|err| {
        log::error!("failed to open {}: {err}", args.disk_file);
        FsError::Io
    })?;

    if args.format {
        let size_mib = args
            .size_mib
            .or((disk.len == 0).then_some(DEFAULT_IMAGE_MIB));
        if let Some(mib) = size_mib {
            disk.set_len(mib * 1024 * 1024).map_err(|_| FsError::Io)?;
        }
        let mut options = if args.fat16 {
            FormatOptions::fat16()
        } else {
            FormatOptions::default()
        };
        if let Some(label) = &args.label {
            options = options.with_label(label)?;
        }
        if args.xde {
            options.xde = Some(xfat::VolumeXde::for_volume_id(options.volume_id));
        }
        let geometry = xfat::format(&disk, &options)?;
        println!("Formatted {}: {geometry:#X?}", args.disk_file);
    }

    let bpb: BIOSParameterBlock =
        xfat::zero_copy_read(&mut DeviceReader::new(&disk, 0)).map_err(|_| FsError::Io)?;
    println!("BIOS parameter block: {bpb:#X?}");

    let mut flags = MountFlags::default();
    flags.set(MountFlags::XDE, args.xde);
    flags.set(MountFlags::READ_ONLY, !writable);
    let volume = Volume::mount(disk, MountOptions::new(flags))?;

    if let (Some(label), false) = (&args.label, args.format) {
        volume.set_volume_label(label)?;
    }

    let status = volume.status()?;
    println!("{status:#?}");

    let root = volume.root()?;
    println!("/");
    list(&volume, root, 1)?;

    volume.into_device()?;
    Ok(())
}

fn list<D: BlockDevice>(volume: &Volume<D>, dir: NodeHandle, depth: usize) -> FsResult<()> {
    let indent = "  ".repeat(depth);
    let mut offset = 0;
    while let Some((entry, next)) = volume.read_dir(dir, offset)? {
        offset = next;
        if entry.name == "." || entry.name == ".." {
            continue;
        }
        let xde = entry.xde;
        match entry.kind {
            NodeKind::Directory => {
                println!(
                    "{indent}{}/  [{}] {:o} {}:{}",
                    entry.name,
                    entry.short_name,
                    xde.perm.mode(),
                    xde.uid,
                    xde.gid
                );
                let child = volume.lookup(dir, &entry.name)?;
                let result = list(volume, child, depth + 1);
                volume.close(child)?;
                result?;
            }
            NodeKind::File => println!(
                "{indent}{}  [{}] {} bytes {:o} {}:{}",
                entry.name,
                entry.short_name,
                entry.size,
                xde.perm.mode(),
                xde.uid,
                xde.gid
            ),
        }
    }
    Ok(())
}
