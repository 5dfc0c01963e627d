//! The `bfs-mkfs` tool: formats a device file with a fresh BFS layout
//! (`spec.md` §8's format-and-mount-round-trip scenario).

use std::env;
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;

use bfs_core::config::Config;
use bfs_core::crypto::SecAssociation;
use bfs_core::device::{BlockDevice, FileBlockDevice};
use bfs_core::fs::{AccessControl, AllowAll, Filesystem};
use bfs_core::fs::layout::Layout;

#[derive(Default)]
struct Args {
    prog: String,
    help: bool,
    device_path: Option<PathBuf>,
    config_path: Option<PathBuf>,
    num_inodes: Option<u64>,
    num_data_blocks: Option<u64>,
}

fn parse_args() -> Args {
    let mut args: Args = Default::default();
    let mut iter = env::args();
    args.prog = iter.next().unwrap_or_else(|| "bfs-mkfs".to_owned());

    let mut positional = 0;
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-h" | "--help" => args.help = true,
            "-c" | "--config" => {
                args.config_path = iter.next().map(PathBuf::from);
            }
            "-n" | "--inodes" => {
                args.num_inodes = iter.next().and_then(|v| v.parse().ok());
            }
            "-b" | "--blocks" => {
                args.num_data_blocks = iter.next().and_then(|v| v.parse().ok());
            }
            _ => {
                positional += 1;
                if positional == 1 {
                    args.device_path = Some(PathBuf::from(arg));
                } else {
                    eprintln!("{}: unexpected argument `{}`", args.prog, arg);
                    exit(1);
                }
            }
        }
    }
    args
}

fn print_usage(prog: &str) {
    eprintln!("usage: {prog} [-c config] [-n num-inodes] [-b num-data-blocks] <device-path>");
}

fn main() {
    let args = parse_args();
    if args.help {
        print_usage(&args.prog);
        return;
    }
    let device_path = args.device_path.unwrap_or_else(|| {
        print_usage(&args.prog);
        exit(1);
    });

    let config = match &args.config_path {
        Some(p) => Config::load(p).unwrap_or_else(|e| {
            eprintln!("{}: {}: {}", args.prog, p.display(), e);
            exit(1);
        }),
        None => Config::default(),
    };

    let fs_key = config.fs_sa_key.unwrap_or_else(|| {
        eprintln!("{}: fs_sa.key is not set in the config", args.prog);
        exit(1);
    });

    // A 1 MiB device at the default block size holds 256 blocks total
    // (`spec.md` §8's seed scenario); reserve a handful for the same
    // number of inodes unless the caller asks for something else.
    let num_data_blocks = args.num_data_blocks.unwrap_or(256);
    let num_inodes = args.num_inodes.unwrap_or(256);

    let layout = Layout::new(num_inodes, num_data_blocks);

    let device: Arc<dyn BlockDevice> =
        Arc::new(FileBlockDevice::create(&device_path, layout.total_blocks()).unwrap_or_else(|e| {
            eprintln!("{}: {}: {}", args.prog, device_path.display(), e);
            exit(1);
        }));
    let sa = Arc::new(SecAssociation::new(fs_key));
    let acl: Arc<dyn AccessControl> = Arc::new(AllowAll);

    Filesystem::format(
        device,
        layout,
        sa,
        acl,
        config.cache_sz_limit as usize,
        config.merkle_tree,
        config.paranoid,
    )
    .unwrap_or_else(|e| {
        eprintln!("{}: failed to format {}: {}", args.prog, device_path.display(), e);
        exit(1);
    });

    println!(
        "{}: formatted {} ({} inodes, {} data blocks)",
        args.prog,
        device_path.display(),
        num_inodes,
        num_data_blocks
    );
}
