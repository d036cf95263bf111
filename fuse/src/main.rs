use std::{path::PathBuf, process::ExitCode};

use clap::Parser;
use fuser::MountOption;
use log::info;
use pagefs_storage::Storage;

use crate::fs::PageFs;

mod fs;

/// Mount a pagefs volume image.
#[derive(Debug, Parser)]
#[command(name = "pagefs", version)]
struct Args {
    /// Directory to mount the filesystem on
    mountpoint: PathBuf,
    /// Backing volume image, created and formatted if absent
    image: PathBuf,
    /// Unmount automatically when the process exits
    #[arg(long)]
    auto_unmount: bool,
    /// Allow root to access the mounted filesystem
    #[arg(long)]
    allow_root: bool,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let store = match Storage::init(&args.image) {
        Ok(store) => store,
        Err(err) => {
            eprintln!("pagefs: {}: {err}", args.image.display());
            return ExitCode::FAILURE;
        }
    };
    info!("mounting {} on {}", args.image.display(), args.mountpoint.display());

    let mut options = vec![MountOption::FSName("pagefs".to_owned())];
    if args.auto_unmount {
        options.push(MountOption::AutoUnmount);
    }
    if args.allow_root {
        options.push(MountOption::AllowRoot);
    }

    match fuser::mount2(PageFs::new(store), &args.mountpoint, &options) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("pagefs: mount failed: {err}");
            ExitCode::FAILURE
        }
    }
}
