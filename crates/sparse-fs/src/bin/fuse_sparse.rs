//! fuse-sparse: Mount a sparse image as a single raw image file.
//!
//! The decoded image appears over an existing regular file, which can then
//! be loop-mounted or copied like any raw image.
//!
//! # Usage
//!
//! ```bash
//! touch /tmp/system.raw
//! fuse-sparse system.img /tmp/system.raw -o allow_other
//! mount -o loop,ro /tmp/system.raw /mnt/system
//! ```

use clap::{ArgAction, CommandFactory, Parser};
use env_logger::Env;
use log::{error, info};
use sparse_fs::fuse::{self, MountConfig};
use sparse_fs::{MountSession, SourceDescriptor, SparseFs};
use std::io;
use std::path::{Path, PathBuf};
use std::process;

const MOUNT_OPTIONS_HELP: &str = "\
Mount options:
  Values given with -o are passed through to FUSE and the kernel; unknown
  options are forwarded unchanged. The mount is always read-only, so 'rw'
  is rejected. Commonly used:
    allow_other, allow_root, auto_unmount, default_permissions,
    nodev, nosuid, noexec, noatime, fsname=NAME, subtype=NAME
  See mount.fuse(8) for the full list.";

/// Mount a sparse image as a read-only raw image file.
#[derive(Parser, Debug)]
#[command(name = "fuse-sparse")]
#[command(author, version, about, long_about = None)]
#[command(override_usage = "fuse-sparse <sparse file> <target file> [options]")]
#[command(after_help = MOUNT_OPTIONS_HELP)]
#[command(disable_help_flag = true)]
struct Args {
    /// Path to the sparse image
    #[arg(value_name = "SPARSE_FILE")]
    source: Option<PathBuf>,

    /// Existing regular file to mount the decoded image over
    #[arg(value_name = "TARGET_FILE")]
    target: Option<PathBuf>,

    /// Comma-separated list of mount options, passed through to FUSE
    #[arg(short = 'o', value_name = "OPT[,OPT...]", action = ArgAction::Append)]
    options: Vec<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Show this help message
    #[arg(short = 'h', long = "help", action = ArgAction::SetTrue)]
    help: bool,
}

fn main() {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_timestamp_millis()
        .init();

    process::exit(run(args, SourceDescriptor::open));
}

/// Validate the arguments, open the source and mount it. Returns the exit
/// status.
///
/// `open_source` is only called once the arguments and mount options are
/// known to be usable.
fn run<F>(args: Args, open_source: F) -> i32
where
    F: FnOnce(&Path) -> io::Result<SourceDescriptor>,
{
    if args.help {
        // Display-only run: nothing is opened or mounted.
        if let Err(e) = Args::command().print_help() {
            eprintln!("{}", e);
            return 1;
        }
        return 0;
    }

    let Some(source) = args.source else {
        error!("Missing source file");
        return 1;
    };
    let Some(target) = args.target else {
        error!("Missing target file (mount point) parameter");
        return 1;
    };

    let config = match MountConfig::new(source.to_string_lossy()).with_options(args.options.as_slice()) {
        Ok(c) => c,
        Err(e) => {
            error!("{}", e);
            return 1;
        }
    };

    // Held open until unmount; handles reopen it through its descriptor path.
    let descriptor = match open_source(&source) {
        Ok(d) => d,
        Err(e) => {
            error!("{}: Failed to open: {}", source.display(), e);
            return 1;
        }
    };

    // The failure is logged with its path where it happens.
    let session = match MountSession::discover(descriptor.path()) {
        Ok(s) => s,
        Err(_) => return 1,
    };

    info!(
        "Mounting {} ({} bytes) at {}",
        descriptor.original_path().display(),
        session.logical_size(),
        target.display()
    );

    if let Err(e) = fuse::mount(SparseFs::new(session), &target, &config) {
        error!("{}: {}", target.display(), e);
        return 1;
    }

    info!("Unmounted {}", target.display());
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use tempfile::tempdir;

    fn parse(argv: &[&str]) -> Args {
        Args::try_parse_from(argv.iter().copied()).unwrap()
    }

    /// Run with an opener that records whether it was reached.
    fn run_counting(args: Args) -> (i32, usize) {
        let calls = Cell::new(0);
        let status = run(args, |path| {
            calls.set(calls.get() + 1);
            SourceDescriptor::open(path)
        });
        (status, calls.get())
    }

    #[test]
    fn test_missing_source_exits_without_opening() {
        assert_eq!(run_counting(parse(&["fuse-sparse"])), (1, 0));
    }

    #[test]
    fn test_missing_target_exits_without_opening() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("system.img");
        std::fs::write(&source, b"").unwrap();

        let args = parse(&["fuse-sparse", source.to_str().unwrap()]);
        assert_eq!(run_counting(args), (1, 0));
    }

    #[test]
    fn test_help_exits_zero_without_opening() {
        assert_eq!(run_counting(parse(&["fuse-sparse", "-h"])), (0, 0));
        assert_eq!(
            run_counting(parse(&["fuse-sparse", "/nonexistent/system.img", "--help"])),
            (0, 0)
        );
    }

    #[test]
    fn test_read_write_option_rejected_before_open() {
        let args = parse(&["fuse-sparse", "/nonexistent/system.img", "/tmp/system.raw", "-o", "rw"]);
        assert_eq!(run_counting(args), (1, 0));
    }

    #[test]
    fn test_unopenable_source_fails() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("missing.img");
        let target = dir.path().join("system.raw");

        let args = parse(&["fuse-sparse", missing.to_str().unwrap(), target.to_str().unwrap()]);
        assert_eq!(run_counting(args), (1, 1));
    }

    #[test]
    fn test_invalid_image_fails_before_mount() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("plain.img");
        std::fs::write(&source, vec![0u8; 4096]).unwrap();
        let target = dir.path().join("system.raw");

        let args = parse(&["fuse-sparse", source.to_str().unwrap(), target.to_str().unwrap()]);
        assert_eq!(run_counting(args), (1, 1));
    }

    #[test]
    fn test_help_describes_option_pass_through() {
        let help = Args::command().render_help().to_string();
        assert!(help.contains("passed through to FUSE"), "{}", help);
        assert!(help.contains("allow_other"), "{}", help);
        assert!(help.contains("'rw'"), "{}", help);
    }
}
