//! FUSE adapter implementation for sparse images.
//!
//! This module implements the `fuser::Filesystem` trait for `SparseFuseFS`,
//! forwarding each request to [`SparseFs`] and replying with its errno.
//! Reads are answered from a pool of worker threads.

use super::options::MountConfig;
use crate::error::FsError;
use crate::fs::{FileStat, SparseFs};
use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry,
    ReplyOpen, Request, FUSE_ROOT_ID,
};
use libc::{EINVAL, ENOTDIR};
use log::{debug, trace, warn};
use std::ffi::OsStr;
use std::io;
use std::path::Path;
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, SystemTime};

/// Time-to-live for cached attributes.
const TTL: Duration = Duration::from_secs(1);

/// Block size for filesystem statistics.
const BLOCK_SIZE: u32 = 512;

/// Upper bound on the default number of read workers.
const MAX_READ_THREADS: usize = 8;

/// Work handed to a read worker.
type ReadJob = Box<dyn FnOnce(&SparseFs) + Send>;

/// Threads answering reads off the session thread.
///
/// Workers exit once the sender is dropped.
struct ReadWorkers {
    sender: mpsc::Sender<ReadJob>,
    threads: usize,
}

impl ReadWorkers {
    /// Start up to `threads` workers sharing `fs`. Returns `None` if no
    /// worker could be started.
    fn spawn(fs: &Arc<SparseFs>, threads: usize) -> Option<Self> {
        let (sender, receiver) = mpsc::channel::<ReadJob>();
        let receiver = Arc::new(Mutex::new(receiver));
        let mut started = 0;

        for id in 0..threads {
            let fs = Arc::clone(fs);
            let receiver = Arc::clone(&receiver);
            let spawned = thread::Builder::new()
                .name(format!("sparse-read-{}", id))
                .spawn(move || loop {
                    let job = match receiver.lock() {
                        Ok(rx) => rx.recv(),
                        Err(_) => break,
                    };
                    match job {
                        Ok(job) => job(fs.as_ref()),
                        Err(_) => break,
                    }
                });

            match spawned {
                Ok(_) => started += 1,
                Err(e) => warn!("Failed to start read worker {}: {}", id, e),
            }
        }

        (started > 0).then_some(Self {
            sender,
            threads: started,
        })
    }
}

fn default_read_threads() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(MAX_READ_THREADS)
}

/// FUSE filesystem exposing one decoded sparse image.
///
/// The root inode is the image itself.
///
/// `fuser` delivers every request on one session thread. Reads are handed to
/// worker threads together with their reply, so reads on different handles
/// proceed in parallel; reads on one handle still take turns on its decoder.
/// The other callbacks are answered on the session thread.
pub struct SparseFuseFS {
    fs: Arc<SparseFs>,
    /// Read workers; `None` answers reads on the session thread.
    reads: Option<ReadWorkers>,
    /// User ID for file ownership (defaults to current user).
    uid: u32,
    /// Group ID for file ownership (defaults to current group).
    gid: u32,
    /// Timestamps reported for the file.
    mount_time: SystemTime,
}

impl SparseFuseFS {
    pub fn new(fs: SparseFs) -> Self {
        Self::with_read_threads(fs, default_read_threads())
    }

    /// Create the adapter with `threads` read workers. Zero answers reads
    /// on the session thread.
    pub fn with_read_threads(fs: SparseFs, threads: usize) -> Self {
        // SAFETY: getuid/getgid cannot fail and touch no memory.
        let uid = unsafe { libc::getuid() };
        let gid = unsafe { libc::getgid() };

        let fs = Arc::new(fs);
        let reads = ReadWorkers::spawn(&fs, threads);
        debug!(
            "Serving reads on {} worker thread(s)",
            reads.as_ref().map_or(0, |w| w.threads)
        );

        Self {
            fs,
            reads,
            uid,
            gid,
            mount_time: SystemTime::now(),
        }
    }

    /// The callback core behind this adapter.
    pub fn inner(&self) -> &SparseFs {
        &self.fs
    }

    /// Number of threads answering reads.
    pub fn read_threads(&self) -> usize {
        self.reads.as_ref().map_or(0, |w| w.threads)
    }

    /// Run `job` on a read worker, or inline when none is available.
    fn dispatch(&self, job: ReadJob) {
        let job = match &self.reads {
            Some(workers) => match workers.sender.send(job) {
                Ok(()) => return,
                Err(mpsc::SendError(job)) => job,
            },
            None => job,
        };
        job(self.fs.as_ref());
    }

    /// Build file attributes for the image.
    fn file_attr(&self, stat: FileStat) -> FileAttr {
        FileAttr {
            ino: FUSE_ROOT_ID,
            size: stat.size,
            blocks: stat.size.div_ceil(u64::from(BLOCK_SIZE)),
            atime: self.mount_time,
            mtime: self.mount_time,
            ctime: self.mount_time,
            crtime: self.mount_time,
            kind: FileType::RegularFile,
            perm: stat.perm(),
            nlink: 1,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }
}

fn errno(op: &str, err: &FsError) -> i32 {
    let errno = err.to_errno();
    debug!("{}: replying errno {} ({})", op, errno, err);
    errno
}

impl Filesystem for SparseFuseFS {
    /// Get file attributes. Every inode resolves to the image.
    fn getattr(&mut self, _req: &Request, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        trace!("getattr(ino={})", ino);
        reply.attr(&TTL, &self.file_attr(self.fs.getattr()));
    }

    /// The root is a regular file, so there is nothing to look up.
    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        trace!("lookup(parent={}, name={:?})", parent, name);
        reply.error(ENOTDIR);
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        _offset: i64,
        reply: ReplyDirectory,
    ) {
        trace!("readdir(ino={})", ino);
        reply.error(ENOTDIR);
    }

    /// Open the image, creating a per-handle decoder.
    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        trace!("open(ino={}, flags={:#o})", ino, flags);

        match self.fs.open(flags) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(errno("open", &e)),
        }
    }

    /// Read decoded bytes through the handle's decoder.
    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        trace!("read(ino={}, fh={}, offset={}, size={})", ino, fh, offset, size);

        let Ok(offset) = u64::try_from(offset) else {
            reply.error(EINVAL);
            return;
        };

        self.dispatch(Box::new(move |fs: &SparseFs| match fs.read(fh, offset, size as usize) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(errno("read", &e)),
        }));
    }

    /// Close the handle. Always succeeds.
    fn release(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        trace!("release(ino={}, fh={})", ino, fh);
        self.fs.release(fh);
        reply.ok();
    }

    /// Get filesystem statistics.
    fn statfs(&mut self, _req: &Request, _ino: u64, reply: fuser::ReplyStatfs) {
        trace!("statfs");

        let blocks = self.fs.getattr().size.div_ceil(u64::from(BLOCK_SIZE));
        reply.statfs(
            blocks, // total blocks
            0,      // free blocks
            0,      // available blocks
            1,      // total inodes
            0,      // free inodes
            BLOCK_SIZE, 255, // max name length
            BLOCK_SIZE,
        );
    }
}

/// Mount `fs` over the regular file `mount_point`.
///
/// This function blocks until the filesystem is unmounted.
///
/// # Errors
///
/// Returns an error if the mount point is invalid or FUSE mounting fails.
pub fn mount<P: AsRef<Path>>(fs: SparseFs, mount_point: P, config: &MountConfig) -> io::Result<()> {
    let mount_point = mount_point.as_ref();
    let options = config.mount_options();

    debug!(
        "Mounting {} ({} bytes) at {} with {:?}",
        fs.session().source_path().display(),
        fs.session().logical_size(),
        mount_point.display(),
        options
    );

    fuser::mount2(SparseFuseFS::new(fs), mount_point, &options)
        .map_err(|e| io::Error::new(e.kind(), format!("FUSE mount failed: {}", e)))
}

/// Mount `fs` in the background and return a session handle.
///
/// The filesystem stays mounted until the returned `BackgroundSession` is
/// dropped.
pub fn mount_background<P: AsRef<Path>>(
    fs: SparseFs,
    mount_point: P,
    config: &MountConfig,
) -> io::Result<fuser::BackgroundSession> {
    let mount_point = mount_point.as_ref();
    let options = config.mount_options();

    debug!(
        "Mounting {} at {} (background)",
        fs.session().source_path().display(),
        mount_point.display()
    );

    fuser::spawn_mount2(SparseFuseFS::new(fs), mount_point, &options)
        .map_err(|e| io::Error::new(e.kind(), format!("FUSE mount failed: {}", e)))
}
