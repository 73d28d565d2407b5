use crate::backing::{open_sparse, BackingFile};
use crate::error::{FsError, Result};
use log::error;
use sparse_format::SparseFile;
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// State owned by one open file handle.
///
/// Each context has its own backing file and decoder. The mutex serializes
/// seek+read pairs on this handle; other handles are never blocked by it.
#[derive(Debug)]
pub struct HandleContext {
    sparse: Mutex<SparseFile<BackingFile>>,
}

impl HandleContext {
    /// Open a new backing file and decoder on `source_path`.
    pub fn open(source_path: &Path) -> Result<Self> {
        Ok(Self {
            sparse: Mutex::new(open_sparse(source_path)?),
        })
    }

    /// Decode up to `buf.len()` bytes starting at `offset`.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        // Every read reseeks, so a reader that panicked leaves nothing to repair.
        let mut sparse = self.sparse.lock().unwrap_or_else(PoisonError::into_inner);

        if let Err(e) = sparse.seek(SeekFrom::Start(offset)) {
            let err = FsError::from_source(sparse.get_ref().path(), "Failed to seek sparse file", e);
            error!("{}", err);
            return Err(err);
        }

        match sparse.read(buf) {
            Ok(n) => Ok(n),
            Err(e) => {
                let err =
                    FsError::from_source(sparse.get_ref().path(), "Failed to read sparse file", e);
                error!("{}", err);
                Err(err)
            }
        }
    }

    /// Decoded size seen by this handle's decoder.
    pub fn size(&self) -> u64 {
        self.sparse
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .size()
    }
}

/// Maps the kernel's opaque file handle numbers to open contexts.
///
/// Contexts are reference counted so a release racing an in-flight read
/// only tears the context down once that read has finished.
#[derive(Debug)]
pub struct HandleTable {
    next_id: AtomicU64,
    entries: RwLock<HashMap<u64, Arc<HandleContext>>>,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            // 0 is never handed out
            next_id: AtomicU64::new(1),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Register `context` and return its handle number.
    ///
    /// # Errors
    ///
    /// Returns [`FsError::OutOfMemory`] if the table cannot grow.
    pub fn insert(&self, context: HandleContext) -> Result<u64> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.try_reserve(1).map_err(|_| FsError::OutOfMemory)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        entries.insert(id, Arc::new(context));
        Ok(id)
    }

    pub fn get(&self, id: u64) -> Option<Arc<HandleContext>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    pub fn remove(&self, id: u64) -> Option<Arc<HandleContext>> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }

    /// Number of open handles.
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
