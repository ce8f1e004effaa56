//! Mapped-file pool.
//!
//! Every backing cache file is accessed through a private, copy-on-write
//! memory mapping. The pool bounds how many mappings exist at once with a
//! counting semaphore, recycles them LRU-style through a per-session holder
//! of strong references, and hands out weak, self-allocating handles that
//! re-map on demand.
//!
//! Writes into a mapping exist for the slide-info apply path only. They
//! happen in the post-allocation hook, before the strong handle is
//! published, so every reader observes fully rebased memory; being private
//! mappings they never reach the file on disk.

use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, Weak};

use byteorder::{ByteOrder, LittleEndian};
use memmap2::{MmapMut, MmapOptions};
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::util::memchr_null;

/// Identifies one host session; pool resources are scoped to it.
pub type SessionId = u64;

/// Hook invoked once per physical (re)mapping, before any reader can observe
/// the file. The slide-info rebaser installs itself here.
pub type PostAllocFn = Arc<dyn Fn(&mut MappedFile) + Send + Sync>;

/// Default bound on simultaneously memory-mapped files.
pub const DEFAULT_MAX_MAPPED_FILES: usize = 64;

// =============================================================================
// Counting Semaphore
// =============================================================================

/// A counting semaphore bounding concurrent mappings.
struct Semaphore {
    count: Mutex<usize>,
    cv: Condvar,
}

impl Semaphore {
    fn new(count: usize) -> Self {
        Self {
            count: Mutex::new(count),
            cv: Condvar::new(),
        }
    }

    fn acquire(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.cv.wait(count).unwrap();
        }
        *count -= 1;
    }

    fn try_acquire(&self) -> bool {
        let mut count = self.count.lock().unwrap();
        if *count > 0 {
            *count -= 1;
            true
        } else {
            false
        }
    }

    fn release(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        self.cv.notify_one();
    }
}

/// A semaphore slot, returned to the pool when the mapping is dropped.
struct Permit {
    semaphore: Arc<Semaphore>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.semaphore.release();
    }
}

// =============================================================================
// Mapped File
// =============================================================================

/// One private memory mapping of one backing cache file.
///
/// Spans returned by [`MappedFile::read_span`] borrow the mapping and are
/// therefore valid exactly as long as the strong handle is held.
pub struct MappedFile {
    path: PathBuf,
    mmap: MmapMut,
    slide_applied: bool,
    _permit: Permit,
}

impl MappedFile {
    fn open(path: &Path, permit: Permit) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::file_missing(path)
            } else {
                Error::Io(e)
            }
        })?;

        let mmap = unsafe { MmapOptions::new().map_copy(&file) }.map_err(|e| Error::MmapFailed {
            path: path.to_path_buf(),
            source: e,
        })?;

        trace!(path = %path.display(), len = mmap.len(), "mapped file");

        Ok(Self {
            path: path.to_path_buf(),
            mmap,
            slide_applied: false,
            _permit: permit,
        })
    }

    /// Returns the path this mapping is backed by.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the length of the mapping in bytes.
    pub fn len(&self) -> u64 {
        self.mmap.len() as u64
    }

    /// Returns true for an empty mapping.
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    /// Returns true once the slide-info rebase ran against this mapping.
    pub fn slide_info_was_applied(&self) -> bool {
        self.slide_applied
    }

    /// Marks the slide-info rebase as done.
    pub fn set_slide_info_was_applied(&mut self, applied: bool) {
        self.slide_applied = applied;
    }

    #[inline]
    fn check(&self, offset: u64, length: u64) -> Result<usize> {
        let end = offset.checked_add(length);
        match end {
            Some(end) if end <= self.len() => Ok(offset as usize),
            _ => Err(Error::ReadOutOfRange {
                path: self.path.clone(),
                offset,
                length,
                file_length: self.len(),
            }),
        }
    }

    /// Reads a single byte.
    pub fn read_u8(&self, offset: u64) -> Result<u8> {
        let o = self.check(offset, 1)?;
        Ok(self.mmap[o])
    }

    /// Reads a little-endian u16.
    pub fn read_u16(&self, offset: u64) -> Result<u16> {
        let o = self.check(offset, 2)?;
        Ok(LittleEndian::read_u16(&self.mmap[o..o + 2]))
    }

    /// Reads a little-endian u32.
    pub fn read_u32(&self, offset: u64) -> Result<u32> {
        let o = self.check(offset, 4)?;
        Ok(LittleEndian::read_u32(&self.mmap[o..o + 4]))
    }

    /// Reads a little-endian u64.
    pub fn read_u64(&self, offset: u64) -> Result<u64> {
        let o = self.check(offset, 8)?;
        Ok(LittleEndian::read_u64(&self.mmap[o..o + 8]))
    }

    /// Reads a NUL-terminated string.
    pub fn read_null_terminated_string(&self, offset: u64) -> Result<String> {
        let o = self.check(offset, 1)?;
        let bytes = &self.mmap[o..];
        let end = memchr_null(bytes);
        Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }

    /// Returns a borrowed span of the mapping.
    pub fn read_span(&self, offset: u64, length: u64) -> Result<&[u8]> {
        let o = self.check(offset, length)?;
        Ok(&self.mmap[o..o + length as usize])
    }

    /// Copies out a span of the mapping.
    pub fn read_buffer(&self, offset: u64, length: u64) -> Result<Vec<u8>> {
        Ok(self.read_span(offset, length)?.to_vec())
    }

    /// Copies bytes into `dest`.
    pub fn read_into(&self, dest: &mut [u8], offset: u64) -> Result<()> {
        let span = self.read_span(offset, dest.len() as u64)?;
        dest.copy_from_slice(span);
        Ok(())
    }

    /// Writes a pointer-sized value into the private mapping.
    ///
    /// Only the slide-info apply path writes to mappings, and only before
    /// the mapping is published. Callers must assume the write does not
    /// survive an unmap.
    pub fn write_u64(&mut self, offset: u64, value: u64) -> Result<()> {
        let o = self.check(offset, 8)?;
        LittleEndian::write_u64(&mut self.mmap[o..o + 8], value);
        Ok(())
    }
}

impl std::fmt::Debug for MappedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedFile")
            .field("path", &self.path)
            .field("len", &self.len())
            .field("slide_applied", &self.slide_applied)
            .finish()
    }
}

// =============================================================================
// Lazy File Handle
// =============================================================================

/// Shared pool internals visible to handles.
struct PoolShared {
    semaphore: Arc<Semaphore>,
    holders: Mutex<HashMap<SessionId, VecDeque<Arc<MappedFile>>>>,
    lru_capacity: usize,
}

impl PoolShared {
    fn acquire(&self, session: SessionId) -> Permit {
        if !self.semaphore.try_acquire() {
            // Make room by dropping this session's oldest strong reference
            // before blocking on the budget.
            self.evict_oldest(session);
            self.semaphore.acquire();
        }
        Permit {
            semaphore: Arc::clone(&self.semaphore),
        }
    }

    fn evict_oldest(&self, session: SessionId) {
        let mut holders = self.holders.lock().unwrap();
        if let Some(deque) = holders.get_mut(&session) {
            if let Some(evicted) = deque.pop_front() {
                debug!(path = %evicted.path().display(), "evicting mapped file");
            }
        }
    }

    fn retain(&self, session: SessionId, file: Arc<MappedFile>) {
        let mut holders = self.holders.lock().unwrap();
        let deque = holders.entry(session).or_default();
        deque.push_back(file);
        while deque.len() > self.lru_capacity {
            deque.pop_front();
        }
    }
}

/// A weak handle to a [`MappedFile`] that re-maps on demand.
///
/// [`LazyFile::lock`] upgrades an existing mapping or performs a fresh map,
/// running the post-allocation hook exactly once per physical mapping before
/// the strong handle becomes observable. Concurrent lockers of the same file
/// block until the hook completes.
pub struct LazyFile {
    path: PathBuf,
    session: SessionId,
    post_alloc: Option<PostAllocFn>,
    slot: Mutex<Weak<MappedFile>>,
    shared: Arc<PoolShared>,
}

impl LazyFile {
    /// Returns the path this handle maps.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquires a strong, mapped handle, re-mapping if necessary.
    pub fn lock(&self) -> Result<Arc<MappedFile>> {
        let mut slot = self.slot.lock().unwrap();
        if let Some(existing) = slot.upgrade() {
            return Ok(existing);
        }

        let permit = self.shared.acquire(self.session);
        let mut file = MappedFile::open(&self.path, permit)?;
        if let Some(hook) = &self.post_alloc {
            hook(&mut file);
        }

        let strong = Arc::new(file);
        *slot = Arc::downgrade(&strong);
        self.shared.retain(self.session, Arc::clone(&strong));
        Ok(strong)
    }

    /// Returns the live mapping without allocating a new one.
    pub fn lock_no_allocate(&self) -> Option<Arc<MappedFile>> {
        self.slot.lock().unwrap().upgrade()
    }
}

impl std::fmt::Debug for LazyFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyFile")
            .field("path", &self.path)
            .field("session", &self.session)
            .finish()
    }
}

// =============================================================================
// File Pool
// =============================================================================

/// The process-wide pool of lazily mapped cache files.
pub struct FilePool {
    shared: Arc<PoolShared>,
    accessors: Mutex<HashMap<(SessionId, PathBuf), Arc<LazyFile>>>,
}

impl FilePool {
    /// Creates a pool bounded to `max_mapped` simultaneous mappings.
    pub fn new(max_mapped: usize) -> Self {
        let max_mapped = max_mapped.max(2);
        Self {
            shared: Arc::new(PoolShared {
                semaphore: Arc::new(Semaphore::new(max_mapped)),
                holders: Mutex::new(HashMap::new()),
                // Keep headroom below the mmap budget so a fresh map never
                // has to wait on a reference the holder itself pins.
                lru_capacity: (max_mapped / 2).max(1),
            }),
            accessors: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the lazy handle for `path`, creating it if needed.
    ///
    /// The post-allocation hook of the first open wins; later opens of the
    /// same path share the handle.
    pub fn open(
        &self,
        session: SessionId,
        path: impl AsRef<Path>,
        post_alloc: Option<PostAllocFn>,
    ) -> Result<Arc<LazyFile>> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::file_missing(path));
        }

        let mut accessors = self.accessors.lock().unwrap();
        let entry = accessors
            .entry((session, path.to_path_buf()))
            .or_insert_with(|| {
                Arc::new(LazyFile {
                    path: path.to_path_buf(),
                    session,
                    post_alloc,
                    slot: Mutex::new(Weak::new()),
                    shared: Arc::clone(&self.shared),
                })
            });
        Ok(Arc::clone(entry))
    }

    /// Tears down every handle and held mapping for a session.
    pub fn close_all(&self, session: SessionId) {
        self.accessors
            .lock()
            .unwrap()
            .retain(|(s, _), _| *s != session);
        self.shared.holders.lock().unwrap().remove(&session);
    }
}

impl Default for FilePool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MAPPED_FILES)
    }
}

impl std::fmt::Debug for FilePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilePool")
            .field("accessors", &self.accessors.lock().unwrap().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn temp_file(name: &str, contents: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(format!("dscload-pool-{}-{}", std::process::id(), name));
        let mut f = File::create(&path).unwrap();
        f.write_all(contents).unwrap();
        path
    }

    #[test]
    fn test_open_missing_file() {
        let pool = FilePool::default();
        let err = pool.open(1, "/nonexistent/definitely/missing", None).unwrap_err();
        assert!(matches!(err, Error::FileMissing { .. }));
    }

    #[test]
    fn test_lock_and_read() {
        let path = temp_file("read", &[0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88]);
        let pool = FilePool::default();
        let lazy = pool.open(1, &path, None).unwrap();
        let file = lazy.lock().unwrap();

        assert_eq!(file.read_u8(0).unwrap(), 0x11);
        assert_eq!(file.read_u16(0).unwrap(), 0x2211);
        assert_eq!(file.read_u32(0).unwrap(), 0x44332211);
        assert_eq!(file.read_u64(0).unwrap(), 0x8877665544332211);
        assert!(matches!(
            file.read_u64(1).unwrap_err(),
            Error::ReadOutOfRange { .. }
        ));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_post_alloc_runs_once_per_mapping() {
        let path = temp_file("hook", &[0u8; 32]);
        let pool = FilePool::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let hook_calls = Arc::clone(&calls);
        let lazy = pool
            .open(
                7,
                &path,
                Some(Arc::new(move |file: &mut MappedFile| {
                    hook_calls.fetch_add(1, Ordering::SeqCst);
                    file.write_u64(0, 0xDEAD_BEEF).unwrap();
                    file.set_slide_info_was_applied(true);
                })),
            )
            .unwrap();

        let first = lazy.lock().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.read_u64(0).unwrap(), 0xDEAD_BEEF);
        assert!(first.slide_info_was_applied());

        // Same mapping while a strong handle is alive.
        let again = lazy.lock().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&first, &again));

        // A fresh physical map re-runs the hook; the write did not persist.
        pool.close_all(7);
        drop(first);
        drop(again);
        let remapped = lazy.lock().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(remapped.read_u64(0).unwrap(), 0xDEAD_BEEF);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_writes_do_not_persist_to_disk() {
        let path = temp_file("cow", &[0u8; 8]);
        let pool = FilePool::default();
        let lazy = pool
            .open(
                2,
                &path,
                Some(Arc::new(|file: &mut MappedFile| {
                    file.write_u64(0, 0x4141414141414141).unwrap();
                })),
            )
            .unwrap();
        let file = lazy.lock().unwrap();
        assert_eq!(file.read_u64(0).unwrap(), 0x4141414141414141);
        drop(file);

        assert_eq!(std::fs::read(&path).unwrap(), vec![0u8; 8]);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_semaphore_eviction_makes_room() {
        let a = temp_file("sem-a", &[1u8; 8]);
        let b = temp_file("sem-b", &[2u8; 8]);
        let c = temp_file("sem-c", &[3u8; 8]);
        let pool = FilePool::new(2);

        // The holder keeps at most one strong reference, so mapping a third
        // file evicts the oldest and succeeds without blocking.
        let _fa = pool.open(3, &a, None).unwrap().lock().unwrap();
        drop(_fa);
        let _fb = pool.open(3, &b, None).unwrap().lock().unwrap();
        drop(_fb);
        let fc = pool.open(3, &c, None).unwrap().lock().unwrap();
        assert_eq!(fc.read_u8(0).unwrap(), 3);

        for p in [a, b, c] {
            std::fs::remove_file(&p).ok();
        }
    }
}
