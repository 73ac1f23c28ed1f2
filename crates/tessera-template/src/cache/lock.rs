//! Advisory file locks with bounded retry.
//!
//! Readers hold a shared lock, writers an exclusive one. Acquisition polls
//! with exponential backoff until a deadline; on timeout the caller gets a
//! [`TesseraError::CacheError`] and degrades to a miss or a skipped write.

use std::fs::{File, OpenOptions, TryLockError};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use tessera_core::error::{TesseraError, TesseraResult};

/// Retry behavior for lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    /// Overall deadline for one acquisition.
    pub timeout: Duration,
    /// First sleep between attempts. Doubles after each failure.
    pub initial_backoff: Duration,
    /// Upper bound on the sleep.
    pub max_backoff: Duration,
}

impl LockOptions {
    /// Gives up after `timeout`, backing off from 5 ms up to 100 ms.
    pub const fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(100),
        }
    }
}

impl Default for LockOptions {
    fn default() -> Self {
        Self::with_timeout(Duration::from_secs(3))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Shared,
    Exclusive,
}

/// An open file holding a lock until dropped.
#[derive(Debug)]
pub struct LockedFile {
    file: File,
}

impl LockedFile {
    /// Opens an existing file for reading under a shared lock.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be opened, or
    /// [`TesseraError::CacheError`] if the lock is not acquired in time.
    pub fn open_shared(path: &Path, options: LockOptions) -> TesseraResult<Self> {
        let file = File::open(path)?;
        acquire(&file, Mode::Shared, path, options)?;
        Ok(Self { file })
    }

    /// Opens (creating if needed) a file for read and write under an
    /// exclusive lock. The content is left untouched until [`Self::replace`].
    /// A file created here is removed again if the lock times out.
    ///
    /// # Errors
    ///
    /// Same as [`Self::open_shared`].
    pub fn open_exclusive(path: &Path, options: LockOptions) -> TesseraResult<Self> {
        let (file, created) = open_for_write(path)?;
        Self::lock_exclusive(file, created, path, options)
    }

    fn lock_exclusive(
        file: File,
        created: bool,
        path: &Path,
        options: LockOptions,
    ) -> TesseraResult<Self> {
        if let Err(e) = acquire(&file, Mode::Exclusive, path, options) {
            if created && file.metadata().is_ok_and(|m| m.len() == 0) {
                let _ = std::fs::remove_file(path);
            }
            return Err(e);
        }
        Ok(Self { file })
    }

    /// Reads the whole file.
    pub fn read_to_string(&mut self) -> TesseraResult<String> {
        let mut contents = String::new();
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_to_string(&mut contents)?;
        Ok(contents)
    }

    /// Truncates the file and writes `contents` in full.
    pub fn replace(&mut self, contents: &[u8]) -> TesseraResult<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(contents)?;
        self.file.sync_data()?;
        Ok(())
    }
}

impl Drop for LockedFile {
    fn drop(&mut self) {
        // Closing the handle also releases the lock.
        let _ = self.file.unlock();
    }
}

/// Opens `path` for read and write. The flag tells whether this call
/// created it.
fn open_for_write(path: &Path) -> TesseraResult<(File, bool)> {
    let mut options = OpenOptions::new();
    options.read(true).write(true);
    match options.clone().create_new(true).open(path) {
        Ok(file) => Ok((file, true)),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok((options.open(path)?, false)),
        Err(e) => Err(e.into()),
    }
}

fn acquire(file: &File, mode: Mode, path: &Path, options: LockOptions) -> TesseraResult<()> {
    let deadline = Instant::now() + options.timeout;
    let mut backoff = options.initial_backoff;
    loop {
        let attempt = match mode {
            Mode::Shared => file.try_lock_shared(),
            Mode::Exclusive => file.try_lock(),
        };
        match attempt {
            Ok(()) => return Ok(()),
            Err(TryLockError::Error(e)) => return Err(e.into()),
            Err(TryLockError::WouldBlock) => {}
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(TesseraError::CacheError(format!(
                "timed out acquiring {} lock on {}",
                if mode == Mode::Shared { "shared" } else { "exclusive" },
                path.display()
            )));
        }
        thread::sleep(backoff.min(deadline - now));
        backoff = (backoff * 2).min(options.max_backoff);
    }
}

/// Reads `path` under a shared lock.
pub fn read_locked(path: &Path, options: LockOptions) -> TesseraResult<String> {
    LockedFile::open_shared(path, options)?.read_to_string()
}

/// Replaces the content of `path` under an exclusive lock.
pub fn write_locked(path: &Path, contents: &[u8], options: LockOptions) -> TesseraResult<()> {
    LockedFile::open_exclusive(path, options)?.replace(contents)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick() -> LockOptions {
        LockOptions {
            timeout: Duration::from_millis(50),
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entry.json");
        write_locked(&path, b"first version, longer", quick()).unwrap();
        write_locked(&path, b"second", quick()).unwrap();
        assert_eq!(read_locked(&path, quick()).unwrap(), "second");
    }

    #[test]
    fn test_exclusive_blocks_until_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entry.json");
        let _held = LockedFile::open_exclusive(&path, quick()).unwrap();
        let err = read_locked(&path, quick()).unwrap_err();
        assert!(matches!(err, TesseraError::CacheError(_)));
    }

    #[test]
    fn test_shared_locks_coexist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entry.json");
        write_locked(&path, b"x", quick()).unwrap();
        let _a = LockedFile::open_shared(&path, quick()).unwrap();
        assert_eq!(read_locked(&path, quick()).unwrap(), "x");
        assert!(write_locked(&path, b"y", quick()).is_err());
    }

    #[test]
    fn test_lock_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entry.json");
        {
            let mut held = LockedFile::open_exclusive(&path, quick()).unwrap();
            held.replace(b"held").unwrap();
        }
        write_locked(&path, b"after", quick()).unwrap();
        assert_eq!(read_locked(&path, quick()).unwrap(), "after");
    }

    #[test]
    fn test_timed_out_writer_removes_the_file_it_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entry.json");
        let (file, created) = open_for_write(&path).unwrap();
        assert!(created);
        let _reader = LockedFile::open_shared(&path, quick()).unwrap();

        let err = LockedFile::lock_exclusive(file, created, &path, quick()).unwrap_err();
        assert!(matches!(err, TesseraError::CacheError(_)));
        assert!(!path.exists());
    }

    #[test]
    fn test_timed_out_writer_keeps_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entry.json");
        write_locked(&path, b"kept", quick()).unwrap();
        let _reader = LockedFile::open_shared(&path, quick()).unwrap();

        assert!(write_locked(&path, b"lost", quick()).is_err());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "kept");
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_locked(&dir.path().join("nope"), quick()).unwrap_err();
        assert!(matches!(err, TesseraError::IoError(_)));
    }
}
