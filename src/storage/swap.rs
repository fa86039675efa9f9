//! # Swap File
//!
//! Paged-out regions live in a single scratch file. Region `n` always
//! occupies bytes `n * REGION_SIZE .. (n + 1) * REGION_SIZE`, so the file
//! needs no index and grows only when a region with a higher id is first
//! written. The file is working storage, not a persistence format: it is
//! truncated when opened and removed when the store is dropped.
//!
//! ## Transfers
//!
//! Reads and writes are positioned (`pread`/`pwrite` via `FileExt`) on Unix.
//! Elsewhere the file is seeked first, with up to `SWAP_SEEK_ATTEMPTS`
//! attempts. Each transfer then gets up to `SWAP_IO_ATTEMPTS` calls to move
//! the whole region, which absorbs interrupted calls and short transfers.
//! Running out of attempts is a [`FatalStorageError`].
//!
//! ## Fork Clones
//!
//! For copy-on-write dumps the file is cloned before `fork()`:
//!
//! ```text
//!            create_clone()            release_clone()   (parent)
//!   Idle ──────────────────▶ Cloned ──────────────────▶ Idle
//!                              │
//!                              │ adopt_clone()          (child)
//!                              ▼
//!                            Child ───finish_clone()──▶ Idle, detached
//! ```
//!
//! `finish_clone()` from `Cloned` is the parent's cleanup after a failed
//! fork: it closes and unlinks the clone. From `Child` it closes the adopted
//! file and unlinks it; the child cannot page any more regions after that.
//!
//! Dropping a `SwapFile` unlinks its files only in the process that owns
//! them. A forked child inherits the parent's `SwapFile`; until it calls
//! `adopt_clone()` it owns nothing, so an early exit leaves the parent's
//! swap file and the clone on disk.

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use eyre::{Result, WrapErr};
use tracing::debug;

use crate::config::{FORK_CLONE_ATTEMPTS, REGION_SIZE, SWAP_IO_ATTEMPTS};
use crate::error::FatalStorageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advice {
    Sequential,
    Random,
}

#[derive(Debug)]
enum ForkState {
    Idle,
    Cloned { file: File, path: PathBuf },
    Child,
}

#[derive(Debug)]
pub struct SwapFile {
    path: PathBuf,
    file: Option<File>,
    fork: ForkState,
    /// Process that unlinks the files on drop.
    owner: u32,
}

#[inline]
fn region_offset(region: u16) -> u64 {
    u64::from(region) * REGION_SIZE as u64
}

fn open_options() -> OpenOptions {
    let mut options = OpenOptions::new();
    options.read(true).write(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options
}

impl SwapFile {
    pub fn create(path: &Path, initial_kib: u64) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).wrap_err_with(|| {
                format!("failed to create swap directory '{}'", parent.display())
            })?;
        }

        let file = open_options()
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("cannot open swap file '{}'", path.display()))?;

        if initial_kib > 0 {
            reserve(&file, initial_kib * 1024);
        }

        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
            fork: ForkState::Idle,
            owner: std::process::id(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_detached(&self) -> bool {
        self.file.is_none()
    }

    fn main(&self) -> Result<&File> {
        self.file
            .as_ref()
            .ok_or_else(|| FatalStorageError::SwapDetached.into())
    }

    pub fn len(&self) -> Result<u64> {
        let file = self.main()?;
        Ok(file
            .metadata()
            .wrap_err("failed to stat swap file")?
            .len())
    }

    pub fn read_region(&self, region: u16, buf: &mut [u8]) -> Result<()> {
        read_region_from(self.main()?, region, buf)
    }

    pub fn write_region(&self, region: u16, buf: &[u8]) -> Result<()> {
        write_region_to(self.main()?, region, buf)
    }

    pub fn advise(&self, advice: Advice) {
        if let Some(file) = &self.file {
            advise(file, advice);
        }
    }

    pub fn has_clone(&self) -> bool {
        matches!(self.fork, ForkState::Cloned { .. })
    }

    /// Creates `<swap>.N` for the first free N. Returns false if every name
    /// is taken or a clone already exists.
    pub fn create_clone(&mut self) -> Result<bool> {
        if !matches!(self.fork, ForkState::Idle) {
            return Ok(false);
        }
        let size = self.len()?;

        for attempt in 0..FORK_CLONE_ATTEMPTS {
            let mut name = OsString::from(self.path.as_os_str());
            name.push(format!(".{}", attempt));
            let path = PathBuf::from(name);

            match open_options().create_new(true).open(&path) {
                Ok(file) => {
                    if size > 0 {
                        reserve(&file, size);
                    }
                    debug!(clone = %path.display(), "cloning swap file");
                    self.fork = ForkState::Cloned { file, path };
                    return Ok(true);
                }
                Err(e) => {
                    debug!(clone = %path.display(), error = %e, "swap clone name unavailable");
                }
            }
        }
        Ok(false)
    }

    /// Copies one region from the swap file into the clone.
    pub fn copy_to_clone(&self, region: u16, scratch: &mut [u8]) -> Result<()> {
        let ForkState::Cloned { file, .. } = &self.fork else {
            return Err(FatalStorageError::SwapDetached.into());
        };
        read_region_from(self.main()?, region, scratch)?;
        write_region_to(file, region, scratch)
    }

    /// Parent side after fork: forget the clone, the child owns it now.
    pub fn release_clone(&mut self) {
        if self.has_clone() {
            self.fork = ForkState::Idle;
        }
    }

    /// Child side after fork: switch to the clone.
    pub fn adopt_clone(&mut self) {
        if let ForkState::Cloned { file, path } = std::mem::replace(&mut self.fork, ForkState::Idle)
        {
            advise(&file, Advice::Random);
            self.file = Some(file);
            self.path = path;
            self.fork = ForkState::Child;
            self.owner = std::process::id();
        }
    }

    /// Closes and unlinks the clone, whichever side of the fork we are on.
    pub fn finish_clone(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.fork, ForkState::Idle) {
            ForkState::Idle => Ok(()),
            ForkState::Cloned { file, path } => {
                drop(file);
                fs::remove_file(&path)
                    .wrap_err_with(|| format!("failed to remove swap clone '{}'", path.display()))
            }
            ForkState::Child => {
                self.file = None;
                fs::remove_file(&self.path).wrap_err_with(|| {
                    format!("failed to remove swap clone '{}'", self.path.display())
                })
            }
        }
    }
}

impl Drop for SwapFile {
    fn drop(&mut self) {
        if std::process::id() != self.owner {
            return;
        }
        if let ForkState::Cloned { path, .. } = &self.fork {
            let _ = fs::remove_file(path);
        }
        if self.file.take().is_some() {
            let _ = fs::remove_file(&self.path);
        }
    }
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

#[cfg(unix)]
fn write_at(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.write_at(buf, offset)
}

#[cfg(unix)]
fn seek_to(_file: &File, _offset: u64) -> Result<()> {
    Ok(())
}

#[cfg(not(unix))]
fn read_at(file: &File, buf: &mut [u8], _offset: u64) -> io::Result<usize> {
    use std::io::Read;
    let mut file = file;
    file.read(buf)
}

#[cfg(not(unix))]
fn write_at(file: &File, buf: &[u8], _offset: u64) -> io::Result<usize> {
    use std::io::Write;
    let mut file = file;
    file.write(buf)
}

#[cfg(not(unix))]
fn seek_to(file: &File, offset: u64) -> Result<()> {
    use std::io::{Seek, SeekFrom};
    use crate::config::SWAP_SEEK_ATTEMPTS;

    let mut file = file;
    let mut last_error = io::Error::new(io::ErrorKind::Other, "seek landed elsewhere");
    for _ in 0..SWAP_SEEK_ATTEMPTS {
        match file.seek(SeekFrom::Start(offset)) {
            Ok(pos) if pos == offset => return Ok(()),
            Ok(_) => {}
            Err(e) => last_error = e,
        }
    }
    Err(FatalStorageError::SwapSeek {
        offset,
        attempts: SWAP_SEEK_ATTEMPTS,
        source: last_error,
    }
    .into())
}

fn read_region_from(file: &File, region: u16, buf: &mut [u8]) -> Result<()> {
    let offset = region_offset(region);
    seek_to(file, offset)?;

    let mut done = 0;
    let mut last_error = None;
    for _ in 0..SWAP_IO_ATTEMPTS {
        match read_at(file, &mut buf[done..], offset + done as u64) {
            Ok(n) => done += n,
            Err(e) => last_error = Some(e),
        }
        if done == buf.len() {
            return Ok(());
        }
    }

    Err(FatalStorageError::SwapRead {
        region,
        remaining: buf.len() - done,
        source: last_error
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "short read")),
    }
    .into())
}

fn write_region_to(file: &File, region: u16, buf: &[u8]) -> Result<()> {
    let offset = region_offset(region);
    seek_to(file, offset)?;

    let mut done = 0;
    let mut last_error = None;
    for _ in 0..SWAP_IO_ATTEMPTS {
        match write_at(file, &buf[done..], offset + done as u64) {
            Ok(n) => done += n,
            Err(e) => last_error = Some(e),
        }
        if done == buf.len() {
            return Ok(());
        }
    }

    Err(FatalStorageError::SwapWrite {
        region,
        remaining: buf.len() - done,
        source: last_error
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::WriteZero, "short write")),
    }
    .into())
}

#[cfg(target_os = "linux")]
fn reserve(file: &File, len: u64) {
    use std::os::unix::io::AsRawFd;

    // SAFETY: posix_fallocate only reads the descriptor and the two integer
    // arguments. The descriptor is valid for the duration of the call because
    // `file` is borrowed.
    let rc = unsafe { libc::posix_fallocate(file.as_raw_fd(), 0, len as libc::off_t) };
    if rc != 0 {
        debug!(len, rc, "posix_fallocate on swap file failed");
    }
}

#[cfg(not(target_os = "linux"))]
fn reserve(_file: &File, _len: u64) {}

#[cfg(target_os = "linux")]
fn advise(file: &File, advice: Advice) {
    use std::os::unix::io::AsRawFd;

    let flag = match advice {
        Advice::Sequential => libc::POSIX_FADV_SEQUENTIAL,
        Advice::Random => libc::POSIX_FADV_RANDOM,
    };
    // SAFETY: posix_fadvise is a hint; it does not touch memory and the
    // descriptor stays valid while `file` is borrowed.
    unsafe {
        libc::posix_fadvise(file.as_raw_fd(), 0, 0, flag);
    }
}

#[cfg(not(target_os = "linux"))]
fn advise(_file: &File, _advice: Advice) {}
