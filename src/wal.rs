//! Segmented write-ahead log with a background flush task.
//!
//! Appends land in an in-memory buffer over the active segment file and reach disk when the
//! flush task ticks or the caller syncs. Segments rotate at a size threshold; retention drops
//! the oldest segment once the directory is at its cap. On reopen a torn tail frame left by an
//! interrupted write is truncated away and the sequence resumes after the last intact entry.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{self, Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use std::fmt;

use crate::entry::{self, Entry};
use crate::helpers::MEBI;
use crate::map_err;
use crate::segment;

const MAX_ENTRY_SIZE: usize = MEBI;
const FRAME_PREFIX_SIZE: u64 = size_of::<i32>() as u64;

#[derive(Debug)]
pub enum Error {
    /// Underlying filesystem operation failed.
    Io(io::Error),
    /// Entry codec failure.
    Entry(entry::Error),
    /// Payload exceeds the per-entry cap.
    EntryTooLarge { size: usize, max: usize },
    /// Replay hit an unreadable frame. Unlike recovery, replay never repairs.
    Corrupt { segment: u64, offset: u64 },
    /// The handle was closed.
    Closed,
}

map_err!(Io, io::Error);
map_err!(Entry, entry::Error);

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "{e}"),
            Self::Entry(e) => write!(f, "{e}"),
            Self::EntryTooLarge { size, max } => {
                write!(f, "entry too large: {size} bytes (max {max})")
            }
            Self::Corrupt { segment, offset } => {
                write!(f, "corrupt log: segment {segment} unreadable at offset {offset}")
            }
            Self::Closed => write!(f, "log is closed"),
        }
    }
}

impl std::error::Error for Error {}

/// Tunables for a log handle. All fields have defaults via [`Config::default()`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the segment files. Created on open if absent. The
    /// directory is assumed exclusively owned by one handle at a time.
    pub directory: PathBuf,

    /// Rotation threshold in framed bytes (length prefixes included).
    pub max_file_size: u64,

    /// Cap on segments retained; the oldest is deleted on rotation.
    pub max_segment_count: usize,

    /// Whether syncs call fsync after draining the write buffer. Without it a
    /// sync survives a process crash but not power loss.
    pub enable_fsync: bool,

    /// Every N-th LSN is flagged as a checkpoint. Must be nonzero.
    pub checkpoint_frequency: u64,

    /// Period of the background flush task.
    pub sync_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("wal"),
            max_file_size: 16 * MEBI as u64,
            max_segment_count: 8,
            enable_fsync: true,
            checkpoint_frequency: 1000,
            sync_interval: Duration::from_millis(200),
        }
    }
}

/// Point-in-time snapshot of the log's counters.
#[derive(Debug, Clone, Copy)]
pub struct WalStats {
    /// The LSN the next append will be assigned.
    pub next_lsn: u64,

    /// Id of the segment currently accepting appends.
    pub active_segment_id: u64,

    /// Segment files on disk, the active one included.
    pub segment_count: usize,
}

struct Inner {
    writer: BufWriter<File>,
    active_segment_id: u64,
    last_lsn: u64,
    /// Total framed bytes destined for the active segment: bytes already in
    /// the file plus bytes pending in the buffer.
    segment_bytes: u64,
    last_flush: Instant,
    closed: bool,
}

struct FlushTask {
    handle: Mutex<Option<JoinHandle<()>>>,
    wakeup: Arc<(Mutex<bool>, Condvar)>,
    shutdown: Arc<AtomicBool>,
}

/// A segmented write-ahead log.
///
/// One handle owns its directory for the handle's lifetime; opening two
/// handles on the same directory is outside the contract. Appends are
/// linearized by an internal mutex, so entries reach disk in the order their
/// [`append`](Self::append) calls returned and LSNs are strictly increasing
/// in that order.
///
/// A returned `append` does NOT mean the entry is durable. Durability holds
/// only for entries written before a completed [`sync`](Self::sync) (with
/// [`Config::enable_fsync`] for crash-consistency against power loss, not
/// just process crash). The background flush task syncs every
/// [`Config::sync_interval`].
///
/// # Examples
///
/// ```no_run
/// use narwal::{Config, Wal};
///
/// let wal = Wal::open(Config::default()).unwrap();
/// let lsn = wal.append(b"hello").unwrap();
/// wal.sync().unwrap();
///
/// for entry in wal.replay().unwrap() {
///     println!("[{}] {} bytes", entry.lsn, entry.payload.len());
/// }
/// # let _ = lsn;
/// ```
pub struct Wal {
    config: Config,
    inner: Arc<Mutex<Inner>>,
    flusher: FlushTask,
}

impl Wal {
    /// Opens or creates a log at `config.directory`.
    ///
    /// The active segment is the highest-id segment below the rotation
    /// threshold (a fresh one otherwise). Its frames are scanned to recover
    /// the next LSN; a torn tail left by an interrupted write is truncated
    /// away, preserving every intact frame before it.
    ///
    /// # Panics
    ///
    /// Panics if `checkpoint_frequency` is zero or `max_segment_count` is zero.
    pub fn open(config: Config) -> Result<Self, Error> {
        assert!(config.checkpoint_frequency > 0, "checkpoint_frequency must be nonzero");
        assert!(config.max_segment_count > 0, "max_segment_count must be nonzero");

        fs::create_dir_all(&config.directory)?;

        let id = segment::find_resume_target(&config.directory, config.max_file_size)?;
        let path = segment::segment_path(&config.directory, id);

        let mut recovered = recover_segment(&path, id)?;
        if recovered.is_none() && id > 0 {
            // A full tail forced a fresh active segment; the sequence
            // continues from the newest sealed one.
            let prior = segment::list_segments(&config.directory)?
                .into_iter()
                .filter(|&(sid, _)| sid < id)
                .next_back();
            if let Some((prev_id, prev_path)) = prior {
                recovered = recover_segment(&prev_path, prev_id)?;
            }
        }
        let last_lsn = recovered.map_or(0, |last| last + 1);

        let file = segment::open_for_append(&path)?;
        let segment_bytes = file.metadata()?.len();

        log::info!("wal opened: active segment {id}, next lsn {last_lsn}");

        let inner = Arc::new(Mutex::new(Inner {
            writer: BufWriter::new(file),
            active_segment_id: id,
            last_lsn,
            segment_bytes,
            last_flush: Instant::now(),
            closed: false,
        }));

        let wakeup = Arc::new((Mutex::new(false), Condvar::new()));
        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = spawn_flush_task(
            Arc::clone(&inner),
            Arc::clone(&wakeup),
            Arc::clone(&shutdown),
            config.sync_interval,
            config.enable_fsync,
        );

        Ok(Self {
            config,
            inner,
            flusher: FlushTask { handle: Mutex::new(Some(handle)), wakeup, shutdown },
        })
    }

    /// Appends a payload and returns the LSN assigned to it.
    ///
    /// The frame lands in the write buffer only; see the type-level notes on
    /// durability. Rotation happens inline when the active segment would
    /// cross [`Config::max_file_size`].
    pub fn append(&self, payload: &[u8]) -> Result<u64, Error> {
        if payload.len() > MAX_ENTRY_SIZE {
            return Err(Error::EntryTooLarge { size: payload.len(), max: MAX_ENTRY_SIZE });
        }

        let mut inner = self.inner.lock().unwrap_or_else(sync::PoisonError::into_inner);
        if inner.closed {
            return Err(Error::Closed);
        }

        let lsn = inner.last_lsn;
        let is_checkpoint = lsn % self.config.checkpoint_frequency == 0;
        let encoded = Entry::new(lsn, payload.to_vec(), is_checkpoint).encode()?;
        let frame_len = FRAME_PREFIX_SIZE + encoded.len() as u64;

        if inner.segment_bytes > 0 && inner.segment_bytes + frame_len >= self.config.max_file_size
        {
            self.rotate(&mut inner)?;
        }

        inner.writer.write_all(&(encoded.len() as i32).to_le_bytes())?;
        inner.writer.write_all(&encoded)?;
        inner.segment_bytes += frame_len;
        inner.last_lsn = lsn + 1;

        Ok(lsn)
    }

    /// Seals the active segment and opens the next one, enforcing retention.
    fn rotate(&self, inner: &mut Inner) -> Result<(), Error> {
        let dir = &self.config.directory;

        // Retention runs before the new segment exists, so the on-disk count
        // stays within the cap once rotation completes.
        if segment::list_segments(dir)?.len() >= self.config.max_segment_count
            && let Some((oldest_id, oldest_path)) = segment::oldest(dir)?
        {
            segment::delete(&oldest_path)?;
            log::debug!("retention dropped segment {oldest_id}");
        }

        // Every buffered frame must be in the file before the repair walk
        // reads it, and the sealed segment must be complete on disk before
        // any write lands in the next one.
        flush_inner(inner, self.config.enable_fsync)?;
        let sealed = segment::segment_path(dir, inner.active_segment_id);
        recover_segment(&sealed, inner.active_segment_id)?;

        inner.active_segment_id += 1;
        let file = segment::open_for_append(&segment::segment_path(dir, inner.active_segment_id))?;
        inner.writer = BufWriter::new(file);
        inner.segment_bytes = 0;

        log::debug!(
            "segment rotated: {} -> {}",
            inner.active_segment_id - 1,
            inner.active_segment_id
        );

        Ok(())
    }

    /// Drains the write buffer into the active segment and, when
    /// [`Config::enable_fsync`] is set, fsyncs it. Resets the flush task's
    /// deadline.
    pub fn sync(&self) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap_or_else(sync::PoisonError::into_inner);
        if inner.closed {
            return Err(Error::Closed);
        }
        flush_inner(&mut inner, self.config.enable_fsync)
    }

    /// Reads every entry still on disk, in LSN order: segments ascending by
    /// id, frames in file order within each.
    ///
    /// The write buffer is drained first so every acknowledged append is
    /// observable. An unreadable frame is reported as [`Error::Corrupt`];
    /// replay diagnoses, it never repairs.
    pub fn replay(&self) -> Result<Vec<Entry>, Error> {
        let mut inner = self.inner.lock().unwrap_or_else(sync::PoisonError::into_inner);
        if inner.closed {
            return Err(Error::Closed);
        }
        inner.writer.flush()?;

        let mut entries = Vec::new();
        for (id, path) in segment::list_segments(&self.config.directory)? {
            read_segment(id, &path, &mut entries)?;
        }
        Ok(entries)
    }

    /// Counter snapshot; values may be stale the moment they are returned.
    pub fn stats(&self) -> Result<WalStats, Error> {
        let inner = self.inner.lock().unwrap_or_else(sync::PoisonError::into_inner);
        let segment_count = segment::list_segments(&self.config.directory)?.len();

        Ok(WalStats {
            next_lsn: inner.last_lsn,
            active_segment_id: inner.active_segment_id,
            segment_count,
        })
    }

    /// Stops the flush task, performs a final sync, and marks the handle
    /// closed. Every later operation fails with [`Error::Closed`].
    pub fn close(&self) -> Result<(), Error> {
        {
            let mut inner = self.inner.lock().unwrap_or_else(sync::PoisonError::into_inner);
            if inner.closed {
                return Err(Error::Closed);
            }
            flush_inner(&mut inner, self.config.enable_fsync)?;
            inner.closed = true;
        }

        self.stop_flusher();
        Ok(())
    }

    fn stop_flusher(&self) {
        self.flusher.shutdown.store(true, Ordering::Release);

        let (lock, cvar) = &*self.flusher.wakeup;
        if let Ok(mut stop) = lock.lock() {
            *stop = true;
            cvar.notify_one();
        }

        let handle =
            self.flusher.handle.lock().unwrap_or_else(sync::PoisonError::into_inner).take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        self.stop_flusher();

        let mut inner = self.inner.lock().unwrap_or_else(sync::PoisonError::into_inner);
        if !inner.closed {
            if let Err(e) = flush_inner(&mut inner, self.config.enable_fsync) {
                log::error!("flush on drop failed: {e}");
            }
            inner.closed = true;
        }
    }
}

fn flush_inner(inner: &mut Inner, enable_fsync: bool) -> Result<(), Error> {
    inner.writer.flush()?;
    if enable_fsync {
        inner.writer.get_ref().sync_all()?;
    }
    inner.last_flush = Instant::now();
    Ok(())
}

fn spawn_flush_task(
    inner: Arc<Mutex<Inner>>,
    wakeup: Arc<(Mutex<bool>, Condvar)>,
    shutdown: Arc<AtomicBool>,
    interval: Duration,
    enable_fsync: bool,
) -> JoinHandle<()> {
    thread::spawn(move || flush_loop(&inner, &wakeup, &shutdown, interval, enable_fsync))
}

fn flush_loop(
    inner: &Arc<Mutex<Inner>>,
    wakeup: &(Mutex<bool>, Condvar),
    shutdown: &AtomicBool,
    interval: Duration,
    enable_fsync: bool,
) {
    let (lock, cvar) = wakeup;

    loop {
        if shutdown.load(Ordering::Acquire) {
            break;
        }

        let stop = lock.lock().unwrap_or_else(sync::PoisonError::into_inner);
        let stop = cvar.wait_timeout(stop, interval).unwrap_or_else(sync::PoisonError::into_inner).0;
        let stopping = *stop;
        drop(stop);

        if stopping || shutdown.load(Ordering::Acquire) {
            break;
        }

        let mut inner = inner.lock().unwrap_or_else(sync::PoisonError::into_inner);
        if inner.closed {
            break;
        }
        // An explicit sync inside the window already made the buffer durable.
        if inner.last_flush.elapsed() < interval {
            continue;
        }
        if let Err(e) = flush_inner(&mut inner, enable_fsync) {
            // The task must outlive transient I/O failures; surfacing them is
            // the next sync caller's job.
            log::error!("background flush failed: {e}");
        }
    }
}

enum FrameHeader {
    /// Clean end of file at a frame boundary.
    End,
    /// EOF inside the length prefix, or a negative length.
    Torn,
    Len(usize),
}

fn read_frame_header<R: Read>(reader: &mut R) -> io::Result<FrameHeader> {
    let mut prefix = [0u8; 4];
    let mut filled = 0;
    while filled < prefix.len() {
        let n = reader.read(&mut prefix[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }

    match filled {
        0 => Ok(FrameHeader::End),
        4 => {
            let len = i32::from_le_bytes(prefix);
            if len < 0 { Ok(FrameHeader::Torn) } else { Ok(FrameHeader::Len(len as usize)) }
        }
        _ => Ok(FrameHeader::Torn),
    }
}

/// Reads exactly `buf.len()` bytes; `Ok(false)` means EOF came first.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            return Ok(false);
        }
        filled += n;
    }
    Ok(true)
}

/// Walks a segment's frames, truncating at the first torn one, and returns
/// the last intact entry's LSN. The truncation offset is recorded *before*
/// the frame's length prefix, so the prefix is dropped together with the
/// frame. `Ok(None)` when the file is absent or holds no intact frames.
fn recover_segment(path: &Path, id: u64) -> Result<Option<u64>, Error> {
    let file = match OpenOptions::new().read(true).write(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let file_len = file.metadata()?.len();
    let mut last_lsn = None;
    let mut offset = 0u64;
    {
        let mut reader = BufReader::new(&file);
        loop {
            match read_frame_header(&mut reader)? {
                FrameHeader::End => return Ok(last_lsn),
                FrameHeader::Torn => break,
                FrameHeader::Len(len) => {
                    // A prefix pointing past EOF is the tear itself; checked
                    // up front so a garbage length never drives an allocation.
                    if offset + FRAME_PREFIX_SIZE + len as u64 > file_len {
                        break;
                    }
                    let mut buf = vec![0u8; len];
                    if !read_full(&mut reader, &mut buf)? {
                        break;
                    }
                    match Entry::decode(&buf) {
                        Ok(entry) if entry.verify_crc() => {
                            last_lsn = Some(entry.lsn);
                            offset += FRAME_PREFIX_SIZE + len as u64;
                        }
                        _ => break,
                    }
                }
            }
        }
    }

    log::warn!("repaired torn tail in segment {id}: truncated to {offset} bytes");
    file.set_len(offset)?;
    Ok(last_lsn)
}

fn read_segment(id: u64, path: &Path, out: &mut Vec<Entry>) -> Result<(), Error> {
    let file = segment::open_for_read(path)?;
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let mut offset = 0u64;

    loop {
        match read_frame_header(&mut reader)? {
            FrameHeader::End => return Ok(()),
            FrameHeader::Torn => return Err(Error::Corrupt { segment: id, offset }),
            FrameHeader::Len(len) => {
                if offset + FRAME_PREFIX_SIZE + len as u64 > file_len {
                    return Err(Error::Corrupt { segment: id, offset });
                }
                let mut buf = vec![0u8; len];
                if !read_full(&mut reader, &mut buf)? {
                    return Err(Error::Corrupt { segment: id, offset });
                }
                let Ok(entry) = Entry::decode(&buf) else {
                    return Err(Error::Corrupt { segment: id, offset });
                };
                if !entry.verify_crc() {
                    return Err(Error::Corrupt { segment: id, offset });
                }
                offset += FRAME_PREFIX_SIZE + len as u64;
                out.push(entry);
            }
        }
    }
}
