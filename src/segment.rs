//! Segment handles: the two flavours of on-disk data/hint file the engine
//! ever touches.
//!
//! An [`ActiveSegment`] is the single file the writer is currently appending
//! to; it owns an independent read descriptor so `get` never contends with
//! `append` for a shared seek position. An [`ImmutableSegment`] is any data
//! file produced by a previous session (or by rotation in this one): it is
//! memory-mapped and only ever read.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use memmap2::Mmap;

use crate::error::{Error, Result};

/// Tracks how many keys that once lived in a segment have since been
/// superseded by a newer write elsewhere, and how many bytes those dead keys
/// occupy. Consumed by an out-of-scope merge process; carried here so one
/// exists to consume.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogStatistics {
    pub live_keys: u64,
    pub dead_keys: u64,
    pub dead_bytes: u64,
}

impl LogStatistics {
    pub fn add_live(&mut self) {
        self.live_keys += 1;
    }

    pub fn add_dead(&mut self, nbytes: u64) {
        self.dead_keys += 1;
        self.dead_bytes += nbytes;
    }

    /// A live key was superseded: move it from the live to the dead column.
    pub fn overwrite(&mut self, nbytes: u64) {
        self.live_keys = self.live_keys.saturating_sub(1);
        self.dead_keys += 1;
        self.dead_bytes += nbytes;
    }

    pub fn fragmentation(&self) -> f64 {
        if self.dead_keys == 0 {
            0.0
        } else {
            let dead = self.dead_keys as f64;
            let live = self.live_keys as f64;
            dead / (dead + live)
        }
    }
}

/// The active, append-only segment. Created lazily: the backing file is only
/// created on the first write.
#[derive(Debug)]
pub struct ActiveSegment {
    id: u64,
    path: PathBuf,
    write: BufWriter<File>,
    read: File,
    size: u64,
    stats: LogStatistics,
}

impl ActiveSegment {
    /// Creates (or truncates-and-reopens) the active segment for `id` inside
    /// `dir`.
    pub fn create(dir: &Path, id: u64) -> Result<Self> {
        let path = data_file_path(dir, id);
        let write_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        let read_file = OpenOptions::new().read(true).open(&path)?;
        let size = write_file.metadata()?.len();
        Ok(Self {
            id,
            path,
            write: BufWriter::new(write_file),
            read: read_file,
            size,
            stats: LogStatistics::default(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn stats(&self) -> LogStatistics {
        self.stats
    }

    pub fn stats_mut(&mut self) -> &mut LogStatistics {
        &mut self.stats
    }

    /// Appends `bytes` to the segment and returns the offset at which this
    /// record starts. Does not flush or fsync: callers control that via
    /// [`ActiveSegment::sync`] so a single `set`/`delete` can batch the
    /// write and the durability barrier.
    pub fn append(&mut self, bytes: &[u8]) -> Result<u64> {
        let record_start = self.size;
        self.write.write_all(bytes)?;
        self.size += bytes.len() as u64;
        Ok(record_start)
    }

    /// Flushes the buffered writer and fsyncs the underlying file.
    pub fn sync(&mut self) -> Result<()> {
        self.write.flush()?;
        self.write.get_ref().sync_all()?;
        Ok(())
    }

    /// Flushes the buffered writer without fsyncing, for `sync_on_write =
    /// false`.
    pub fn flush(&mut self) -> Result<()> {
        self.write.flush()?;
        Ok(())
    }

    pub fn read_at(&self, offset: u64, len: u64) -> Result<Bytes> {
        let mut buf = vec![0u8; len as usize];
        self.read.read_exact_at(&mut buf, offset)?;
        Ok(Bytes::from(buf))
    }

    /// Closes this segment, flushing and fsyncing first.
    pub fn close(mut self) -> Result<()> {
        self.sync()
    }

    /// Finishes writing to this segment and reopens it as a read-only,
    /// memory-mapped [`ImmutableSegment`]. Used when the active segment is
    /// rotated out for a new one.
    pub fn into_immutable(mut self) -> Result<ImmutableSegment> {
        self.sync()?;
        let stats = self.stats;
        let segment = ImmutableSegment::open_with_stats(&self.path, self.id, stats)?;
        Ok(segment)
    }
}

/// A read-only, memory-mapped segment produced by a previous session (or by
/// rotating the active segment out in this one).
#[derive(Debug)]
pub struct ImmutableSegment {
    id: u64,
    mmap: Mmap,
    stats: LogStatistics,
}

impl ImmutableSegment {
    pub fn open(dir: &Path, id: u64) -> Result<Self> {
        Self::open_with_stats(&data_file_path(dir, id), id, LogStatistics::default())
    }

    fn open_with_stats(path: &Path, id: u64, stats: LogStatistics) -> Result<Self> {
        let file = File::open(path)?;
        // SAFETY: the file is exclusively owned by this store for its
        // lifetime and is never truncated or written to once immutable.
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Self { id, mmap, stats })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn size(&self) -> u64 {
        self.mmap.len() as u64
    }

    pub fn stats(&self) -> LogStatistics {
        self.stats
    }

    pub fn stats_mut(&mut self) -> &mut LogStatistics {
        &mut self.stats
    }

    pub fn read_at(&self, offset: u64, len: u64) -> Result<Bytes> {
        let start = offset as usize;
        let end = start
            .checked_add(len as usize)
            .filter(|&end| end <= self.mmap.len())
            .ok_or_else(|| {
                Error::corrupt(self.id, offset, format!("read of {len} bytes past end of segment"))
            })?;
        Ok(Bytes::copy_from_slice(&self.mmap[start..end]))
    }

    pub fn close(self) -> Result<()> {
        Ok(())
    }
}

/// Either flavour of segment, behind one type so the reader path doesn't care
/// which it got.
#[derive(Debug)]
pub enum Segment {
    Active(ActiveSegment),
    Immutable(ImmutableSegment),
}

impl Segment {
    pub fn id(&self) -> u64 {
        match self {
            Segment::Active(s) => s.id(),
            Segment::Immutable(s) => s.id(),
        }
    }

    pub fn read_at(&self, offset: u64, len: u64) -> Result<Bytes> {
        match self {
            Segment::Active(s) => s.read_at(offset, len),
            Segment::Immutable(s) => s.read_at(offset, len),
        }
    }

    pub fn append(&mut self, bytes: &[u8]) -> Result<u64> {
        match self {
            Segment::Active(s) => s.append(bytes),
            Segment::Immutable(_) => Err(Error::InvalidOperation),
        }
    }

    pub fn sync(&mut self) -> Result<()> {
        match self {
            Segment::Active(s) => s.sync(),
            Segment::Immutable(_) => Err(Error::InvalidOperation),
        }
    }

    pub fn stats(&self) -> LogStatistics {
        match self {
            Segment::Active(s) => s.stats(),
            Segment::Immutable(s) => s.stats(),
        }
    }

    pub fn stats_mut(&mut self) -> &mut LogStatistics {
        match self {
            Segment::Active(s) => s.stats_mut(),
            Segment::Immutable(s) => s.stats_mut(),
        }
    }

    pub fn close(self) -> Result<()> {
        match self {
            Segment::Active(s) => s.close(),
            Segment::Immutable(s) => s.close(),
        }
    }
}

pub fn data_file_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{id}.keychain.data"))
}

pub fn hint_file_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{id}.keychain.hint"))
}
