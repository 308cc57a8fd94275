//! Durable event log. Each record is `[u32 len][bincode Event][u32 crc32]`,
//! little-endian, where `len` counts only the payload.
//!
//! A crash can leave a torn record at the tail. Replay stops at the first
//! record that is short, oversized, fails its checksum or does not decode,
//! and everything before it is kept. Recovery cuts the file back to that
//! point so new records are never appended behind garbage.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::limits::MAX_WAL_RECORD_LEN;
use crate::model::Event;

fn write_record(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload = bincode::serialize(event).map_err(|e| io::Error::new(ErrorKind::InvalidData, e))?;
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())
}

/// Fill `buf` completely. `Ok(false)` means the file ended first.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Next intact record and its size on disk, or `None` at the end of the
/// usable log.
fn read_record(reader: &mut impl Read, index: usize) -> io::Result<Option<(Event, u64)>> {
    let mut word = [0u8; 4];
    if !read_full(reader, &mut word)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(word) as usize;
    if len > MAX_WAL_RECORD_LEN {
        warn!("WAL record {index} claims {len} bytes, stopping replay");
        return Ok(None);
    }

    let mut payload = vec![0u8; len];
    if !read_full(reader, &mut payload)? || !read_full(reader, &mut word)? {
        warn!("WAL record {index} is torn, stopping replay");
        return Ok(None);
    }
    if u32::from_le_bytes(word) != crc32fast::hash(&payload) {
        warn!("WAL record {index} fails its checksum, stopping replay");
        return Ok(None);
    }

    match bincode::deserialize(&payload) {
        Ok(event) => Ok(Some((event, 8 + len as u64))),
        Err(e) => {
            warn!("WAL record {index} does not decode ({e}), stopping replay");
            Ok(None)
        }
    }
}

/// Append-only writer over the log file. Every append is fsynced before it
/// returns.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Replay the log at `path` and open it for appending. A missing file is
    /// an empty log. Replayed records count toward the compaction threshold.
    pub fn recover(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let (events, valid_len) = Self::read_log(path)?;
        if let Ok(meta) = fs::metadata(path)
            && meta.len() > valid_len
        {
            warn!(
                "truncating {} bytes of unreadable WAL tail in {}",
                meta.len() - valid_len,
                path.display()
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        let mut wal = Self::open(path)?;
        wal.appends_since_compact = events.len() as u64;
        Ok((wal, events))
    }

    fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        Self::read_log(path).map(|(events, _)| events)
    }

    /// Intact events plus the byte length of the prefix holding them.
    fn read_log(path: &Path) -> io::Result<(Vec<Event>, u64)> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok((Vec::new(), 0)),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        let mut valid_len = 0u64;
        while let Some((event, size)) = read_record(&mut reader, events.len())? {
            events.push(event);
            valid_len += size;
        }
        Ok((events, valid_len))
    }

    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        write_record(&mut self.writer, event)?;
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replace the log with `events`: write and sync a sibling file, then
    /// rename it over the log. A crash at any point leaves one complete log.
    ///
    /// The sibling's handle becomes the new writer, so once the rename has
    /// happened appends can only land in the live log. On an error before
    /// the rename the current writer is kept.
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        let mut tmp = BufWriter::new(File::create(&tmp_path)?);
        for event in events {
            write_record(&mut tmp, event)?;
        }
        tmp.flush()?;
        tmp.get_ref().sync_all()?;

        fs::rename(&tmp_path, &self.path)?;
        self.writer = tmp;
        self.appends_since_compact = 0;

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            File::open(dir)?.sync_all()?;
        }
        Ok(())
    }
}
