use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Bytes of framing around each payload: the length prefix and the CRC.
const FRAME_OVERHEAD: u64 = 8;

/// Encode a single event to [len][bincode][crc32] format.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "event too large for log entry"))?;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Storage under the reservation log. Appends go through `Write`; `sync`
/// makes them durable and `truncate` cuts the log back after a failed commit.
pub trait LogFile: Write {
    fn sync(&mut self) -> io::Result<()>;
    fn truncate(&mut self, len: u64) -> io::Result<()>;
}

impl LogFile for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

/// Events recovered from the log plus the byte length of the valid prefix.
#[derive(Debug, Default)]
pub struct Replay {
    pub events: Vec<Event>,
    pub valid_len: u64,
}

/// Append-only reservation log.
///
/// Format per entry: `[u32: len][bincode: Event][u32: crc32]`, where `len`
/// counts only the payload.
///
/// Commits are all-or-nothing: a batch is staged in memory and reaches the
/// file only in `commit`, which on failure cuts the file back to the last
/// durable length. If that cut fails too the log is poisoned and refuses
/// further commits until a compaction rewrites it.
pub struct Wal<F: LogFile = File> {
    file: F,
    path: PathBuf,
    staged: Vec<u8>,
    staged_events: u64,
    durable_len: u64,
    appends_since_compact: u64,
    poisoned: bool,
}

impl Wal<File> {
    /// Open (or create) the log at `path` and return it with its recovered
    /// events. A torn or corrupt tail is cut off so new entries land right
    /// after the last valid one.
    pub fn open(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let replay = Self::replay(path)?;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let on_disk = file.metadata()?.len();
        if on_disk > replay.valid_len {
            tracing::warn!(
                path = %path.display(),
                discarded_bytes = on_disk - replay.valid_len,
                "truncating invalid WAL tail"
            );
            file.set_len(replay.valid_len)?;
            file.sync_all()?;
        }
        let wal = Self::with_file(file, path.to_path_buf(), replay.valid_len);
        Ok((wal, replay.events))
    }

    /// Read every valid entry at `path`. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Replay> {
        match File::open(path) {
            Ok(file) => read_log(BufReader::new(file), path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Replay::default()),
            Err(e) => Err(e),
        }
    }

    /// Write the compacted event set to a temp file next to the log and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(compact_tmp_path(path))?);
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the compacted file over the log and reopen it. A successful
    /// swap clears any poisoning, since the log is now exactly the snapshot.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(compact_tmp_path(&self.path), &self.path)?;
        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.durable_len = file.metadata()?.len();
        self.file = file;
        self.discard_staged();
        self.appends_since_compact = 0;
        if self.poisoned {
            tracing::info!(path = %self.path.display(), "WAL rewritten by compaction, accepting commits again");
            self.poisoned = false;
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }
}

impl<F: LogFile> Wal<F> {
    fn with_file(file: F, path: PathBuf, durable_len: u64) -> Self {
        Self {
            file,
            path,
            staged: Vec::new(),
            staged_events: 0,
            durable_len,
            appends_since_compact: 0,
            poisoned: false,
        }
    }

    /// Stage and commit a single event.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.stage(event)?;
        self.commit()
    }

    /// Encode `event` into the pending batch. Nothing touches the file.
    pub fn stage(&mut self, event: &Event) -> io::Result<()> {
        let mark = self.staged.len();
        if let Err(e) = encode_event(&mut self.staged, event) {
            self.staged.truncate(mark);
            return Err(e);
        }
        self.staged_events += 1;
        Ok(())
    }

    /// Drop the pending batch without writing it.
    pub fn discard_staged(&mut self) {
        self.staged.clear();
        self.staged_events = 0;
    }

    /// Write the pending batch and sync it. On failure the file is cut back
    /// to its length before the batch, so none of the batch survives.
    pub fn commit(&mut self) -> io::Result<()> {
        if self.poisoned {
            self.discard_staged();
            return Err(io::Error::other(format!(
                "WAL {} is poisoned by an earlier failed rollback",
                self.path.display()
            )));
        }
        if self.staged.is_empty() {
            return Ok(());
        }

        let written = self
            .file
            .write_all(&self.staged)
            .and_then(|()| self.file.flush())
            .and_then(|()| self.file.sync());
        match written {
            Ok(()) => {
                self.durable_len += self.staged.len() as u64;
                self.appends_since_compact += self.staged_events;
                self.discard_staged();
                Ok(())
            }
            Err(e) => {
                self.discard_staged();
                self.roll_back();
                Err(e)
            }
        }
    }

    fn roll_back(&mut self) {
        let durable_len = self.durable_len;
        let restored = self
            .file
            .truncate(durable_len)
            .and_then(|()| self.file.sync());
        if let Err(e) = restored {
            tracing::error!(
                path = %self.path.display(),
                durable_len,
                "WAL rollback failed, refusing further commits: {e}"
            );
            self.poisoned = true;
        }
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }
}

fn compact_tmp_path(path: &Path) -> PathBuf {
    path.with_extension("wal.tmp")
}

/// Decode entries until the first short read, CRC mismatch or undecodable
/// payload. Everything from that point on is reported as invalid.
fn read_log(mut reader: impl Read, path: &Path) -> io::Result<Replay> {
    let mut replay = Replay::default();

    loop {
        let mut len_buf = [0u8; 4];
        if !read_full(&mut reader, &mut len_buf)? {
            break;
        }
        let len = u32::from_le_bytes(len_buf);

        let mut payload = vec![0u8; len as usize];
        let mut crc_buf = [0u8; 4];
        if !read_full(&mut reader, &mut payload)? || !read_full(&mut reader, &mut crc_buf)? {
            tracing::warn!(path = %path.display(), "WAL ends in a partial entry");
            break;
        }
        if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
            tracing::warn!(path = %path.display(), "WAL entry failed CRC, discarding tail");
            break;
        }
        match bincode::deserialize::<Event>(&payload) {
            Ok(event) => replay.events.push(event),
            Err(e) => {
                tracing::warn!(path = %path.display(), "undecodable WAL entry, discarding tail: {e}");
                break;
            }
        }
        replay.valid_len += u64::from(len) + FRAME_OVERHEAD;
    }

    Ok(replay)
}

/// `read_exact` that reports a clean or partial end of input as `false`.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}
