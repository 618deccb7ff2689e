use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Frame one record as `[u32 len][bincode payload][u32 crc32]`.
fn encode_record<E: Serialize>(writer: &mut impl Write, record: &E) -> io::Result<()> {
    let payload =
        bincode::serialize(record).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "record larger than 4 GiB"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Result of reading a log back from disk.
#[derive(Debug)]
pub struct Replay<E> {
    pub records: Vec<E>,
    /// Byte offset just past the last intact record.
    pub valid_len: u64,
    /// True when trailing bytes after `valid_len` were torn or corrupt.
    pub torn_tail: bool,
}

/// Append-only write-ahead log of serde records.
///
/// A torn or corrupt tail (crash mid-write) is cut off when the log is opened,
/// so records appended afterwards stay reachable on the next replay.
pub struct Wal<E> {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    _record: PhantomData<fn(E)>,
}

impl<E: Serialize + DeserializeOwned> Wal<E> {
    /// Open (or create) the log at `path`, truncating any torn tail.
    pub fn open(path: &Path) -> io::Result<Self> {
        let replay = Self::replay(path)?;
        if replay.torn_tail {
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(replay.valid_len)?;
            file.sync_all()?;
            tracing::warn!(
                path = %path.display(),
                valid_len = replay.valid_len,
                "truncated torn WAL tail"
            );
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
            _record: PhantomData,
        })
    }

    /// Append and fsync a single record. Production code batches through
    /// `append_buffered` + `flush_sync`.
    #[cfg(test)]
    pub fn append(&mut self, record: &E) -> io::Result<()> {
        self.append_buffered(record)?;
        self.flush_sync()
    }

    /// Buffer one record without syncing.
    pub fn append_buffered(&mut self, record: &E) -> io::Result<()> {
        encode_record(&mut self.writer, record)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Flush buffered records and fsync the file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Write a snapshot to `<path>.tmp` and fsync it. Slow phase.
    pub fn write_compact_file(path: &Path, records: &[E]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(compact_tmp_path(path))?);
        for record in records {
            encode_record(&mut writer, record)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the snapshot over the log and reopen for appending.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(compact_tmp_path(&self.path), &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, records: &[E]) -> io::Result<()> {
        Self::write_compact_file(&self.path, records)?;
        self.swap_compact_file()
    }

    /// Read every intact record. Stops at the first torn or corrupt frame.
    pub fn replay(path: &Path) -> io::Result<Replay<E>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(Replay { records: Vec::new(), valid_len: 0, torn_tail: false });
            }
            Err(e) => return Err(e),
        };
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut records = Vec::new();
        let mut valid_len: u64 = 0;

        while let Some((record, frame_len)) = read_frame::<E>(&mut reader)? {
            records.push(record);
            valid_len += frame_len;
        }

        Ok(Replay { records, valid_len, torn_tail: valid_len < file_len })
    }
}

fn compact_tmp_path(path: &Path) -> PathBuf {
    path.with_extension("wal.tmp")
}

/// Read one frame. `Ok(None)` on clean EOF, truncation, or checksum mismatch.
fn read_frame<E: DeserializeOwned>(reader: &mut impl Read) -> io::Result<Option<(E, u64)>> {
    let mut len_buf = [0u8; 4];
    if !read_exact_or_eof(reader, &mut len_buf)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf) as usize;

    let mut payload = vec![0u8; len];
    if !read_exact_or_eof(reader, &mut payload)? {
        return Ok(None);
    }
    let mut crc_buf = [0u8; 4];
    if !read_exact_or_eof(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    match bincode::deserialize::<E>(&payload) {
        Ok(record) => Ok(Some((record, 8 + len as u64))),
        Err(_) => Ok(None),
    }
}

fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}
