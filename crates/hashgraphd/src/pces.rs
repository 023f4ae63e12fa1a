//! Preconsensus event stream
//!
//! Every linked event is appended here before consensus sees it, so a
//! restarted node can rebuild its not-yet-ordered state by replaying the
//! stream into a fresh engine.
//!
//! ## File layout
//!
//! A stream is a directory of files. The file being written is named
//! `<index>.pces.open`; once closed it is renamed to
//! `<index>_seq<first>-<last>_br<min>-<max>_origin<round>.pces` and never
//! written again.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Magic "PCES" (4) │ Version (2, LE) │ Origin round (8, LE)    │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Record length (4, LE) │ postcard PcesRecord │ BLAKE3[..4]    │
//! │ ...                                                          │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The origin is the round the stream restarted from. After a reconnect the
//! writer registers a discontinuity and later files carry the new origin;
//! replay only reads files of the newest origin it can resume from.

use hashgraph_core::types::Event;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Magic bytes at the start of every file
const PCES_MAGIC: [u8; 4] = *b"PCES";

/// Current file format version
const PCES_VERSION: u16 = 1;

/// Magic + version + origin
const HEADER_SIZE: usize = 14;

/// Truncated BLAKE3 checksum size
const CHECKSUM_SIZE: usize = 4;

const OPEN_SUFFIX: &str = ".pces.open";
const CLOSED_SUFFIX: &str = ".pces";

/// Errors that can occur in the event stream
#[derive(Debug, Error)]
pub enum PcesError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    #[error("invalid header in {0}")]
    InvalidHeader(PathBuf),

    #[error("corrupted record in {path} at offset {offset}")]
    Corrupted { path: PathBuf, offset: u64 },

    #[error("minimum birth round to store cannot decrease from {current} to {requested}")]
    MinimumLowered { current: u64, requested: u64 },
}

pub type PcesResult<T> = Result<T, PcesError>;

/// One stored event
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PcesRecord {
    sequence: u64,
    event: Event,
}

/// Metadata of a closed file, parsed from its name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcesFile {
    pub index: u64,
    pub first_sequence: u64,
    pub last_sequence: u64,
    pub min_birth_round: u64,
    pub max_birth_round: u64,
    pub origin: u64,
    pub path: PathBuf,
}

impl PcesFile {
    fn file_name(&self) -> String {
        format!(
            "{:010}_seq{}-{}_br{}-{}_origin{}{}",
            self.index,
            self.first_sequence,
            self.last_sequence,
            self.min_birth_round,
            self.max_birth_round,
            self.origin,
            CLOSED_SUFFIX
        )
    }

    fn parse(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.strip_suffix(CLOSED_SUFFIX)?;
        let mut parts = name.split('_');
        let index = parts.next()?.parse().ok()?;
        let (first_sequence, last_sequence) = parse_range(parts.next()?.strip_prefix("seq")?)?;
        let (min_birth_round, max_birth_round) = parse_range(parts.next()?.strip_prefix("br")?)?;
        let origin = parts.next()?.strip_prefix("origin")?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            index,
            first_sequence,
            last_sequence,
            min_birth_round,
            max_birth_round,
            origin,
            path: path.to_path_buf(),
        })
    }
}

fn parse_range(text: &str) -> Option<(u64, u64)> {
    let (a, b) = text.split_once('-')?;
    Some((a.parse().ok()?, b.parse().ok()?))
}

fn open_index(path: &Path) -> Option<u64> {
    path.file_name()?
        .to_str()?
        .strip_suffix(OPEN_SUFFIX)?
        .parse()
        .ok()
}

fn checksum(payload: &[u8]) -> [u8; CHECKSUM_SIZE] {
    let hash = blake3::hash(payload);
    let mut out = [0u8; CHECKSUM_SIZE];
    out.copy_from_slice(&hash.as_bytes()[..CHECKSUM_SIZE]);
    out
}

fn encode_header(origin: u64) -> [u8; HEADER_SIZE] {
    let mut header = [0u8; HEADER_SIZE];
    header[..4].copy_from_slice(&PCES_MAGIC);
    header[4..6].copy_from_slice(&PCES_VERSION.to_le_bytes());
    header[6..].copy_from_slice(&origin.to_le_bytes());
    header
}

fn encode_record(record: &PcesRecord) -> PcesResult<Vec<u8>> {
    let payload = postcard::to_allocvec(record)?;
    let mut bytes = Vec::with_capacity(4 + payload.len() + CHECKSUM_SIZE);
    bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    bytes.extend_from_slice(&payload);
    bytes.extend_from_slice(&checksum(&payload));
    Ok(bytes)
}

/// Contents of one file
struct FileContents {
    origin: u64,
    records: Vec<PcesRecord>,
    /// Length of the readable prefix
    valid_len: u64,
    /// Whether bytes after `valid_len` were discarded
    damaged_tail: bool,
}

/// Read a file. A damaged tail ends the read when `tolerate_tail` is set
/// (files that were never closed) and is an error otherwise.
fn read_file(path: &Path, tolerate_tail: bool) -> PcesResult<FileContents> {
    let data = std::fs::read(path)?;
    if data.len() < HEADER_SIZE
        || data[..4] != PCES_MAGIC
        || u16::from_le_bytes([data[4], data[5]]) != PCES_VERSION
    {
        return Err(PcesError::InvalidHeader(path.to_path_buf()));
    }
    let mut origin_bytes = [0u8; 8];
    origin_bytes.copy_from_slice(&data[6..HEADER_SIZE]);
    let origin = u64::from_le_bytes(origin_bytes);

    let mut records = Vec::new();
    let mut offset = HEADER_SIZE;
    while offset < data.len() {
        match decode_record(&data[offset..]) {
            Some((record, used)) => {
                records.push(record);
                offset += used;
            }
            None if tolerate_tail => {
                warn!(
                    "Discarding damaged tail of {} at offset {}",
                    path.display(),
                    offset
                );
                return Ok(FileContents {
                    origin,
                    records,
                    valid_len: offset as u64,
                    damaged_tail: true,
                });
            }
            None => {
                return Err(PcesError::Corrupted {
                    path: path.to_path_buf(),
                    offset: offset as u64,
                })
            }
        }
    }
    Ok(FileContents {
        origin,
        records,
        valid_len: offset as u64,
        damaged_tail: false,
    })
}

/// Decode one record, returning it with the bytes consumed
fn decode_record(data: &[u8]) -> Option<(PcesRecord, usize)> {
    let len_bytes: [u8; 4] = data.get(..4)?.try_into().ok()?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    let payload = data.get(4..4 + len)?;
    let stored = data.get(4 + len..4 + len + CHECKSUM_SIZE)?;
    if stored != checksum(payload) {
        return None;
    }
    let record = postcard::from_bytes(payload).ok()?;
    Some((record, 4 + len + CHECKSUM_SIZE))
}

/// Closed files of a directory sorted by index
fn closed_files(dir: &Path) -> PcesResult<Vec<PcesFile>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if let Some(file) = PcesFile::parse(&path) {
            files.push(file);
        }
    }
    files.sort_by_key(|f| f.index);
    Ok(files)
}

fn open_files(dir: &Path) -> PcesResult<Vec<(u64, PathBuf)>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if let Some(index) = open_index(&path) {
            files.push((index, path));
        }
    }
    files.sort();
    Ok(files)
}

// =============================================================================
// WRITER
// =============================================================================

/// File currently being appended to
struct OpenFile {
    index: u64,
    origin: u64,
    path: PathBuf,
    writer: BufWriter<File>,
    first_sequence: u64,
    last_sequence: u64,
    min_birth_round: u64,
    max_birth_round: u64,
    count: u64,
}

/// Appends events to the stream
pub struct PcesWriter {
    dir: PathBuf,
    preferred_file_event_count: u64,
    origin: u64,
    next_sequence: u64,
    next_index: u64,
    minimum_birth_round_to_store: u64,
    current: Option<OpenFile>,
}

impl PcesWriter {
    /// Open the stream in `dir`, sealing any file left open by a crash.
    ///
    /// New files continue the origin of the newest existing file, or use
    /// `default_origin` for an empty directory.
    pub fn open(
        dir: impl AsRef<Path>,
        preferred_file_event_count: u64,
        default_origin: u64,
    ) -> PcesResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        for (index, path) in open_files(&dir)? {
            seal_open_file(index, &path)?;
        }

        let files = closed_files(&dir)?;
        let origin = files.last().map_or(default_origin, |f| f.origin);
        let next_sequence = files.iter().map(|f| f.last_sequence + 1).max().unwrap_or(0);
        let next_index = files.last().map_or(0, |f| f.index + 1);

        info!(
            "Opened preconsensus event stream at {} ({} files, origin {}, next sequence {})",
            dir.display(),
            files.len(),
            origin,
            next_sequence
        );

        Ok(Self {
            dir,
            preferred_file_event_count,
            origin,
            next_sequence,
            next_index,
            minimum_birth_round_to_store: 0,
            current: None,
        })
    }

    /// Append an event. Returns its sequence number, or `None` when its
    /// birth round is below the minimum to store.
    pub fn append(&mut self, event: &Event) -> PcesResult<Option<u64>> {
        if event.birth_round() < self.minimum_birth_round_to_store {
            return Ok(None);
        }
        let sequence = self.next_sequence;
        let bytes = encode_record(&PcesRecord {
            sequence,
            event: event.clone(),
        })?;

        let mut file = match self.current.take() {
            Some(file) => file,
            None => self.start_file()?,
        };
        let written = file.writer.write_all(&bytes);
        if written.is_ok() {
            if file.count == 0 {
                file.first_sequence = sequence;
            }
            file.last_sequence = sequence;
            file.min_birth_round = file.min_birth_round.min(event.birth_round());
            file.max_birth_round = file.max_birth_round.max(event.birth_round());
            file.count += 1;
        }
        let full = file.count >= self.preferred_file_event_count;
        self.current = Some(file);
        written?;
        self.next_sequence += 1;

        if full {
            self.close_current()?;
        }
        Ok(Some(sequence))
    }

    fn start_file(&mut self) -> PcesResult<OpenFile> {
        let index = self.next_index;
        self.next_index += 1;
        let path = self.dir.join(format!("{:010}{}", index, OPEN_SUFFIX));
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&encode_header(self.origin))?;
        debug!("Started preconsensus file {}", path.display());

        Ok(OpenFile {
            index,
            origin: self.origin,
            path,
            writer,
            first_sequence: 0,
            last_sequence: 0,
            min_birth_round: u64::MAX,
            max_birth_round: 0,
            count: 0,
        })
    }

    /// Make every appended event durable
    pub fn flush(&mut self) -> PcesResult<()> {
        if let Some(file) = self.current.as_mut() {
            file.writer.flush()?;
            file.writer.get_ref().sync_data()?;
        }
        Ok(())
    }

    fn close_current(&mut self) -> PcesResult<()> {
        let Some(mut file) = self.current.take() else {
            return Ok(());
        };
        file.writer.flush()?;
        file.writer.get_ref().sync_all()?;
        let mut closed = PcesFile {
            index: file.index,
            first_sequence: file.first_sequence,
            last_sequence: file.last_sequence,
            min_birth_round: file.min_birth_round,
            max_birth_round: file.max_birth_round,
            origin: file.origin,
            path: PathBuf::new(),
        };
        closed.path = self.dir.join(closed.file_name());
        drop(file.writer);
        std::fs::rename(&file.path, &closed.path)?;
        debug!("Closed preconsensus file {}", closed.path.display());
        Ok(())
    }

    /// Close the current file; later events belong to a stream restarted at
    /// `origin_round`.
    pub fn register_discontinuity(&mut self, origin_round: u64) -> PcesResult<()> {
        self.close_current()?;
        info!(
            "Preconsensus stream discontinuity, new origin round {}",
            origin_round
        );
        self.origin = origin_round;
        Ok(())
    }

    /// Stop storing events born before `round`
    pub fn set_minimum_birth_round_to_store(&mut self, round: u64) -> PcesResult<()> {
        if round < self.minimum_birth_round_to_store {
            return Err(PcesError::MinimumLowered {
                current: self.minimum_birth_round_to_store,
                requested: round,
            });
        }
        self.minimum_birth_round_to_store = round;
        Ok(())
    }

    pub fn minimum_birth_round_to_store(&self) -> u64 {
        self.minimum_birth_round_to_store
    }

    /// Delete closed files holding only events born before
    /// `ancient_threshold`. Returns the number of files removed.
    pub fn compact(&mut self, ancient_threshold: u64) -> PcesResult<usize> {
        let mut removed = 0;
        for file in closed_files(&self.dir)? {
            if file.max_birth_round < ancient_threshold {
                std::fs::remove_file(&file.path)?;
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(
                "Compacted {} preconsensus files below birth round {}",
                removed, ancient_threshold
            );
        }
        Ok(removed)
    }

    /// Flush and close the current file
    pub fn close(&mut self) -> PcesResult<()> {
        self.close_current()
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Turn a file left open by a crash into a closed file, dropping its
/// damaged tail. Files without a single readable record are deleted.
fn seal_open_file(index: u64, path: &Path) -> PcesResult<()> {
    let contents = match read_file(path, true) {
        Ok(contents) => contents,
        Err(PcesError::InvalidHeader(_)) => {
            warn!("Removing preconsensus file {} without a header", path.display());
            std::fs::remove_file(path)?;
            return Ok(());
        }
        Err(e) => return Err(e),
    };
    let (Some(first), Some(last)) = (contents.records.first(), contents.records.last()) else {
        std::fs::remove_file(path)?;
        return Ok(());
    };
    if contents.damaged_tail {
        OpenOptions::new()
            .write(true)
            .open(path)?
            .set_len(contents.valid_len)?;
    }

    let birth_rounds = contents.records.iter().map(|r| r.event.birth_round());
    let mut closed = PcesFile {
        index,
        first_sequence: first.sequence,
        last_sequence: last.sequence,
        min_birth_round: birth_rounds.clone().min().unwrap_or(0),
        max_birth_round: birth_rounds.max().unwrap_or(0),
        origin: contents.origin,
        path: PathBuf::new(),
    };
    closed.path = path.with_file_name(closed.file_name());
    std::fs::rename(path, &closed.path)?;
    info!(
        "Sealed preconsensus file {} with {} events",
        closed.path.display(),
        contents.records.len()
    );
    Ok(())
}

// =============================================================================
// REPLAY
// =============================================================================

/// Events to feed back into consensus after a restart, in sequence order.
///
/// Reads the files of the newest origin that is not after `starting_round`
/// and keeps events born at or after `lower_bound`. A damaged tail is
/// tolerated only in a file that was never closed.
pub fn replay_events(
    dir: impl AsRef<Path>,
    starting_round: u64,
    lower_bound: u64,
) -> PcesResult<Vec<Event>> {
    let dir = dir.as_ref();
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let closed = closed_files(dir)?;
    let open = open_files(dir)?;

    let mut sources: Vec<(u64, PathBuf, bool)> = closed
        .into_iter()
        .filter(|f| f.max_birth_round >= lower_bound)
        .map(|f| (f.index, f.path, false))
        .chain(open.into_iter().map(|(index, path)| (index, path, true)))
        .collect();
    sources.sort_by_key(|(index, _, _)| *index);

    let mut by_origin: Vec<(u64, Vec<PcesRecord>)> = Vec::new();
    for (_, path, tolerate_tail) in &sources {
        let contents = read_file(path, *tolerate_tail)?;
        if contents.origin > starting_round {
            continue;
        }
        match by_origin.iter_mut().find(|(o, _)| *o == contents.origin) {
            Some((_, records)) => records.extend(contents.records),
            None => by_origin.push((contents.origin, contents.records)),
        }
    }

    let Some((origin, mut records)) = by_origin.into_iter().max_by_key(|(o, _)| *o) else {
        return Ok(Vec::new());
    };
    records.sort_by_key(|r| r.sequence);
    let events: Vec<Event> = records
        .into_iter()
        .map(|r| r.event)
        .filter(|e| e.birth_round() >= lower_bound)
        .collect();
    info!(
        "Replaying {} preconsensus events of origin {} from birth round {}",
        events.len(),
        origin,
        lower_bound
    );
    Ok(events)
}
