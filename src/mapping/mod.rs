//! Routing Tables
//!
//! Loads the CAN-ID ↔ topic mapping tables from their line-oriented CSV
//! sources. Each table is built once at startup and is read-only from then
//! on; workers share it through an `Arc`.
//!
//! # Format
//!
//! ```text
//! # frame kind, hex CAN id, MQTT topic
//! S,1A2,sensor/temp
//! E,100,ctrl/fan
//! ```
//!
//! Blank lines and lines starting with `#` are ignored. A malformed record
//! is logged and skipped; it never aborts the build.

mod parser;


use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Cursor, Seek, SeekFrom};
use std::path::Path;

use compact_str::CompactString;
use tracing::{debug, error, info, warn};

use crate::can::FrameKind;

pub use parser::{parse_record, LineError, MAX_LINE_LEN, MAX_TOPIC_LEN};

use parser::{read_line, Line};

/// One association between a bus identifier and a broker topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingRule {
    kind: FrameKind,
    id: u32,
    topic: CompactString,
}

impl RoutingRule {
    pub(crate) fn new(kind: FrameKind, id: u32, topic: &str) -> Self {
        Self {
            kind,
            id,
            topic: CompactString::new(topic),
        }
    }

    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn topic_len(&self) -> usize {
        self.topic.len()
    }

    /// Check if a frame with this addressing mode and identifier fires the rule
    pub fn matches_frame(&self, kind: FrameKind, id: u32) -> bool {
        self.kind == kind && self.id == id
    }
}

/// Error building a routing table
#[derive(Debug)]
pub enum TableError {
    /// The source could not be opened or read
    Io(io::Error),
    /// Storage for the given number of rules could not be allocated
    OutOfMemory(usize),
}

impl fmt::Display for TableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableError::Io(e) => write!(f, "IO error: {}", e),
            TableError::OutOfMemory(n) => write!(f, "Out of memory allocating {} rules", n),
        }
    }
}

impl std::error::Error for TableError {}

impl From<io::Error> for TableError {
    fn from(e: io::Error) -> Self {
        TableError::Io(e)
    }
}

/// An ordered, immutable set of routing rules
///
/// Rule order is the source line order. Neither `(kind, id)` pairs nor
/// topics are unique; lookups return every match in table order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingTable {
    rules: Box<[RoutingRule]>,
}

impl RoutingTable {
    /// Build a table from a file on disk
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, TableError> {
        let path = path.as_ref();
        info!("Building routing table from {}", path.display());

        let file = File::open(path).map_err(|e| {
            error!("Failed to open {} for reading: {}", path.display(), e);
            TableError::Io(e)
        })?;

        Self::from_reader(BufReader::new(file))
    }

    /// Build a table from in-memory text
    pub fn parse(source: &str) -> Result<Self, TableError> {
        Self::from_reader(Cursor::new(source.as_bytes()))
    }

    /// Build a table from a seekable reader.
    ///
    /// The source is read twice: the first pass counts the valid records so
    /// the backing storage can be allocated exactly once, the second pass
    /// parses them into place.
    pub fn from_reader<R: BufRead + Seek>(mut reader: R) -> Result<Self, TableError> {
        let capacity = Self::count_records(&mut reader)?;
        debug!("Routing table source holds {} valid records", capacity);

        let mut rules = Vec::new();
        rules
            .try_reserve_exact(capacity)
            .map_err(|_| TableError::OutOfMemory(capacity))?;

        reader.seek(SeekFrom::Start(0))?;

        let mut buf = Vec::with_capacity(MAX_LINE_LEN + 1);
        let mut line_no = 0usize;
        while let Some(line) = read_line(&mut reader, &mut buf)? {
            line_no += 1;
            if let Some(original) = line.truncated {
                warn!(
                    "Line {}: {} bytes truncated to {}",
                    line_no, original, MAX_LINE_LEN
                );
            }

            let record = match line.classify() {
                Line::Record(record) => record,
                Line::Blank | Line::Comment => continue,
                Line::Invalid(e) => {
                    warn!("Line {}: {}", line_no, e);
                    continue;
                }
            };

            match parse_record(record) {
                Ok(rule) => {
                    if rules.len() == capacity {
                        warn!("Line {}: source changed while loading, ignoring", line_no);
                        break;
                    }
                    rules.push(rule);
                }
                Err(e) => {
                    error!("Line {}: this line is invalid [{}]: {}", line_no, record, e);
                }
            }
        }

        Ok(Self {
            rules: rules.into_boxed_slice(),
        })
    }

    fn count_records<R: BufRead>(reader: &mut R) -> Result<usize, TableError> {
        let mut buf = Vec::with_capacity(MAX_LINE_LEN + 1);
        let mut count = 0;
        while let Some(line) = read_line(reader, &mut buf)? {
            if let Line::Record(record) = line.classify() {
                if parse_record(record).is_ok() {
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rules(&self) -> &[RoutingRule] {
        &self.rules
    }

    pub fn iter(&self) -> impl Iterator<Item = &RoutingRule> {
        self.rules.iter()
    }

    /// All rules fired by a frame, in table order
    pub fn match_frame(&self, kind: FrameKind, id: u32) -> impl Iterator<Item = &RoutingRule> {
        self.rules
            .iter()
            .filter(move |rule| rule.matches_frame(kind, id))
    }

    /// All rules whose topic equals `topic` exactly, in table order
    pub fn match_topic<'a>(&'a self, topic: &'a str) -> impl Iterator<Item = &'a RoutingRule> {
        self.rules.iter().filter(move |rule| rule.topic() == topic)
    }

    /// Log every rule, one line each
    pub fn dump(&self, name: &str) {
        info!("{} table: {} rules", name, self.rules.len());
        for (index, rule) in self.rules.iter().enumerate() {
            info!(
                "{}[{}] frame={} canid=0x{:x} topic=[{}] topic_len={}",
                name,
                index,
                rule.kind().code(),
                rule.id(),
                rule.topic(),
                rule.topic_len()
            );
        }
    }
}

impl<'a> IntoIterator for &'a RoutingTable {
    type Item = &'a RoutingRule;
    type IntoIter = std::slice::Iter<'a, RoutingRule>;

    fn into_iter(self) -> Self::IntoIter {
        self.rules.iter()
    }
}
