use std::collections::BTreeMap;
use std::io::{self, Write};
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};

use chrono::DateTime;
use inoflow_common::{cstr, FileName, RecordFs, FS_EVENT_TABLE};
use prettytable::{row, Table};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OutputError {
    #[error("failed to render record")]
    Render(#[from] serde_json::Error),
    #[error("failed to send record to {path}")]
    Socket {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to write record to console")]
    Console(#[from] io::Error),
}

/// Output format of rendered records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputMode {
    /// Pretty-printed json
    Json,
    /// Minimal json, one record per line
    JsonMin,
}

/// A finished record decoded into its exported key set.
#[derive(Serialize, Debug)]
pub struct RenderedRecord {
    #[serde(rename = "InfoTimestamp")]
    pub info_timestamp: String,
    #[serde(rename = "FilePath")]
    pub file_path: String,
    #[serde(rename = "File")]
    pub file: String,
    #[serde(rename = "FileMode")]
    pub file_mode: String,
    #[serde(rename = "FileEventCount")]
    pub file_event_count: u32,
    #[serde(rename = "FileEvents")]
    pub file_events: BTreeMap<&'static str, u32>,
    #[serde(rename = "FileInode")]
    pub file_inode: u32,
    #[serde(rename = "FileInodeLinkCount")]
    pub file_inode_link_count: u32,
    #[serde(rename = "FileSize")]
    pub file_size: u64,
    #[serde(rename = "FileSizeChange")]
    pub file_size_change: i64,
    #[serde(rename = "FileAccessTime")]
    pub file_access_time: String,
    #[serde(rename = "FileStatusChangeTime")]
    pub file_status_change_time: String,
    #[serde(rename = "FileModificationTime")]
    pub file_modification_time: String,
}

fn ts_utc(ns: u64) -> String {
    let secs = (ns / 1_000_000_000) as i64;
    let nanos = (ns % 1_000_000_000) as u32;
    DateTime::from_timestamp(secs, nanos)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S%.9fZ").to_string())
        .unwrap_or_default()
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(cstr(bytes)).into_owned()
}

impl RenderedRecord {
    pub fn from_record(record: &RecordFs) -> Self {
        let file = match record.name {
            FileName::Single(ref name) => lossy(name),
            // A rename pair renders as one old>new transition.
            FileName::Renamed { ref from, ref to } => format!("{}>{}", lossy(from), lossy(to)),
        };
        let file_events: BTreeMap<&'static str, u32> = FS_EVENT_TABLE
            .iter()
            .map(|desc| (desc.name, record.event_counts[desc.kind as usize]))
            .filter(|&(_, count)| count > 0)
            .collect();
        Self {
            info_timestamp: ts_utc(record.ts_ns),
            file_path: lossy(&record.filepath),
            file,
            file_mode: record.mode_class().to_string(),
            file_event_count: record.events,
            file_events,
            file_inode: record.ino,
            file_inode_link_count: record.inlink,
            file_size: record.isize,
            file_size_change: record.isize as i64 - record.isize_first as i64,
            file_access_time: ts_utc(record.atime_nsec),
            file_status_change_time: ts_utc(record.ctime_nsec),
            file_modification_time: ts_utc(record.mtime_nsec),
        }
    }
}

/// Record delivery: console and/or a Unix datagram socket, best effort.
pub struct Output {
    mode: OutputMode,
    socket: Option<(UnixDatagram, PathBuf)>,
    console: bool,
}

/// Separates records on the console stream.
const RECORD_SEPARATOR: u8 = 0x1e;

impl Output {
    pub fn new(
        mode: OutputMode,
        socket_path: Option<&Path>,
        console: bool,
    ) -> Result<Self, OutputError> {
        let socket = match socket_path {
            Some(path) => {
                let sock = UnixDatagram::unbound().map_err(|source| OutputError::Socket {
                    path: path.display().to_string(),
                    source,
                })?;
                Some((sock, path.to_path_buf()))
            }
            None => None,
        };
        Ok(Self { mode, socket, console })
    }

    /// Output that goes nowhere; used by tests.
    pub fn discard() -> Self {
        Self { mode: OutputMode::JsonMin, socket: None, console: false }
    }

    pub fn emit(&self, record: &RecordFs) -> Result<(), OutputError> {
        let rendered = RenderedRecord::from_record(record);
        let text = match self.mode {
            OutputMode::Json => serde_json::to_string_pretty(&rendered)?,
            OutputMode::JsonMin => serde_json::to_string(&rendered)?,
        };
        if let Some((sock, path)) = &self.socket {
            sock.send_to(text.as_bytes(), path).map_err(|source| OutputError::Socket {
                path: path.display().to_string(),
                source,
            })?;
        }
        if self.console {
            let mut stdout = io::stdout().lock();
            stdout.write_all(text.as_bytes())?;
            stdout.write_all(&[b'\n', RECORD_SEPARATOR, b'\n'])?;
            stdout.flush()?;
        }
        Ok(())
    }
}

/// Print the legend of exported keys and exit-worthy documentation.
pub fn print_legend() {
    let mut table = Table::new();
    table.set_titles(row!["Key", "Description"]);
    table.add_row(row!["InfoTimestamp", "Record timestamp, UTC with nanoseconds"]);
    table.add_row(row!["FilePath", "Directory path name of file"]);
    table.add_row(row!["File", "File name, or old>new when the record spans a rename"]);
    table.add_row(row!["FileMode", "Regular file, symbolic link or hard link"]);
    table.add_row(row!["FileEventCount", "Total file events merged into the record"]);
    table.add_row(row!["FileEvents", "File event types and per-type counts"]);
    for desc in FS_EVENT_TABLE.iter() {
        table.add_row(row![format!("  {}", desc.name), format!("{} ({})", desc.short, desc.short2)]);
    }
    table.add_row(row!["FileInode", "Inode number of file"]);
    table.add_row(row!["FileInodeLinkCount", "Hard link count of inode"]);
    table.add_row(row!["FileSize", "File size in bytes"]);
    table.add_row(row!["FileSizeChange", "Size change since first observation (can be negative)"]);
    table.add_row(row!["FileAccessTime", "Access timestamp in UTC"]);
    table.add_row(row!["FileStatusChangeTime", "Status change timestamp in UTC"]);
    table.add_row(row!["FileModificationTime", "Modification timestamp in UTC"]);
    table.printstd();
}
