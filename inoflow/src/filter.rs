use std::fs;
use std::io;
use std::path::Path;

use inoflow_common::{cstr, AllowedPrefix, PREFIXES_MAX, PREFIX_LEN_MAX};
use log::warn;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FilterError {
    #[error("failed to read allowed paths file {path}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("allowed path prefix on line {line} is too long ({len} bytes)")]
    PrefixTooLong { line: usize, len: usize },
}

/// Allow-by-prefix, deny-by-default path filter. An empty table permits
/// everything; the engine re-evaluates it on every event.
#[derive(Debug)]
pub struct PathFilter {
    table: [AllowedPrefix; PREFIXES_MAX],
    len: usize,
}

impl PathFilter {
    /// Filter with no entries: every path is permitted.
    pub fn permit_all() -> Self {
        Self { table: [AllowedPrefix::disabled(); PREFIXES_MAX], len: 0 }
    }

    pub fn from_prefixes<'a, I>(prefixes: I) -> Result<Self, FilterError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut filter = Self::permit_all();
        for (n, prefix) in prefixes.into_iter().enumerate() {
            filter.push(prefix, n + 1)?;
        }
        Ok(filter)
    }

    /// Load one prefix per line; blank lines and `#` comments are skipped.
    /// An unreadable file or an overlong prefix is fatal, so no partial
    /// filter state can be installed.
    pub fn load(path: &Path) -> Result<Self, FilterError> {
        let text = fs::read_to_string(path).map_err(|source| FilterError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut filter = Self::permit_all();
        for (n, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            filter.push(line, n + 1)?;
        }
        Ok(filter)
    }

    fn push(&mut self, prefix: &str, line: usize) -> Result<(), FilterError> {
        let bytes = prefix.as_bytes();
        if bytes.len() > PREFIX_LEN_MAX - 1 {
            return Err(FilterError::PrefixTooLong { line, len: bytes.len() });
        }
        if self.len == PREFIXES_MAX {
            warn!("allowed path table full ({PREFIXES_MAX} entries), ignoring '{prefix}'");
            return Ok(());
        }
        let entry = &mut self.table[self.len];
        entry.prefix[..bytes.len()].copy_from_slice(bytes);
        entry.enabled = true;
        self.len += 1;
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether `path` starts with at least one enabled prefix. Byte-wise
    /// and case-sensitive; comparison stops at the first NUL of either
    /// side. With no enabled entries everything is permitted.
    pub fn permit(&self, path: &[u8]) -> bool {
        if self.len == 0 {
            return true;
        }
        let path = cstr(path);
        self.table[..self.len]
            .iter()
            .filter(|e| e.enabled)
            .any(|e| path.starts_with(cstr(&e.prefix)))
    }
}
