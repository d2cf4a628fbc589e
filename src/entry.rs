//! Boot descriptor handling
//!
//! A descriptor is a small text file:
//!
//! ```text
//! Ubuntu Touch
//! /dev/block/mmcblk1p2:/boot/zImage:/boot/initrd.img
//! +root=/dev/mmcblk1p2 rw
//! ```
//!
//! Line 1 is the menu name, line 2 is `blkdev:kernel[:initrd]` and line 3 the
//! command line directive (see [`crate::cmdline`]).

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::cmdline::CmdlineBuilder;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("cannot open \"{path}\": {source}")]
    Open {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("cannot read \"{path}\": {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("file \"{0}\" must have at least 2 lines")]
    TooShort(String),
    #[error("missing block device in \"{0}\"")]
    MissingBlockDevice(String),
    #[error("missing kernel in \"{0}\"")]
    MissingKernel(String),
    #[error("cannot open \"{path}\": {source}")]
    ReadDir {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// A single boot entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootEntry {
    pub name: String,
    pub block_device: String,
    pub kernel: String,
    pub initrd: Option<String>,
    pub cmdline: String,
}

/// What the kernel loader needs once an entry has been chosen
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootTarget {
    pub block_device: String,
    pub kernel: String,
    pub initrd: Option<String>,
    pub cmdline: String,
}

impl From<BootEntry> for BootTarget {
    fn from(entry: BootEntry) -> Self {
        Self {
            block_device: entry.block_device,
            kernel: entry.kernel,
            initrd: entry.initrd,
            cmdline: entry.cmdline,
        }
    }
}

/// The browsable entries, numbered from 1 in menu order
#[derive(Debug, Default, Clone)]
pub struct EntryList {
    entries: Vec<BootEntry>,
}

impl EntryList {
    pub fn push(&mut self, entry: BootEntry) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up an entry by its menu number
    pub fn get(&self, id: usize) -> Option<&BootEntry> {
        id.checked_sub(1).and_then(|idx| self.entries.get(idx))
    }

    /// Entries paired with their menu numbers
    pub fn iter(&self) -> impl Iterator<Item = (usize, &BootEntry)> {
        self.entries.iter().enumerate().map(|(i, e)| (i + 1, e))
    }
}

/// Parses descriptors into entries
pub struct Parser<'a> {
    new_root: &'a str,
    cmdline: &'a CmdlineBuilder,
}

impl<'a> Parser<'a> {
    /// `new_root` is the mount point kernel and initrd paths are rebased on
    pub fn new(new_root: &'a str, cmdline: &'a CmdlineBuilder) -> Self {
        Self { new_root, cmdline }
    }

    /// Parse descriptor text; `fallback_name` is used when line 1 is blank
    pub fn parse_str(
        &self,
        content: &str,
        source: &str,
        fallback_name: &str,
    ) -> Result<BootEntry, ParseError> {
        let mut lines = content.lines().map(|l| l.trim_end_matches('\r'));

        let (Some(name), Some(paths)) = (lines.next(), lines.next()) else {
            return Err(ParseError::TooShort(source.to_string()));
        };
        let directive = lines.next().unwrap_or("");

        let name = if name.is_empty() {
            log::warn!("file \"{}\" doesn't have a DESCRIPTION/NAME", source);
            log::info!("will use \"{}\" as name", fallback_name);
            fallback_name.to_string()
        } else {
            name.to_string()
        };

        let mut fields = paths.splitn(3, ':');
        let block_device = fields.next().unwrap_or("");
        if block_device.is_empty() {
            return Err(ParseError::MissingBlockDevice(source.to_string()));
        }
        let kernel = self
            .rebase(fields.next().unwrap_or(""))
            .ok_or_else(|| ParseError::MissingKernel(source.to_string()))?;
        // anything after a further ':' is ignored
        let initrd = fields
            .next()
            .and_then(|rest| self.rebase(rest.split(':').next().unwrap_or("")));

        Ok(BootEntry {
            name,
            block_device: block_device.to_string(),
            kernel,
            initrd,
            cmdline: self.cmdline.resolve(directive),
        })
    }

    /// Parse one descriptor file
    pub fn parse_file(&self, path: &Path, fallback_name: &str) -> Result<BootEntry, ParseError> {
        let source = path.display().to_string();
        let bytes = fs::read(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => ParseError::Open {
                path: source.clone(),
                source: e,
            },
            _ => ParseError::Read {
                path: source.clone(),
                source: e,
            },
        })?;
        self.parse_str(&String::from_utf8_lossy(&bytes), &source, fallback_name)
    }

    /// Parse the optional default descriptor; a missing file is not an error
    pub fn parse_default(&self, path: &Path) -> Result<Option<BootEntry>, ParseError> {
        if !path.exists() {
            return Ok(None);
        }
        self.parse_file(path, "default").map(Some)
    }

    /// Parse every regular file of `dir`, in file name order.
    ///
    /// Per-file errors are handed to `on_error` and the file is skipped; an
    /// error returned by `on_error` aborts the scan. An unreadable directory
    /// is a fatal [`ParseError::ReadDir`].
    pub fn scan_dir<F>(&self, dir: &Path, mut on_error: F) -> anyhow::Result<EntryList>
    where
        F: FnMut(&Path, &ParseError) -> anyhow::Result<()>,
    {
        let read_dir_err = |source| ParseError::ReadDir {
            path: dir.display().to_string(),
            source,
        };

        let mut files: Vec<PathBuf> = fs::read_dir(dir)
            .map_err(read_dir_err)?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| !t.is_dir()).unwrap_or(false))
            .map(|e| e.path())
            .collect();
        files.sort();

        let mut list = EntryList::default();
        for path in files {
            log::debug!("parsing {}", path.display());
            let fallback = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();

            match self.parse_file(&path, &fallback) {
                Ok(entry) => list.push(entry),
                Err(e) => {
                    log::debug!("skipping {}: {}", path.display(), e);
                    on_error(&path, &e)?;
                }
            }
        }

        Ok(list)
    }

    fn rebase(&self, path: &str) -> Option<String> {
        let path = path.strip_prefix('/').unwrap_or(path);
        if path.is_empty() {
            return None;
        }
        Some(format!("{}{}", self.new_root, path))
    }
}
