//! Kernel command line resolution
//!
//! Every boot descriptor carries a directive on its third line that is
//! resolved against the command line of the kernel we are running on:
//!
//! - empty: keep the running command line
//! - `+extra`: append `extra` to the running command line
//! - anything else: replace the running command line

use std::fs::File;
use std::io::Read;
use std::path::Path;

use thiserror::Error;

/// Largest command line the kernel accepts
pub const COMMAND_LINE_SIZE: usize = 1024;

#[derive(Debug, Error)]
pub enum CmdlineError {
    #[error("cannot read \"{path}\": {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Resolves descriptor directives against the live kernel command line.
///
/// The live line is read once and cached for every later resolution.
#[derive(Debug, Clone)]
pub struct CmdlineBuilder {
    live: String,
}

impl CmdlineBuilder {
    /// Read the live command line from `path` (normally `/proc/cmdline`)
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CmdlineError> {
        let path = path.as_ref();
        let read_err = |source| CmdlineError::Read {
            path: path.display().to_string(),
            source,
        };

        let mut buf = Vec::with_capacity(COMMAND_LINE_SIZE);
        File::open(path)
            .map_err(read_err)?
            .take(COMMAND_LINE_SIZE as u64)
            .read_to_end(&mut buf)
            .map_err(read_err)?;

        if let Some(end) = buf.iter().position(|&b| b == b'\n') {
            buf.truncate(end);
        }

        Ok(Self::new(String::from_utf8_lossy(&buf)))
    }

    pub fn new(live: impl Into<String>) -> Self {
        let mut live = live.into();
        if let Some(end) = live.find('\n') {
            live.truncate(end);
        }
        if live.len() > COMMAND_LINE_SIZE {
            let mut end = COMMAND_LINE_SIZE;
            while !live.is_char_boundary(end) {
                end -= 1;
            }
            live.truncate(end);
        }
        Self { live }
    }

    /// The running kernel's command line
    pub fn live(&self) -> &str {
        &self.live
    }

    /// Resolve a descriptor directive into a full command line.
    ///
    /// A result longer than [`COMMAND_LINE_SIZE`] is discarded in favour of
    /// the live line.
    pub fn resolve(&self, directive: &str) -> String {
        if directive.is_empty() {
            return self.live.clone();
        }

        let resolved = match directive.strip_prefix('+') {
            Some(extra) => format!("{} {}", self.live, extra),
            None => directive.to_string(),
        };

        if resolved.len() > COMMAND_LINE_SIZE {
            log::error!("command line too long ({} bytes)", resolved.len());
            log::warn!("the current one will be used instead");
            return self.live.clone();
        }

        resolved
    }
}
