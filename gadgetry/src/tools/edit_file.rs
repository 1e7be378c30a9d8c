//! Edit-file gadget: locates a snippet in a file and replaces it.
//!
//! Matching runs through the layered matcher so minor whitespace or
//! indentation drift between the model's snippet and the file does not
//! block the edit. On failure the closest windows are reported back to the
//! model so it can correct its snippet.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use schemars::JsonSchema;
use serde::Deserialize;
use tracing::debug;

use crate::gadget::{Gadget, GadgetContext, GadgetError, GadgetOutput};
use crate::matcher::{self, MatcherConfig};

/// Minimal stat result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    /// Whether the path exists.
    pub exists: bool,
    /// Size in bytes when it exists.
    pub size: u64,
}

/// The filesystem surface the gadget needs. Nothing else of the wider
/// filesystem is part of the contract.
pub trait FileSystem: Send + Sync {
    /// Read a file to a string.
    ///
    /// # Errors
    ///
    /// Propagates the underlying I/O failure.
    fn read(&self, path: &str) -> io::Result<String>;

    /// Write a string to a file, replacing its content.
    ///
    /// # Errors
    ///
    /// Propagates the underlying I/O failure.
    fn write(&self, path: &str, content: &str) -> io::Result<()>;

    /// Stat a path.
    ///
    /// # Errors
    ///
    /// Propagates the underlying I/O failure.
    fn stat(&self, path: &str) -> io::Result<FileStat>;
}

/// Real filesystem implementation.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdFileSystem;

impl FileSystem for StdFileSystem {
    fn read(&self, path: &str) -> io::Result<String> {
        std::fs::read_to_string(path)
    }

    fn write(&self, path: &str, content: &str) -> io::Result<()> {
        std::fs::write(path, content)
    }

    fn stat(&self, path: &str) -> io::Result<FileStat> {
        match std::fs::metadata(path) {
            Ok(meta) => Ok(FileStat {
                exists: true,
                size: meta.len(),
            }),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(FileStat {
                exists: false,
                size: 0,
            }),
            Err(err) => Err(err),
        }
    }
}

/// In-memory filesystem for tests.
#[derive(Debug, Default)]
pub struct MemoryFileSystem {
    files: Mutex<HashMap<String, String>>,
}

impl MemoryFileSystem {
    /// Create an empty filesystem.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a filesystem seeded with files.
    #[must_use]
    pub fn with_files<I, P, C>(files: I) -> Self
    where
        I: IntoIterator<Item = (P, C)>,
        P: Into<String>,
        C: Into<String>,
    {
        let fs = Self::new();
        {
            let mut map = fs.lock();
            for (path, content) in files {
                map.insert(path.into(), content.into());
            }
        }
        fs
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.files.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl FileSystem for MemoryFileSystem {
    fn read(&self, path: &str) -> io::Result<String> {
        self.lock()
            .get(path)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no such file: {path}")))
    }

    fn write(&self, path: &str, content: &str) -> io::Result<()> {
        self.lock().insert(path.to_string(), content.to_string());
        Ok(())
    }

    fn stat(&self, path: &str) -> io::Result<FileStat> {
        Ok(self.lock().get(path).map_or(
            FileStat {
                exists: false,
                size: 0,
            },
            |content| FileStat {
                exists: true,
                size: content.len() as u64,
            },
        ))
    }
}

/// Arguments for the edit gadget.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct EditFileArgs {
    /// Path of the file to edit.
    pub path: String,
    /// The snippet to locate. Empty creates/overwrites the file with
    /// `replace`.
    pub search: String,
    /// The replacement text. Empty deletes the matched region.
    pub replace: String,
}

/// The edit-file gadget.
pub struct EditFile {
    fs: Arc<dyn FileSystem>,
    config: MatcherConfig,
}

impl std::fmt::Debug for EditFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EditFile").finish_non_exhaustive()
    }
}

impl EditFile {
    /// Create the gadget over a filesystem.
    #[must_use]
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self {
            fs,
            config: MatcherConfig::default(),
        }
    }

    /// Override the matcher configuration.
    #[must_use]
    pub fn with_config(mut self, config: MatcherConfig) -> Self {
        self.config = config;
        self
    }
}

impl Gadget for EditFile {
    const NAME: &'static str = "EditFile";
    type Args = EditFileArgs;
    type Error = GadgetError;

    fn description(&self) -> String {
        "Replace a snippet in a file, tolerant of whitespace and indentation drift".into()
    }

    async fn invoke(
        &self,
        args: EditFileArgs,
        _ctx: &GadgetContext,
    ) -> Result<GadgetOutput, GadgetError> {
        // Empty search means create/overwrite.
        if args.search.is_empty() {
            self.fs
                .write(&args.path, &args.replace)
                .map_err(|err| GadgetError::Execution(format!("write failed: {err}")))?;
            return Ok(GadgetOutput::text(format!("Wrote {}.", args.path)));
        }

        let stat = self
            .fs
            .stat(&args.path)
            .map_err(|err| GadgetError::Execution(format!("stat failed: {err}")))?;
        if !stat.exists {
            return Err(GadgetError::Execution(format!(
                "file not found: {}",
                args.path
            )));
        }

        let content = self
            .fs
            .read(&args.path)
            .map_err(|err| GadgetError::Execution(format!("read failed: {err}")))?;

        let Some(found) = matcher::find_match(&content, &args.search, &self.config) else {
            let failure = matcher::get_match_failure(&content, &args.search, &self.config);
            let mut message = format!("search snippet not found in {}", args.path);
            if failure.suggestions.is_empty() {
                message.push_str("; no similar region found");
            } else {
                message.push_str("; closest candidates:\n");
                for suggestion in &failure.suggestions {
                    message.push_str(&format!(
                        "- line {} (similarity {:.2})\n",
                        suggestion.line_number, suggestion.similarity
                    ));
                }
                if let Some(context) = &failure.context {
                    message.push_str("context around best candidate:\n");
                    message.push_str(context);
                }
            }
            return Err(GadgetError::Execution(message));
        };

        debug!(path = %args.path, strategy = ?found.strategy, confidence = found.confidence,
               "edit match located");

        let updated = matcher::apply_replacement(&content, &found, &args.replace);
        self.fs
            .write(&args.path, &updated)
            .map_err(|err| GadgetError::Execution(format!("write failed: {err}")))?;

        Ok(GadgetOutput::text(format!(
            "Edited {} (lines {}-{}, {:?} match, confidence {:.2}).",
            args.path, found.start_line, found.end_line, found.strategy, found.confidence
        )))
    }
}
