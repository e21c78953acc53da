use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::pipeline::execution::{ARCHIVE_FILE_NAME, OUTPUT_LOG_FILE_NAME};

pub const OUTPUT_FILE_MARKER: &str = "OUTPUT_FILE:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputProvenance {
    /// Named by an `OUTPUT_FILE:` log line.
    Declared,
    /// Found by the stem-prefix directory scan.
    Discovered,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFile {
    pub path: PathBuf,
    pub size: u64,
    pub provenance: OutputProvenance,
}

/// Output files keyed by canonical path, so the same file reached through the
/// log and through the directory scan is held once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectedOutputs {
    files: BTreeMap<PathBuf, OutputFile>,
}

impl CollectedOutputs {
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn files(&self) -> impl Iterator<Item = &OutputFile> {
        self.files.values()
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.files.keys().cloned().collect()
    }

    pub fn contains(&self, path: &Path) -> bool {
        fs::canonicalize(path)
            .map(|canonical| self.files.contains_key(&canonical))
            .unwrap_or(false)
    }

    /// Validates `path` right now and inserts it when it is a non-empty file.
    /// First insertion wins, so a declared file keeps its provenance.
    pub fn offer(&mut self, path: &Path, provenance: OutputProvenance) -> bool {
        let metadata = match fs::metadata(path) {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => {
                warn!(path = %path.display(), "output candidate is not a file");
                return false;
            }
            Err(_) => {
                warn!(path = %path.display(), "output candidate does not exist");
                return false;
            }
        };
        if metadata.len() == 0 {
            warn!(path = %path.display(), "output candidate is empty");
            return false;
        }
        let canonical = match fs::canonicalize(path) {
            Ok(canonical) => canonical,
            Err(error) => {
                warn!(path = %path.display(), error = %error, "output candidate could not be canonicalized");
                return false;
            }
        };
        if self.files.contains_key(&canonical) {
            return false;
        }
        self.files.insert(
            canonical.clone(),
            OutputFile {
                path: canonical,
                size: metadata.len(),
                provenance,
            },
        );
        true
    }

    pub fn extend(&mut self, other: CollectedOutputs) {
        for (key, file) in other.files {
            self.files.entry(key).or_insert(file);
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct OutputCollector {
    excluded_dirs: Vec<PathBuf>,
}

impl OutputCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directories the stem scan must not descend into (uploaded originals).
    pub fn excluding(mut self, dir: impl Into<PathBuf>) -> Self {
        self.excluded_dirs.push(dir.into());
        self
    }

    pub fn collect(&self, log_text: &str, working_dir: &Path, stem: &str) -> CollectedOutputs {
        let mut outputs = CollectedOutputs::default();

        let mut declared = parse_declared_output_paths(log_text, working_dir);
        let log_file = working_dir.join(OUTPUT_LOG_FILE_NAME);
        if let Ok(file_log) = fs::read_to_string(log_file.as_path()) {
            declared.extend(parse_declared_output_paths(file_log.as_str(), working_dir));
        }
        for path in declared {
            if outputs.offer(path.as_path(), OutputProvenance::Declared) {
                info!(path = %path.display(), "declared output accepted");
            }
        }

        match self.scan_stem_matches(working_dir, stem) {
            Ok(found) => {
                for path in found {
                    if outputs.offer(path.as_path(), OutputProvenance::Discovered) {
                        debug!(path = %path.display(), "scanned output accepted");
                    }
                }
            }
            Err(error) => {
                warn!(dir = %working_dir.display(), error = %error, "output directory scan failed");
            }
        }

        if outputs.is_empty() {
            warn!(stem, "no valid output files found");
        }
        outputs
    }

    fn scan_stem_matches(&self, root: &Path, stem: &str) -> Result<Vec<PathBuf>, std::io::Error> {
        let mut out = Vec::new();
        if stem.is_empty() {
            return Ok(out);
        }
        // Batch bookkeeping files are never outputs, whatever the stem.
        let bookkeeping = [root.join(OUTPUT_LOG_FILE_NAME), root.join(ARCHIVE_FILE_NAME)];
        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            for entry in fs::read_dir(dir.as_path())? {
                let path = entry?.path();
                if path.is_dir() {
                    if !self.excluded_dirs.iter().any(|excluded| excluded == &path) {
                        stack.push(path);
                    }
                    continue;
                }
                if bookkeeping.contains(&path) {
                    continue;
                }
                let matches = path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .map(|name| name.starts_with(stem))
                    .unwrap_or(false);
                if matches {
                    out.push(path);
                }
            }
        }
        out.sort();
        Ok(out)
    }
}

pub(crate) fn parse_declared_output_paths(log_text: &str, working_dir: &Path) -> Vec<PathBuf> {
    log_text
        .lines()
        .map(str::trim)
        .filter_map(|line| line.strip_prefix(OUTPUT_FILE_MARKER))
        .map(normalize_separators)
        .filter(|value| !value.is_empty())
        .map(|value| {
            let path = PathBuf::from(value);
            if path.is_absolute() {
                path
            } else {
                working_dir.join(path)
            }
        })
        .collect()
}

fn normalize_separators(value: &str) -> String {
    let mut normalized = value.trim().replace('\\', "/");
    while normalized.contains("//") {
        normalized = normalized.replace("//", "/");
    }
    normalized
}
