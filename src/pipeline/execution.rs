use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;
use uuid::Uuid;

use crate::pipeline::MacroParams;

pub const INPUTS_DIR: &str = "inputs";
pub const ARCHIVE_FILE_NAME: &str = "results.zip";
pub const OUTPUT_LOG_FILE_NAME: &str = "output_log.txt";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchCategoryDir {
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchDirs {
    pub root: PathBuf,
    pub inputs: PathBuf,
    pub categories: Vec<BatchCategoryDir>,
    pub archive: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MacroJob {
    pub original_name: String,
    pub file_name: String,
    pub stem: String,
    pub input_path: PathBuf,
    pub params: MacroParams,
}

pub fn batch_dirs(work_root: &Path, categories: &[String]) -> BatchDirs {
    let id = Uuid::new_v4().simple().to_string();
    let root = work_root.join(format!(
        "batch_{}_{}",
        Utc::now().format("%Y%m%dT%H%M%S"),
        &id[..8]
    ));
    batch_dirs_at(root, categories)
}

pub fn batch_dirs_at(root: PathBuf, categories: &[String]) -> BatchDirs {
    let categories = categories
        .iter()
        .map(|name| sanitize_file_name(name.as_str()))
        .filter(|name| !name.is_empty())
        .map(|name| BatchCategoryDir {
            path: root.join(name.as_str()),
            name,
        })
        .collect();
    BatchDirs {
        inputs: root.join(INPUTS_DIR),
        archive: root.join(ARCHIVE_FILE_NAME),
        categories,
        root,
    }
}

pub fn ensure_batch_dirs(dirs: &BatchDirs) -> io::Result<()> {
    fs::create_dir_all(dirs.inputs.as_path())?;
    for category in &dirs.categories {
        fs::create_dir_all(category.path.as_path())?;
    }
    Ok(())
}

/// Hands out working paths for one batch; a second upload that sanitizes to an
/// already-claimed name gets a numeric suffix instead of overwriting it.
#[derive(Debug, Default)]
pub struct JobNamer {
    claimed: HashSet<String>,
}

impl JobNamer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign(&mut self, dirs: &BatchDirs, original_name: &str, params: &MacroParams) -> MacroJob {
        let sanitized = sanitize_file_name(original_name);
        let sanitized = if sanitized.is_empty() {
            String::from("upload")
        } else {
            sanitized
        };
        let (base_stem, extension) = split_extension(sanitized.as_str());

        let mut stem = base_stem.to_string();
        let mut counter = 1u32;
        while self.claimed.contains(&stem.to_ascii_lowercase()) {
            counter += 1;
            stem = format!("{base_stem}_{counter}");
        }
        self.claimed.insert(stem.to_ascii_lowercase());

        let file_name = match extension {
            Some(ext) => format!("{stem}.{ext}"),
            None => stem.clone(),
        };
        MacroJob {
            original_name: original_name.to_string(),
            input_path: dirs.inputs.join(file_name.as_str()),
            file_name,
            stem,
            params: params.clone(),
        }
    }
}

/// Keeps ASCII letters, digits, `-`, `_` and `.`; path separators and any other
/// character collapse into a single `_`. Leading dots are dropped so uploads
/// cannot become hidden files.
pub fn sanitize_file_name(value: &str) -> String {
    let base = value.rsplit(['/', '\\']).next().unwrap_or(value);
    let mut out = String::with_capacity(base.len());
    let mut last_was_sep = false;
    for ch in base.chars() {
        let keep = ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.';
        if keep {
            out.push(ch);
            last_was_sep = false;
            continue;
        }
        if !last_was_sep {
            out.push('_');
            last_was_sep = true;
        }
    }
    let trimmed = out.trim_start_matches(['.', '_']).trim_end_matches('_');
    trimmed.to_string()
}

fn split_extension(file_name: &str) -> (&str, Option<&str>) {
    match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => (stem, Some(ext)),
        _ => (file_name, None),
    }
}
