pub mod archive;
pub mod execution;
pub mod macro_script;
pub mod output_collect;
pub mod preview;
pub mod readiness;
pub mod runtime;

use serde::Deserialize;

/// Particle-analysis bounds bound into every rendered macro.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MacroParams {
    pub min_size: f64,
    /// `None` renders as `"Infinity"`.
    pub max_size: Option<f64>,
    pub min_circularity: f64,
    pub max_circularity: f64,
}

impl Default for MacroParams {
    fn default() -> Self {
        Self {
            min_size: 10.0,
            max_size: None,
            min_circularity: 0.0,
            max_circularity: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

impl UploadedFile {
    pub fn new(file_name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            file_name: file_name.into(),
            bytes: bytes.into(),
        }
    }
}
