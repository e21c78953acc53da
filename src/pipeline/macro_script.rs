use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::pipeline::execution::{BatchDirs, MacroJob, OUTPUT_LOG_FILE_NAME};

pub const USER_MACRO_PLACEHOLDER: &str = "{user_macro}";

/// Used when no template path is configured: open the input, run the user
/// macro, save whatever is left open into `Images`, and log every save.
pub const DEFAULT_MACRO_TEMPLATE: &str = r#"setBatchMode(true);
open(inputPath);
mainImageId = getImageID();
{user_macro}
if (nImages > 0) {
    selectImage(mainImageId);
    savedPath = imagesDir + originalFileName + "_processed.tif";
    saveAs("Tiff", savedPath);
    print("OUTPUT_FILE: " + savedPath);
}
run("Close All");
setBatchMode(false);
"#;

pub const DEFAULT_CONVERSION_TEMPLATE: &str = r#"setBatchMode(true);
open("{input_path}");
metadataPath = "{output_dir}/{filename}_metadata.txt";
File.saveString(getImageInfo(), metadataPath);
previewPath = "{output_dir}/{filename}_preview.png";
saveAs("PNG", previewPath);
File.saveString("METADATA_PATH: " + metadataPath + "\nPREVIEW_PATH: " + previewPath + "\n", "{output_log_path}");
run("Close All");
setBatchMode(false);
"#;

#[derive(Debug, Error)]
pub enum MacroTemplateError {
    #[error("failed to read macro template '{path}': {message}")]
    Read { path: String, message: String },
    #[error("macro template '{path}' has no {placeholder} placeholder")]
    MissingPlaceholder { path: String, placeholder: &'static str },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacroTemplate {
    body: String,
}

impl Default for MacroTemplate {
    fn default() -> Self {
        Self {
            body: String::from(DEFAULT_MACRO_TEMPLATE),
        }
    }
}

impl MacroTemplate {
    pub fn load(path: &Path) -> Result<Self, MacroTemplateError> {
        let body = read_template(path)?;
        if !body.contains(USER_MACRO_PLACEHOLDER) {
            return Err(MacroTemplateError::MissingPlaceholder {
                path: path.display().to_string(),
                placeholder: USER_MACRO_PLACEHOLDER,
            });
        }
        Ok(Self { body })
    }

    pub fn from_body(body: impl Into<String>) -> Self {
        Self { body: body.into() }
    }

    /// Prepends the job-scoped variable bindings and substitutes the user
    /// script into the placeholder. An empty user script leaves whatever the
    /// template does by default.
    pub fn render(&self, job: &MacroJob, dirs: &BatchDirs, user_macro: &str) -> String {
        let mut out = render_bindings(job, dirs);
        out.push('\n');
        out.push_str(self.body.replace(USER_MACRO_PLACEHOLDER, user_macro).as_str());
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionTemplate {
    body: String,
}

impl Default for ConversionTemplate {
    fn default() -> Self {
        Self {
            body: String::from(DEFAULT_CONVERSION_TEMPLATE),
        }
    }
}

impl ConversionTemplate {
    pub fn load(path: &Path) -> Result<Self, MacroTemplateError> {
        Ok(Self {
            body: read_template(path)?,
        })
    }

    pub fn render(
        &self,
        input_path: &Path,
        output_dir: &Path,
        file_stem: &str,
        output_log_path: &Path,
    ) -> String {
        self.body
            .replace("{input_path}", macro_path(input_path).as_str())
            .replace("{output_dir}", macro_path(output_dir).as_str())
            .replace("{filename}", file_stem)
            .replace("{output_log_path}", macro_path(output_log_path).as_str())
    }
}

fn read_template(path: &Path) -> Result<String, MacroTemplateError> {
    fs::read_to_string(path).map_err(|error| MacroTemplateError::Read {
        path: path.display().to_string(),
        message: error.to_string(),
    })
}

fn render_bindings(job: &MacroJob, dirs: &BatchDirs) -> String {
    let params = &job.params;
    let max_size = params
        .max_size
        .map(|v| v.to_string())
        .unwrap_or_else(|| String::from("Infinity"));

    let mut lines = vec![
        string_binding("inputPath", macro_path(job.input_path.as_path()).as_str()),
        string_binding("outputDir", dir_with_separator(dirs.root.as_path()).as_str()),
        string_binding("originalFileName", job.stem.as_str()),
        string_binding(
            "outputLogPath",
            macro_path(dirs.root.join(OUTPUT_LOG_FILE_NAME).as_path()).as_str(),
        ),
        format!("var minSize = {};", params.min_size),
        string_binding("maxSize", max_size.as_str()),
        format!("var minCircularity = {:.2};", params.min_circularity),
        format!("var maxCircularity = {:.2};", params.max_circularity),
    ];
    for category in &dirs.categories {
        let var_name = format!("{}Dir", lower_first(category.name.as_str()));
        lines.push(string_binding(
            var_name.as_str(),
            dir_with_separator(category.path.as_path()).as_str(),
        ));
    }
    lines.join("\n")
}

fn string_binding(name: &str, value: &str) -> String {
    format!("var {name} = \"{}\";", escape_macro_string(value))
}

fn escape_macro_string(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// ImageJ accepts forward slashes on every platform.
fn macro_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn dir_with_separator(path: &Path) -> String {
    let mut value = macro_path(path);
    if !value.ends_with('/') {
        value.push('/');
    }
    value
}

fn lower_first(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}
