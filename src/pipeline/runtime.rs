use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::engine::{EngineError, SharedEngineHandle};
use crate::pipeline::archive::{build_archive, Archive, ArchiveError};
use crate::pipeline::execution::{batch_dirs, ensure_batch_dirs, BatchDirs, JobNamer, MacroJob};
use crate::pipeline::macro_script::MacroTemplate;
use crate::pipeline::output_collect::{CollectedOutputs, OutputCollector, OutputFile};
use crate::pipeline::{MacroParams, UploadedFile};
use crate::worker::cleanup::CleanupScheduler;

#[derive(Debug, Clone, PartialEq)]
pub struct MacroBatchRequest {
    pub files: Vec<UploadedFile>,
    pub script: String,
    pub params: MacroParams,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRecord {
    pub file_name: String,
    pub log: String,
    pub outputs: Vec<OutputFile>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacroBatchResult {
    pub archive: Archive,
    pub error_log: Vec<String>,
    pub records: Vec<ExecutionRecord>,
}

#[derive(Debug, Error)]
pub enum MacroRuntimeError {
    #[error("No files uploaded")]
    NoInputFiles,
    #[error("failed to prepare batch directory: {0}")]
    Workspace(std::io::Error),
    #[error("No output files were generated.")]
    NoOutputs { error_log: Vec<String> },
    #[error("Failed to create zip file: {source}")]
    Archive {
        source: ArchiveError,
        error_log: Vec<String>,
    },
}

#[derive(Debug, Error)]
enum JobError {
    #[error("failed to save upload: {0}")]
    Persist(std::io::Error),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

pub trait MacroOrchestrator: Send + Sync + 'static {
    fn execute(&self, request: MacroBatchRequest) -> Result<MacroBatchResult, MacroRuntimeError>;
}

pub type SharedMacroOrchestrator = Arc<dyn MacroOrchestrator>;

/// Runs each uploaded file through the engine one after another, isolates
/// per-file failures, and packages the union of outputs into one archive.
pub struct EngineMacroOrchestrator {
    engine: SharedEngineHandle,
    template: MacroTemplate,
    work_root: PathBuf,
    output_categories: Vec<String>,
    cleanup: CleanupScheduler,
}

impl EngineMacroOrchestrator {
    pub fn new(
        engine: SharedEngineHandle,
        template: MacroTemplate,
        work_root: impl Into<PathBuf>,
        output_categories: Vec<String>,
        cleanup: CleanupScheduler,
    ) -> Self {
        Self {
            engine,
            template,
            work_root: work_root.into(),
            output_categories,
            cleanup,
        }
    }

    fn run_job(
        &self,
        job: &MacroJob,
        dirs: &BatchDirs,
        bytes: &[u8],
        script: &str,
    ) -> Result<(String, CollectedOutputs), JobError> {
        fs::write(job.input_path.as_path(), bytes).map_err(JobError::Persist)?;
        info!(input = %job.input_path.display(), "processing image");

        let full_macro = self.template.render(job, dirs, script);
        debug!(script = %full_macro, "rendered macro");
        let log = self.engine.invoke(full_macro.as_str())?;
        debug!(output = %log, "macro output");

        let collector = OutputCollector::new().excluding(dirs.inputs.clone());
        let outputs = collector.collect(log.as_str(), dirs.root.as_path(), job.stem.as_str());
        Ok((log, outputs))
    }

    fn schedule_cleanup(&self, root: &Path) {
        if self.cleanup.schedule(root.to_path_buf()).is_ok() {
            debug!(dir = %root.display(), "batch cleanup scheduled");
        }
    }
}

impl MacroOrchestrator for EngineMacroOrchestrator {
    fn execute(&self, request: MacroBatchRequest) -> Result<MacroBatchResult, MacroRuntimeError> {
        let MacroBatchRequest {
            files,
            script,
            params,
        } = request;
        if files.is_empty() {
            return Err(MacroRuntimeError::NoInputFiles);
        }
        info!(files = files.len(), "starting macro execution");

        let dirs = batch_dirs(self.work_root.as_path(), &self.output_categories);
        if let Err(io_error) = ensure_batch_dirs(&dirs) {
            self.schedule_cleanup(dirs.root.as_path());
            return Err(MacroRuntimeError::Workspace(io_error));
        }

        let mut namer = JobNamer::new();
        let mut records = Vec::with_capacity(files.len());
        let mut error_log = Vec::new();
        let mut all_outputs = CollectedOutputs::default();

        for upload in &files {
            let job = namer.assign(&dirs, upload.file_name.as_str(), &params);
            match self.run_job(&job, &dirs, upload.bytes.as_slice(), script.as_str()) {
                Ok((log, outputs)) => {
                    info!(file = %job.file_name, outputs = outputs.len(), "saved files collected");
                    records.push(ExecutionRecord {
                        file_name: job.file_name.clone(),
                        log,
                        outputs: outputs.files().cloned().collect(),
                        error: None,
                    });
                    all_outputs.extend(outputs);
                }
                Err(job_error) => {
                    let message = format!("Error processing {}: {job_error}", job.file_name);
                    error!(file = %job.file_name, error = %job_error, "macro job failed");
                    error_log.push(message.clone());
                    records.push(ExecutionRecord {
                        file_name: job.file_name.clone(),
                        log: String::new(),
                        outputs: Vec::new(),
                        error: Some(message),
                    });
                }
            }
        }

        if all_outputs.is_empty() {
            error!("no output files were generated");
            self.schedule_cleanup(dirs.root.as_path());
            return Err(MacroRuntimeError::NoOutputs { error_log });
        }

        info!(files = all_outputs.len(), "creating archive");
        let archive = build_archive(&all_outputs.paths(), dirs.archive.as_path());
        self.schedule_cleanup(dirs.root.as_path());
        match archive {
            Ok(archive) => {
                if !error_log.is_empty() {
                    warn!(failed = error_log.len(), "batch finished with per-file errors");
                }
                Ok(MacroBatchResult {
                    archive,
                    error_log,
                    records,
                })
            }
            Err(source) => Err(MacroRuntimeError::Archive { source, error_log }),
        }
    }
}
