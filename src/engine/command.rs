use std::fs;
use std::path::PathBuf;
use std::process::Command;

use tracing::debug;
use uuid::Uuid;

use super::{EngineError, MacroEngine};
use crate::config::EngineConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub status_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Drives a headless Fiji/ImageJ binary: each script is written to a scratch
/// `.ijm` file and passed as the final argument.
#[derive(Debug)]
pub struct CommandMacroEngine {
    program: String,
    args: Vec<String>,
    probe_args: Vec<String>,
    scratch_dir: PathBuf,
    last_log: String,
}

impl CommandMacroEngine {
    pub fn new(config: &EngineConfig, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            probe_args: config.probe_args.clone(),
            scratch_dir: scratch_dir.into(),
            last_log: String::new(),
        }
    }

    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, EngineError> {
        let output = Command::new(spec.program.as_str())
            .args(spec.args.iter().map(String::as_str))
            .output()?;

        Ok(CommandOutput {
            status_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(output.stdout.as_slice()).to_string(),
            stderr: String::from_utf8_lossy(output.stderr.as_slice()).to_string(),
        })
    }
}

impl MacroEngine for CommandMacroEngine {
    fn start(&mut self) -> Result<(), EngineError> {
        fs::create_dir_all(self.scratch_dir.as_path())?;
        if self.probe_args.is_empty() {
            return Ok(());
        }
        let output = self.run(&CommandSpec {
            program: self.program.clone(),
            args: self.probe_args.clone(),
        })?;
        if output.status_code != 0 {
            return Err(EngineError::CommandFailed {
                program: self.program.clone(),
                status_code: output.status_code,
                stderr: output.stderr,
            });
        }
        debug!(version = %output.stdout.trim(), "engine probe succeeded");
        Ok(())
    }

    fn run_macro(&mut self, script: &str) -> Result<String, EngineError> {
        let script_path = self
            .scratch_dir
            .join(format!("macro_{}.ijm", Uuid::new_v4().simple()));
        fs::write(script_path.as_path(), script)?;

        let mut args = self.args.clone();
        args.push(script_path.to_string_lossy().to_string());
        let result = self.run(&CommandSpec {
            program: self.program.clone(),
            args,
        });
        if let Err(remove_error) = fs::remove_file(script_path.as_path()) {
            debug!(path = %script_path.display(), error = %remove_error, "scratch script not removed");
        }
        let output = result?;

        self.last_log = output.stderr.clone();
        if output.status_code != 0 {
            return Err(EngineError::CommandFailed {
                program: self.program.clone(),
                status_code: output.status_code,
                stderr: output.stderr,
            });
        }
        Ok(output.stdout)
    }

    fn log(&mut self) -> String {
        std::mem::take(&mut self.last_log)
    }

    fn dispose(&mut self) {
        if let Err(remove_error) = fs::remove_dir_all(self.scratch_dir.as_path()) {
            debug!(dir = %self.scratch_dir.display(), error = %remove_error, "scratch dir not removed");
        }
    }
}
