//! Boundary to the external ImageJ engine.
//!
//! The engine is a process-wide, non-reentrant resource. It is started once,
//! owned by an [`EngineHandle`], and every macro invocation goes through the
//! handle's lock so two scripts never run against it at the same time.

pub mod command;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tracing::{error, info, warn};

pub use command::CommandMacroEngine;

pub trait MacroEngine: Send + 'static {
    fn start(&mut self) -> Result<(), EngineError>;

    /// Runs a complete macro script synchronously and returns whatever text the
    /// engine hands back, which may be empty.
    fn run_macro(&mut self, script: &str) -> Result<String, EngineError>;

    /// Engine-side log accessor used when a run returns no text.
    fn log(&mut self) -> String;

    fn dispose(&mut self);
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine is not running")]
    NotRunning,
    #[error("engine command failed to launch: {0}")]
    Io(#[from] std::io::Error),
    #[error("engine command failed ({program}) with exit code {status_code}: {stderr}")]
    CommandFailed {
        program: String,
        status_code: i32,
        stderr: String,
    },
    #[error("macro execution failed: {0}")]
    Macro(String),
    #[error("failed to start engine after {attempts} attempts: {last_error}")]
    StartFailed { attempts: u32, last_error: String },
}

pub struct EngineHandle {
    engine: Mutex<Option<Box<dyn MacroEngine>>>,
}

pub type SharedEngineHandle = Arc<EngineHandle>;

impl EngineHandle {
    /// Wraps an engine that is already running.
    pub fn new(engine: Box<dyn MacroEngine>) -> Self {
        Self {
            engine: Mutex::new(Some(engine)),
        }
    }

    pub fn start_with_retries(
        mut engine: Box<dyn MacroEngine>,
        attempts: u32,
        delay: Duration,
    ) -> Result<Self, EngineError> {
        let attempts = attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            info!(attempt, attempts, "starting macro engine");
            match engine.start() {
                Ok(()) => {
                    info!(attempt, "macro engine started");
                    return Ok(Self::new(engine));
                }
                Err(start_error) => {
                    error!(attempt, attempts, error = %start_error, "macro engine failed to start");
                    engine.dispose();
                    last_error = start_error.to_string();
                    if attempt < attempts {
                        std::thread::sleep(delay);
                    }
                }
            }
        }
        Err(EngineError::StartFailed {
            attempts,
            last_error,
        })
    }

    /// Runs one script under the engine lock. Falls back to the engine log when
    /// the run itself returns only whitespace.
    pub fn invoke(&self, script: &str) -> Result<String, EngineError> {
        let mut guard = self.lock();
        let engine = guard.as_mut().ok_or(EngineError::NotRunning)?;
        let output = engine.run_macro(script)?;
        if !output.trim().is_empty() {
            return Ok(output);
        }
        Ok(engine.log())
    }

    pub fn is_running(&self) -> bool {
        self.lock().is_some()
    }

    /// Disposes the engine. Safe to call more than once; only the first call
    /// reaches the engine.
    pub fn shutdown(&self) {
        let taken = self.lock().take();
        if let Some(mut engine) = taken {
            engine.dispose();
            info!("macro engine disposed");
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Box<dyn MacroEngine>>> {
        self.engine.lock().unwrap_or_else(|poisoned| {
            warn!("engine lock poisoned by a panicking invocation; continuing");
            poisoned.into_inner()
        })
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
