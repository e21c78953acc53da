use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub mod anthropic;
pub mod error;

pub use anthropic::AnthropicBackend;
pub use error::LlmError;

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub system: String,
    pub user: String,
    pub max_tokens: u32,
    pub temperature: f64,
}

/// A streaming completion source. Implementations push text deltas into
/// `delta_tx` in arrival order and return once the upstream stream ends.
/// A closed receiver means the consumer went away; implementations stop
/// reading and return `Ok(())`.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn stream(
        &self,
        request: CompletionRequest,
        delta_tx: mpsc::Sender<String>,
    ) -> Result<(), LlmError>;
}

pub type SharedCompletionBackend = Arc<dyn CompletionBackend>;
