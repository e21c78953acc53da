pub mod prompts;
pub mod section_parser;

use crate::config::LlmConfig;
use crate::llm::CompletionRequest;

pub use section_parser::{clean_section_content, Section, SectionParser, StreamEvent};

pub fn macro_generation_request(task: &str, config: &LlmConfig) -> CompletionRequest {
    CompletionRequest {
        system: String::from(prompts::MACRO_GENERATION_SYSTEM),
        user: prompts::macro_generation_user_prompt(task),
        max_tokens: config.max_tokens,
        temperature: config.temperature,
    }
}

pub fn prompt_improvement_request(user_input: &str, config: &LlmConfig) -> CompletionRequest {
    CompletionRequest {
        system: String::from(prompts::PROMPT_IMPROVEMENT_SYSTEM),
        user: prompts::prompt_improvement_user_prompt(user_input),
        max_tokens: config.max_tokens,
        temperature: config.temperature,
    }
}
