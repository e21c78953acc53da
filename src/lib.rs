pub mod api;
pub mod config;
pub mod engine;
pub mod generation;
pub mod llm;
pub mod pipeline;
pub mod worker;
