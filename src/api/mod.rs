pub mod chat;
pub mod error;
pub mod handler_utils;
pub mod macros;
pub mod server;
pub mod stream;
