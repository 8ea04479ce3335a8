pub mod config;
pub mod context;
pub mod endpoint;
pub mod error;
pub mod meta;
pub mod repeater;
pub mod retry;
