pub mod compose;
pub mod config;
pub mod docker;
pub mod engine;
pub mod error;
pub mod kubestuff;
pub mod spec;
