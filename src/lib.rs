pub mod audio_sink;
pub mod buffer_queue;
pub mod client;
pub mod commands;
pub mod config;
pub mod connection;
pub mod console;
pub mod error;
pub mod protocol;
pub mod recorder;
pub mod tuner;

pub use error::{Result, SdrError};
