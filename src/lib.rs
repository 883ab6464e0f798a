pub mod checksum;
pub mod cli;
pub mod download;
pub mod error;
pub mod progress;
pub mod scheduler;
pub mod source;
pub mod task;
pub mod transfer;
pub mod util;
