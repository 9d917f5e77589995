pub mod checksum;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod domain;
pub mod error;
pub mod glob;
pub mod metadata;
pub mod multipart;
pub mod output;
pub mod progress;
pub mod registrar;
pub mod report;
pub mod retry;
pub mod scanner;
pub mod sink;
pub mod storage;
