pub mod backend;
pub mod buffer;
pub mod config;
pub mod delay;
pub mod dir_upload;
pub mod env;
pub mod error;
pub mod logfile;
pub mod manager;
pub mod noop_upload;
pub mod record;
pub mod recoup;
pub mod server;
pub mod service;
pub mod shutdown;
pub mod upload;

#[cfg(feature = "http-upload")]
pub mod http_upload;

pub mod init;
