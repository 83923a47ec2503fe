#![warn(missing_docs)]

//! jailftpd: a chrooted FTP server
//!
//! Each control connection is served by its own worker task. Workers share
//! nothing mutable with the master; everything the master knows about them
//! arrives as framed messages on the State-Sync pipe.

pub mod auth;
pub mod command;
pub mod config;
pub mod daemon;
pub mod error;
pub mod listing;
pub mod reply;
pub mod roster;
pub mod session;
pub mod signals;
pub mod sync;
pub mod throttle;
pub mod transfer;
pub mod vfs;
pub mod worker;

pub use config::FtpConfig;
pub use daemon::Server;
pub use error::{FtpError, Result};
