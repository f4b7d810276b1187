//! Relays image attachments posted to a Discord channel to an SFTP server.
//!
//! Every poll fetches the channel's latest message, uploads its first image
//! under a templated name, and records the message id so it is never sent
//! twice.

pub mod config;
pub mod cursor;
pub mod error;
pub mod feed;
pub mod filter;
pub mod poller;
pub mod template;
pub mod transfer;

pub use error::{RelayError, Result};
