//! `mailcatch`: a disposable-mail capture server.
//!
//! Mail arrives over SMTP, is stored per recipient mailbox on local disk,
//! and can be read back over POP3 or from the command line.

pub mod config;
pub mod error;
pub mod index;
pub mod model;
pub mod parser;
pub mod pop3;
pub mod retention;
pub mod server;
pub mod smtp;
pub mod store;
