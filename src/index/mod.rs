//! Mailbox index format and persistence.

pub mod format;
pub mod persist;
