//! Core data model types for stored messages and addresses.

pub mod address;
pub mod message;
