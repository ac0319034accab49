//! Header summaries and on-demand body decoding for stored messages.

pub mod header;
pub mod mime;
