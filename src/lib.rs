//! Clusterbus - cluster messaging over a shared pub/sub transport
//!
//! Lets independent server processes exchange topic-addressed messages,
//! broadcast or directed at one server, with self-origin filtering so a
//! server never reacts to its own broadcasts.

pub mod cluster;
pub mod config;
pub mod transport;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_utils;
