//! Beacon scheduling server.
//!
//! Queued messages are transmitted over a long-lived link to the beacon
//! hardware at their scheduled time. Reference stations hold their own links
//! and are queried through a small internal dispatcher.
pub mod codec;
pub mod config;
pub mod dispatch;
pub mod link;
pub mod message;
pub mod scheduler;
pub mod store;
pub mod transport;
pub mod window;
