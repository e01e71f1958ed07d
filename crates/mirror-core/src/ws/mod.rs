//! Streaming connection with reconnect backoff and account failover.

pub mod client;
pub mod failover;

pub use client::{Backoff, Inbound, OnMessageCallback, StreamConnector, StreamSession, WsConnector, WsSession};
pub use failover::{ConnectionState, FailoverFeed, FailoverRecord, FeedHandle, FeedHealth, FeedStats};
