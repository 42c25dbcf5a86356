//! bulletin-board: a bulletin board posting service over raw TCP.
//!
//! A client sends one post per connection, half-closes, and receives a
//! status line followed by named, length-prefixed files:
//! - the server validates the post and appends it to the board's content file
//! - each connection is served by its own worker task
//! - fault modes bend the response to exercise client robustness

pub mod assets;
pub mod client;
pub mod config;
pub mod fault;
pub mod protocol;
pub mod render;
pub mod server;
pub mod store;
pub mod worker;

pub use client::{ClientError, Reply};
pub use config::{Config, ConfigError};
pub use fault::FaultMode;
pub use protocol::{Post, Status};
pub use server::{Server, ServerError};
pub use store::ContentStore;
