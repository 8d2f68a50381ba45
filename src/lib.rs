#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod traits;
pub mod transport;

pub use config::{Config, ReconnectConfig};
pub use connection::{Client, ConnectionState};
pub use error::Error;
pub use traits::MessageHandler;
pub use transport::NORMAL_CLOSURE;

pub type Result<T> = std::result::Result<T, Error>;
