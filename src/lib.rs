pub mod auth;
pub mod channel;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod http;
pub mod presence;
pub mod protocol;
pub mod rest;
pub mod transport;
pub mod util;
pub mod test_util;

pub use crate::client::Realtime;
pub use crate::config::ClientOptions;
pub use crate::error::{Error, ErrorInfo, Result};
