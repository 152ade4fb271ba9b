//! OpenVPN module root – re-exports public API surface.

pub mod types;
pub mod protocol;
pub mod auth;
pub mod middleware;
pub mod management;
pub mod config;
pub mod process;
pub mod client;
pub mod state;
pub mod password;
pub mod server_auth;

pub use types::*;
pub use auth::{ClientEvent, ClientEventType};
pub use client::Client;
pub use config::{ClientConfig, DialRetry, ManagementAddr};
pub use management::{ConnectionSettings, ManagementConnection};
pub use middleware::{Middleware, MiddlewareChain};
pub use protocol::MgmtCommands;
pub use state::{StateSnapshot, StateTracker};
