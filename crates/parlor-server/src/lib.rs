pub mod api;
pub mod config;
pub mod connection;
pub mod lookup;
pub mod server;

pub use config::{ConfigError, ServerConfig};
pub use lookup::StoreIdentity;
pub use server::{build_router, start, start_with_state, AppState, ServerHandle};
