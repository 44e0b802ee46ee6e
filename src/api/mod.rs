//! Docker Engine API served over HTTP

mod handlers;
mod server;
mod types;

pub use handlers::{AppState, API_VERSION, MIN_API_VERSION};
pub use server::{create_router, Server};
pub use types::*;
