pub mod handlers;
pub mod request;
pub mod server;

pub use handlers::{ApiError, AppState};
pub use server::{build_router, run_server, ServerConfig};
