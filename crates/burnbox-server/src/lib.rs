pub mod auth;
pub mod crypto;
pub mod dirs;
pub mod error;
pub mod handlers;
pub mod lifecycle;
pub mod server;
pub mod store;

/// Shared application state threaded through axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: lifecycle::SecretManager,
    /// Optional API key required on the secret routes.
    pub api_key: Option<String>,
}

pub use error::SecretError;
pub use lifecycle::{Salt, SecretManager};
pub use server::{build_manager, read_secret_file, resolve_data_dir, router, run, ServerConfig};
