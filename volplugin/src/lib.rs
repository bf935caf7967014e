pub mod api;
pub mod config;
pub mod error;
pub mod locks;
pub mod reconcile;
pub mod server;
pub mod volumes;

pub use api::{AppState, create_router};
pub use error::ApiError;
pub use reconcile::Reconciler;
pub use volumes::Volumes;
