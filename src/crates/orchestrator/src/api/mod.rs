//! HTTP surface: routes, handlers, error mapping, wire types

pub mod error;
pub mod handlers;
pub mod routes;
pub mod types;

pub use error::{ApiError, ApiResult, ErrorBody};
pub use routes::{create_router, AppState};
