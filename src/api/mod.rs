// src/api/mod.rs

pub mod error;
pub mod routes;
pub mod types;

pub use error::{ApiError, ApiResult};
pub use routes::router;
