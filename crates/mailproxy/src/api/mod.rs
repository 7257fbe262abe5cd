pub mod error;
pub mod router;

pub use error::{ErrorModel, ErrorResponse, InnerError};

pub const X_REQUEST_ID_HEADER: &str = "x-request-id";
