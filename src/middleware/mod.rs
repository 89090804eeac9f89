mod auth;
mod request_id;

pub use auth::{admin_auth_middleware, api_auth_middleware};
pub use request_id::{REQUEST_ID_HEADER, RequestId, request_id_middleware};
