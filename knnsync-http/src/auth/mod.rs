pub mod middleware;

pub use middleware::{API_KEY_HEADER, api_key_middleware, requires_api_key};
