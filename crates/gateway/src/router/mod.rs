pub mod gateway;

pub use gateway::{gateway_router, generate_openapi_spec};
