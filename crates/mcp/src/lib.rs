pub mod connection;
pub mod dispatcher;
pub mod oauth;
pub mod target_resolution;
pub mod tool_modifier;
pub mod transport;

pub const DEFAULT_DATA_ENCRYPTION_KEY_ID: &str = "default";
