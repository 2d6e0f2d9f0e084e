pub mod config;
pub mod logic;
pub mod providers;
pub mod router;
pub mod server;
pub mod service;

pub use config::Config;
pub use logic::*;
pub use router::*;
pub use server::{StartGatewayServerParams, StartGatewayServerResult, start_gateway_server};
pub use service::{GatewayService, GatewayServiceParams, IdentityProviderHandle};
