pub mod adapters;
pub mod authz;
pub mod crypto;
pub mod domain;
pub mod env;
pub mod error;
pub mod identity;
pub mod libsql;
pub mod logging;
pub mod port;
pub mod primitives;
pub mod store;
pub mod subsystem;
pub mod test_utils;
// re-export paste for the macros
pub use paste;
