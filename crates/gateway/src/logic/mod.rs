//! Gateway business logic: the Credential Resolver, Usage Metering & Limit
//! Guard, and the retry policy the Provider Router applies to idempotent
//! upstream calls.

pub mod credential_resolver;
pub mod retry;
pub mod usage;

pub use credential_resolver::{CredentialContext, ResolvedCredential as CredentialResolution};
pub use retry::RetryPolicy;
pub use usage::AdmissionDecision;
