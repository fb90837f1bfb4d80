//! One-time secret handoff.
//!
//! A transport that delegates authentication to an external client cannot
//! pass the password on the command line or in a long-lived environment
//! variable. Instead it publishes the secret here under a random session id,
//! exports only that id to the client's askpass helper, and purges the entry
//! as soon as the session produces output.
//!
//! - [`Secret`]: redacting, self-wiping password wrapper
//! - [`HandoffStore`] / [`store()`]: keyed single-read cache
//! - [`Lease`]: RAII ownership of a published secret
//! - [`fetch`]: helper side of the local channel

pub mod channel;
pub mod error;
pub mod lease;
pub mod secret;
pub mod store;

pub use channel::{fetch, socket_path};
pub use error::{HandoffError, Result};
pub use lease::Lease;
pub use secret::Secret;
pub use store::{store, HandoffStore, SessionId};

/// Environment variable carrying the publishing process id.
pub const ENV_PID: &str = "SSHFORGE_PID";

/// Environment variable carrying the session id to fetch.
pub const ENV_SESSION_ID: &str = "SSHFORGE_SID";
