//! # parley-shared
//!
//! Types shared by every Parley crate: identity newtypes, the client/server
//! wire protocol, protocol constants, and the hub error taxonomy.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::HubError;
