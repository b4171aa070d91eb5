//! FdxTunnel Shared Library
//!
//! Wire messages, the concurrent registry and the error type shared by
//! the server and the agent.

pub mod error;
pub mod protocol;
pub mod registry;

pub use error::{Error, Result};
pub use protocol::{RequestMessage, ResponseMessage};
pub use registry::Registry;
