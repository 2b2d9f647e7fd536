//! Client and companion server for a two-connection file transfer protocol.
//!
//! The client sends `-l||` or `-g <file>||` over a control connection, waits
//! for the server to echo the verb, then tells the server where to dial back
//! (`<host> <port>||`). The listing or file arrives over that second
//! connection, terminated by `||`.

pub mod cmd;
pub mod error;
pub mod files;
pub mod logging;
pub mod network;
pub mod protocol;
pub mod server;
pub mod session;

pub use error::{ClientError, Result};
pub use protocol::{Command, EndpointAddress, TransferResult};
