use std::io;

use thiserror::Error;

/// Exit status for a clean session, including a reported file collision.
pub const EXIT_OK: i32 = 0;
/// Exit status when the server rejects the command or the session aborts.
pub const EXIT_FAILURE: i32 = 1;
/// Exit status for invalid port numbers or malformed arguments.
pub const EXIT_USAGE: i32 = 2;

#[derive(Debug, Error)]
pub enum ClientError {
    /// Bad command line input, caught before any socket is opened.
    #[error("{0}")]
    Argument(String),

    #[error("cannot connect to {host}:{port}: {source}")]
    Connection {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    /// The server answered with something other than the command verb.
    /// Displays the server's text verbatim.
    #[error("{0}")]
    Protocol(String),

    #[error("A file with the name {0} already exists.\nPlease move it out of the current directory if you'd like to save the requested file.")]
    FileCollision(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ClientError {
    pub fn exit_code(&self) -> i32 {
        match self {
            ClientError::Argument(_) => EXIT_USAGE,
            ClientError::FileCollision(_) => EXIT_OK,
            ClientError::Connection { .. } | ClientError::Protocol(_) | ClientError::Io(_) => {
                EXIT_FAILURE
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_error_kind() {
        assert_eq!(ClientError::Argument("bad port".into()).exit_code(), EXIT_USAGE);
        assert_eq!(ClientError::Protocol("FILE NOT FOUND".into()).exit_code(), EXIT_FAILURE);
        assert_eq!(ClientError::FileCollision("a.txt".into()).exit_code(), EXIT_OK);
        let refused = ClientError::Connection {
            host: "localhost".into(),
            port: 1,
            source: io::Error::from(io::ErrorKind::ConnectionRefused),
        };
        assert_eq!(refused.exit_code(), EXIT_FAILURE);
    }

    #[test]
    fn protocol_error_shows_server_text_verbatim() {
        let err = ClientError::Protocol("File not found".into());
        assert_eq!(err.to_string(), "File not found");
    }
}
