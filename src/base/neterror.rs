use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum NetError {
    // Generic Errors
    #[error("Generic failure")]
    Failed,
    #[error("Operation aborted")]
    Aborted,
    #[error("Invalid argument")]
    InvalidArgument,
    #[error("Unexpected state")]
    Unexpected,
    #[error("Insufficient resources")]
    InsufficientResources,

    // Connection Errors
    #[error("Connection closed (TCP FIN)")]
    ConnectionClosed,
    #[error("Connection reset (TCP RST)")]
    ConnectionReset,
    #[error("Connection refused")]
    ConnectionRefused,
    #[error("Connection aborted")]
    ConnectionAborted,
    #[error("Connection failed")]
    ConnectionFailed,
    #[error("Name not resolved")]
    NameNotResolved,
    #[error("Address unreachable")]
    AddressUnreachable,
    #[error("Socket not connected")]
    SocketNotConnected,
    #[error("Connection timed out")]
    ConnectionTimedOut,
    #[error("Preconnect max socket limit")]
    PreconnectMaxSocketLimit,
    #[error("Temporarily throttled")]
    TemporarilyThrottled,

    // URL Errors
    #[error("Invalid URL")]
    InvalidUrl,

    // Connection manager errors (custom codes starting at -10000)
    #[error("Connection manager is shutting down")]
    ShuttingDown,

    #[error("Unknown error: {0}")]
    Unknown(i32),
}

impl NetError {
    pub fn as_i32(&self) -> i32 {
        match self {
            NetError::Failed => -2,
            NetError::Aborted => -3,
            NetError::InvalidArgument => -4,
            NetError::Unexpected => -9,
            NetError::InsufficientResources => -12,
            NetError::ConnectionClosed => -100,
            NetError::ConnectionReset => -101,
            NetError::ConnectionRefused => -102,
            NetError::ConnectionAborted => -103,
            NetError::ConnectionFailed => -104,
            NetError::NameNotResolved => -105,
            NetError::AddressUnreachable => -109,
            NetError::SocketNotConnected => -112,
            NetError::ConnectionTimedOut => -118,
            NetError::PreconnectMaxSocketLimit => -133,
            NetError::TemporarilyThrottled => -139,
            NetError::InvalidUrl => -300,
            NetError::ShuttingDown => -10000,
            NetError::Unknown(code) => *code,
        }
    }

    /// Whether a transport failing with this error may be retried on a fresh attempt.
    pub fn is_connect_failure(&self) -> bool {
        matches!(
            self,
            NetError::ConnectionRefused
                | NetError::ConnectionReset
                | NetError::ConnectionAborted
                | NetError::ConnectionFailed
                | NetError::ConnectionTimedOut
                | NetError::AddressUnreachable
                | NetError::NameNotResolved
        )
    }
}

impl From<i32> for NetError {
    fn from(code: i32) -> Self {
        match code {
            -2 => NetError::Failed,
            -3 => NetError::Aborted,
            -4 => NetError::InvalidArgument,
            -9 => NetError::Unexpected,
            -12 => NetError::InsufficientResources,
            -100 => NetError::ConnectionClosed,
            -101 => NetError::ConnectionReset,
            -102 => NetError::ConnectionRefused,
            -103 => NetError::ConnectionAborted,
            -104 => NetError::ConnectionFailed,
            -105 => NetError::NameNotResolved,
            -109 => NetError::AddressUnreachable,
            -112 => NetError::SocketNotConnected,
            -118 => NetError::ConnectionTimedOut,
            -133 => NetError::PreconnectMaxSocketLimit,
            -139 => NetError::TemporarilyThrottled,
            -300 => NetError::InvalidUrl,
            -10000 => NetError::ShuttingDown,
            _ => NetError::Unknown(code),
        }
    }
}
