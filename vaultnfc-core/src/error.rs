use thiserror::Error;

/// Failure kinds surfaced to the caller by discovery and the connection
/// manager.
///
/// Transport internals work with [`anyhow::Error`]; background tasks convert
/// those into one of these variants before they cross a task boundary.  The
/// `Display` text is the short status string shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    #[error("permission to use the radio was denied")]
    PermissionDenied,
    #[error("radio is disabled")]
    RadioDisabled,
    #[error("discovery failed: {0}")]
    DiscoveryFailed(String),
    #[error("connection failed: {0}")]
    ConnectFailed(String),
    #[error("send failed: {0}")]
    WriteFailed(String),
    #[error("read failed: {0}")]
    ReadFailed(String),
    #[error("peer disconnected")]
    PeerDisconnected,
    #[error("could not encode credential: {0}")]
    Encode(String),
    #[error("malformed payload: {0}")]
    Decode(String),
    #[error("not connected to a peer")]
    NotConnected,
    #[error("connection manager is not running")]
    ManagerStopped,
}

impl TransferError {
    /// Builds the variant from an error chain, keeping the full context as
    /// the reason (`"outer: inner"`).
    pub fn connect(err: &anyhow::Error) -> Self {
        Self::ConnectFailed(format!("{err:#}"))
    }

    pub fn write(err: &anyhow::Error) -> Self {
        Self::WriteFailed(format!("{err:#}"))
    }

    pub fn read(err: &anyhow::Error) -> Self {
        Self::ReadFailed(format!("{err:#}"))
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Context;

    use super::*;

    /// Given an error with context, when converted, then the reason keeps every layer.
    #[test]
    fn given_context_chain_when_converted_then_reason_keeps_every_layer() {
        let err = Err::<(), _>(anyhow::anyhow!("connection refused"))
            .context("failed to connect to 10.0.0.2:8988")
            .unwrap_err();
        let converted = TransferError::connect(&err);
        assert_eq!(
            converted,
            TransferError::ConnectFailed(
                "failed to connect to 10.0.0.2:8988: connection refused".into()
            )
        );
    }

    /// Given a disabled radio, when displayed, then the text is the short status.
    #[test]
    fn given_radio_disabled_when_displayed_then_is_short_status() {
        assert_eq!(TransferError::RadioDisabled.to_string(), "radio is disabled");
    }

    /// Given a serialization failure, when displayed, then it is not called a malformed payload.
    #[test]
    fn given_encode_failure_when_displayed_then_differs_from_decode_failure() {
        let encode = TransferError::Encode("key must be a string".into());
        assert_eq!(
            encode.to_string(),
            "could not encode credential: key must be a string"
        );
        assert_ne!(encode, TransferError::Decode("key must be a string".into()));
    }
}
