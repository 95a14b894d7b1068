use std::fmt;

use crate::error::TransferError;

/// Transfer progress as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferStatus {
    Idle,
    Discovering,
    Connecting,
    Connected,
    AwaitingPayload,
    PayloadReceived,
    Disconnected,
    Failed(TransferError),
}

impl TransferStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Discovering => f.write_str("searching for devices"),
            Self::Connecting => f.write_str("connecting"),
            Self::Connected => f.write_str("connected"),
            Self::AwaitingPayload => f.write_str("waiting for a credential"),
            Self::PayloadReceived => f.write_str("credential received"),
            Self::Disconnected => f.write_str("disconnected"),
            Self::Failed(e) => write!(f, "failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Given a failed status, when displayed, then the reason is included.
    #[test]
    fn given_failed_status_when_displayed_then_includes_reason() {
        let status = TransferStatus::Failed(TransferError::PeerDisconnected);
        assert!(status.is_failed());
        assert_eq!(status.to_string(), "failed: peer disconnected");
    }
}
