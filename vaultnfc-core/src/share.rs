use anyhow::{Context, Result};
use tracing::info;

use crate::codec;
use crate::error::TransferError;
use crate::record::CredentialRecord;
use crate::vault::CredentialStore;

/// Encodes the record the user picked for sending.
///
/// # Errors
///
/// Returns [`TransferError::Encode`] if the record cannot be serialized.
pub fn prepare_outgoing(record: &CredentialRecord) -> Result<Vec<u8>, TransferError> {
    codec::encode(record)
}

/// Decodes a received payload into a record ready for review.
///
/// The sender's store id means nothing on this device, so it is cleared.
///
/// # Errors
///
/// Returns [`TransferError::Decode`] if the payload is malformed.
pub fn review_incoming(payload: &[u8]) -> Result<CredentialRecord, TransferError> {
    let mut record = codec::decode(payload)?;
    record.id.clear();
    Ok(record)
}

/// Saves a reviewed record the user chose to keep and returns its new id.
///
/// # Errors
///
/// Returns an error if the store rejects the record.
pub async fn accept_incoming<S: CredentialStore>(
    store: &S,
    record: CredentialRecord,
) -> Result<String> {
    let title = record.title.clone();
    let id = store
        .save(record)
        .await
        .context("failed to save received credential")?;
    info!(id = %id, title = %title, "Received credential saved");
    Ok(id)
}
