use hmac::{Hmac, Mac};
use sha2::Sha256;
use shared::{
    error::{ApiError, ErrorCode},
    protocol::{UploadCallbackPayload, UploadedFile, CALLBACK_SIGNATURE_PREFIX},
};
use storage::NewFile;
use thiserror::Error;
use tracing::{info, warn};

use crate::{complete_upload, ApiContext};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("missing callback header {0}")]
    MissingHeader(&'static str),
    #[error("invalid callback signature")]
    InvalidSignature,
    #[error("callback secret is not a usable HMAC key")]
    InvalidSecret,
    #[error("malformed callback payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),
    #[error("failed to persist uploaded file: {0}")]
    Persist(#[source] anyhow::Error),
}

impl From<CallbackError> for ApiError {
    fn from(value: CallbackError) -> Self {
        let code = match &value {
            CallbackError::MissingHeader(_) | CallbackError::InvalidSignature => {
                ErrorCode::Unauthorized
            }
            CallbackError::MalformedPayload(_) => ErrorCode::Validation,
            CallbackError::InvalidSecret | CallbackError::Persist(_) => ErrorCode::Internal,
        };
        ApiError::new(code, value.to_string())
    }
}

/// `hmac-sha256=<hex>` over the raw request body.
pub fn sign_callback(secret: &[u8], body: &[u8]) -> Result<String, CallbackError> {
    let mut mac = keyed_mac(secret)?;
    mac.update(body);
    Ok(format!(
        "{CALLBACK_SIGNATURE_PREFIX}{}",
        hex::encode(mac.finalize().into_bytes())
    ))
}

/// Constant-time check of `signature` against the body.
pub fn verify_callback_signature(
    secret: &[u8],
    body: &[u8],
    signature: &str,
) -> Result<(), CallbackError> {
    let digest = signature
        .strip_prefix(CALLBACK_SIGNATURE_PREFIX)
        .ok_or(CallbackError::InvalidSignature)?;
    let expected = hex::decode(digest).map_err(|_| CallbackError::InvalidSignature)?;
    let mut mac = keyed_mac(secret)?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| CallbackError::InvalidSignature)
}

fn keyed_mac(secret: &[u8]) -> Result<HmacSha256, CallbackError> {
    HmacSha256::new_from_slice(secret).map_err(|_| CallbackError::InvalidSecret)
}

/// Handles the vendor's "file uploaded" webhook.
///
/// The body is only decoded after the signature checks out. A valid callback
/// persists the record, clears the pending entry and pushes `FileUploaded` to the
/// owner's connections.
pub async fn handle_upload_callback(
    ctx: &ApiContext,
    hook: Option<&str>,
    signature: Option<&str>,
    body: &[u8],
) -> Result<UploadedFile, CallbackError> {
    let hook = hook.ok_or(CallbackError::MissingHeader(
        shared::protocol::CALLBACK_HOOK_HEADER,
    ))?;
    let signature = signature.ok_or(CallbackError::MissingHeader(
        shared::protocol::CALLBACK_SIGNATURE_HEADER,
    ))?;

    if let Err(err) = verify_callback_signature(ctx.callback_secret.as_bytes(), body, signature) {
        warn!(hook, "rejected upload callback with bad signature");
        return Err(err);
    }

    let payload: UploadCallbackPayload = serde_json::from_slice(body)?;
    info!(
        hook,
        file_key = %payload.file.key,
        user_id = %payload.metadata.user_id,
        "upload callback received"
    );

    let file = NewFile {
        owner_id: payload.metadata.user_id,
        folder_id: payload.metadata.folder_id,
        file_key: payload.file.key,
        url: payload.file.url,
        name: payload.file.name,
        mime_type: payload.file.mime_type,
        size_bytes: payload.file.size,
    };
    complete_upload(ctx, file)
        .await
        .map_err(CallbackError::Persist)
}

#[cfg(test)]
#[path = "tests/callback_tests.rs"]
mod tests;
