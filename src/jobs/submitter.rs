//! Shared submit-with-compensation implementation. Every endpoint goes
//! through this one path, so a charged-but-untracked job cannot happen
//! depending on which handler was hit.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::ImageFormat;
use std::io::Cursor;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::compensation;
use super::store::{JobStore, StoreError};
use super::{GenerationJob, GenerationMode};
use crate::accounting::{AccountingKey, UsageLedger};
use crate::provider::{InferenceProvider, PredictionRequest, ProviderError};

/// Images larger than this are rejected outright instead of transcoded.
const MAX_IMAGE_BYTES: usize = 30 * 1024 * 1024;
/// Longest edge sent to the provider; larger inputs are downscaled.
const MAX_EDGE: u32 = 2048;

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("image payload exceeds {MAX_IMAGE_BYTES} bytes")]
    PayloadTooLarge,
    #[error("image payload could not be decoded: {0}")]
    InvalidImage(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("job tracking failed: {0}")]
    Tracking(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub image: Vec<u8>,
    pub mode: GenerationMode,
    pub custom_prompt: Option<String>,
    pub params: serde_json::Value,
}

pub struct JobSubmitter {
    provider: Arc<dyn InferenceProvider>,
    store: Arc<dyn JobStore>,
    ledger: Arc<dyn UsageLedger>,
    model: String,
    webhook_url: Option<String>,
}

impl JobSubmitter {
    pub fn new(
        provider: Arc<dyn InferenceProvider>,
        store: Arc<dyn JobStore>,
        ledger: Arc<dyn UsageLedger>,
        model: impl Into<String>,
        webhook_url: Option<String>,
    ) -> Self {
        Self {
            provider,
            store,
            ledger,
            model: model.into(),
            webhook_url,
        }
    }

    /// Dispatch a generation job. Precondition: the caller has already taken
    /// a ledger charge for `key` (`charged` = true), or the account is
    /// exempt (`charged` = false). If tracking the job fails after the
    /// provider accepted it, the provider job is canceled and the charge
    /// compensated before the error is returned.
    pub async fn submit(
        &self,
        request: SubmitRequest,
        key: &AccountingKey,
        charged: bool,
    ) -> Result<String, SubmitError> {
        let data_url = match bound_image_data_url(&request.image) {
            Ok(url) => url,
            Err(e) => {
                if charged {
                    self.rollback_direct(key).await;
                }
                return Err(e);
            }
        };
        let prompt = request
            .custom_prompt
            .clone()
            .unwrap_or_else(|| request.mode.prompt_template().to_string());

        let prediction = self
            .provider
            .create_prediction(&PredictionRequest {
                model: self.model.clone(),
                prompt,
                input_data_url: data_url,
                webhook_url: self.webhook_url.clone(),
                extra: request.params.clone(),
            })
            .await;

        let prediction = match prediction {
            Ok(p) => p,
            Err(e) => {
                if charged {
                    self.rollback_direct(key).await;
                }
                return Err(e.into());
            }
        };

        let input_ref = format!("sha256:{}", hex_digest(&request.image));
        let job = GenerationJob::new(&prediction.id, key.clone(), request.mode, input_ref, charged);

        if let Err(e) = self.store.insert(job).await {
            // Never leave a paid-for but untracked job behind: cancel
            // upstream best-effort, then reverse the charge.
            warn!(prediction_id = %prediction.id, "tracking insert failed, unwinding: {e}");
            if let Err(cancel_err) = self.provider.cancel_prediction(&prediction.id).await {
                warn!(prediction_id = %prediction.id, "upstream cancel failed: {cancel_err}");
            }
            if charged {
                self.rollback_direct(key).await;
            }
            return Err(e.into());
        }

        if let Err(e) = self.store.set_active(key, &prediction.id).await {
            warn!(prediction_id = %prediction.id, "could not record active job: {e}");
        }

        info!(job_id = %prediction.id, mode = ?request.mode, charged, "job submitted");
        Ok(prediction.id)
    }

    /// Mark a terminal failure and compensate the charge exactly once.
    pub async fn compensate(&self, job_id: &str) -> bool {
        compensation::compensate(&self.store, &self.ledger, job_id).await
    }

    // Used before a tracking row exists, so the charged-flag guard does not
    // apply yet; the charge is provably ours and unmatched.
    async fn rollback_direct(&self, key: &AccountingKey) {
        match self.ledger.rollback(key).await {
            Ok(true) => debug!(key = %key, "charge reversed after failed submit"),
            Ok(false) => warn!(key = %key, "no outstanding charge to reverse after failed submit"),
            Err(e) => warn!(key = %key, "rollback failed after failed submit: {e}"),
        }
    }
}

fn hex_digest(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Bound the payload and encode it as a data URL. Oversized images are
/// downscaled and re-encoded as JPEG, never rejected, unless they exceed
/// the hard byte cap.
fn bound_image_data_url(bytes: &[u8]) -> Result<String, SubmitError> {
    if bytes.len() > MAX_IMAGE_BYTES {
        return Err(SubmitError::PayloadTooLarge);
    }
    let img = image::load_from_memory(bytes)
        .map_err(|e| SubmitError::InvalidImage(e.to_string()))?;

    if img.width() <= MAX_EDGE && img.height() <= MAX_EDGE {
        let mime = detect_mime(bytes);
        return Ok(format!("data:{mime};base64,{}", BASE64.encode(bytes)));
    }

    debug!(
        width = img.width(),
        height = img.height(),
        "downscaling oversized image before dispatch"
    );
    let resized = img.thumbnail(MAX_EDGE, MAX_EDGE);
    let mut out = Vec::new();
    resized
        .to_rgb8()
        .write_to(&mut Cursor::new(&mut out), ImageFormat::Jpeg)
        .map_err(|e| SubmitError::InvalidImage(e.to_string()))?;
    Ok(format!("data:image/jpeg;base64,{}", BASE64.encode(&out)))
}

fn detect_mime(bytes: &[u8]) -> &'static str {
    match image::guess_format(bytes) {
        Ok(ImageFormat::Png) => "image/png",
        Ok(ImageFormat::WebP) => "image/webp",
        Ok(ImageFormat::Gif) => "image/gif",
        _ => "image/jpeg",
    }
}
