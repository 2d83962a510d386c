use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;

use crate::api::types::*;
use crate::models::ImageAttachment;

/// HTTP transport for the avalanche-center API.
pub struct ApiClient {
    http: Client,
    api_prefix: String,
}

impl ApiClient {
    pub fn new(api_prefix: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = Client::builder().timeout(timeout).build()?;

        Ok(Self { http, api_prefix: api_prefix.into() })
    }

    pub fn media_url(&self) -> String {
        format!("{}/v2/public/media", self.api_prefix.trim_end_matches('/'))
    }

    async fn post_json<B, R>(&self, url: &str, body: &B) -> Result<R, ApiError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let response = self.http
            .post(url)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();

        if status.is_success() {
            response
                .json::<R>()
                .await
                .map_err(|e| ApiError::InvalidResponse(e.to_string()))
        } else {
            let body = response.text().await.unwrap_or_default();
            tracing::debug!(url, status = status.as_u16(), "request rejected");
            Err(ApiError::Remote { status: status.as_u16(), body })
        }
    }
}

#[async_trait]
impl ObservationApi for ApiClient {
    async fn upload_image(
        &self,
        attachment: &ImageAttachment,
        center_id: &str,
        metadata: &ImageMetadata,
    ) -> Result<MediaReference, ApiError> {
        let file = encode_data_uri(attachment).await?;
        let request = MediaUploadRequest {
            file,
            filename: attachment.file_name(),
            center_id,
            access: metadata.access(),
            photo_usage: metadata.photo_usage,
            name: &metadata.name,
            caption: metadata.caption.as_deref(),
        };
        self.post_json(&self.media_url(), &request).await
    }

    async fn upload_observation(
        &self,
        url: &str,
        payload: &ObservationPayload,
    ) -> Result<ObservationRecord, ApiError> {
        self.post_json(url, payload).await
    }
}

fn transport_error(e: reqwest::Error) -> ApiError {
    if e.is_timeout() {
        ApiError::Timeout
    } else {
        ApiError::Connectivity(e.to_string())
    }
}

pub fn image_mime_type(attachment: &ImageAttachment) -> Result<&'static str, ApiError> {
    let ext = attachment.extension().unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => Ok("image/jpeg"),
        "png" => Ok("image/png"),
        "gif" => Ok("image/gif"),
        "webp" => Ok("image/webp"),
        "heic" => Ok("image/heic"),
        "heif" => Ok("image/heif"),
        _ => Err(ApiError::Encoding(format!("{} has no known image type", attachment.file_name()))),
    }
}

/// Reads the attachment and renders it as a base64 data URI.
/// The extension is checked before touching the file.
pub async fn encode_data_uri(attachment: &ImageAttachment) -> Result<String, ApiError> {
    let mime = image_mime_type(attachment)?;
    let bytes = tokio::fs::read(&attachment.uri).await.map_err(|e| ApiError::Attachment {
        path: attachment.uri.clone(),
        message: e.to_string(),
    })?;
    let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
    Ok(format!("data:{mime};base64,{encoded}"))
}
