pub mod client;
pub mod types;

pub use client::{encode_data_uri, image_mime_type, ApiClient};
pub use types::{
    ApiError, ImageMetadata, MediaReference, MediaUploadRequest, ObservationApi, ObservationPayload, ObservationRecord,
};
