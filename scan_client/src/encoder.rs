use std::sync::Arc;

use reqwest::multipart::{Form, Part};

use crate::{
    error::{ClientError, Result},
    selection::SelectedImage,
};

/// Name of the multipart field the backend reads the upload from.
pub const IMAGE_FIELD: &str = "image";

#[derive(Debug, Clone)]
pub struct MultipartPayload {
    field: &'static str,
    file_name: String,
    mime_type: String,
    bytes: Arc<[u8]>,
}

/// Packages the current selection. A missing selection is a caller bug;
/// `Workflow::analyze` short-circuits before getting here.
pub fn encode(image: Option<&SelectedImage>) -> Result<MultipartPayload> {
    let image = image.ok_or(ClientError::MissingImage)?;
    Ok(MultipartPayload {
        field: IMAGE_FIELD,
        file_name: image.file_name().to_string(),
        mime_type: image.mime_type().to_string(),
        bytes: image.shared_bytes(),
    })
}

impl MultipartPayload {
    pub fn field_name(&self) -> &str {
        self.field
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Builds a fresh reqwest form. Forms are consumed on send, so retries
    /// call this once per attempt.
    pub fn to_form(&self) -> Result<Form> {
        let part = Part::bytes(self.bytes.to_vec())
            .file_name(self.file_name.clone())
            .mime_str(&self.mime_type)
            .map_err(|_| ClientError::Config(format!("invalid mime type {}", self.mime_type)))?;
        Ok(Form::new().part(self.field, part))
    }
}
