//! Single-file multipart upload policy
//!
//! The inbound form is parsed with `multer` and checked before anything is
//! sent upstream: exactly one `file` field, an allowlisted type and extension,
//! and a size ceiling. The allowlists mirror what the document service accepts.
//! The accepted file is re-encoded as a fresh form for the backend.

use bff_core::{GatewayError, Result};
use bytes::Bytes;
use futures::Stream;
use multer::{Constraints, Multipart, SizeLimit};
use tracing::{debug, warn};

pub const PDF: &str = "application/pdf";
pub const DOCX: &str = "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const PPTX: &str = "application/vnd.openxmlformats-officedocument.presentationml.presentation";
pub const MSWORD: &str = "application/msword";

/// Slack for multipart framing on top of the file size ceiling
const FORM_OVERHEAD_BYTES: u64 = 64 * 1024;

#[derive(Debug, Clone)]
pub struct UploadPolicy {
    pub max_bytes: usize,
    pub allowed_types: Vec<&'static str>,
    /// Lowercase, without the dot
    pub allowed_extensions: Vec<&'static str>,
    pub field_name: &'static str,
}

impl UploadPolicy {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            allowed_types: vec![PDF, DOCX, PPTX, MSWORD],
            allowed_extensions: vec!["pdf", "docx", "doc", "pptx", "ppt"],
            field_name: "file",
        }
    }

    /// Effective type of a part: its declared type, or the file extension
    /// when the declaration is missing or `application/octet-stream`.
    pub fn resolve_type(declared: Option<&mime::Mime>, file_name: &str) -> Option<String> {
        match declared {
            Some(m) if *m != mime::APPLICATION_OCTET_STREAM => Some(m.essence_str().to_ascii_lowercase()),
            _ => Self::type_from_extension(file_name).map(str::to_string),
        }
    }

    fn type_from_extension(file_name: &str) -> Option<&'static str> {
        let (_, ext) = file_name.rsplit_once('.')?;
        match ext.to_ascii_lowercase().as_str() {
            "pdf" => Some(PDF),
            "docx" => Some(DOCX),
            "pptx" => Some(PPTX),
            "doc" => Some(MSWORD),
            _ => None,
        }
    }

    pub fn is_allowed(&self, content_type: &str) -> bool {
        self.allowed_types.iter().any(|t| t.eq_ignore_ascii_case(content_type))
    }

    pub fn has_allowed_extension(&self, file_name: &str) -> bool {
        file_name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .is_some_and(|ext| self.allowed_extensions.contains(&ext.as_str()))
    }
}

#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub file_name: String,
    pub content_type: String,
    pub data: Bytes,
}

impl UploadedFile {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Fresh form for the backend carrying only the file
    pub fn into_form(self, field_name: &'static str) -> Result<reqwest::multipart::Form> {
        let length = self.data.len() as u64;
        let part = reqwest::multipart::Part::stream_with_length(reqwest::Body::from(self.data), length)
            .file_name(self.file_name)
            .mime_str(&self.content_type)
            .map_err(|e| GatewayError::Internal(format!("failed to encode upload: {}", e)))?;
        Ok(reqwest::multipart::Form::new().part(field_name, part))
    }
}

/// Strip any client-supplied directory components and control characters
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base.chars().filter(|c| !c.is_control()).collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        "upload".to_string()
    } else {
        cleaned.to_string()
    }
}

fn map_multer_error(e: multer::Error, max_bytes: usize) -> GatewayError {
    match e {
        multer::Error::FieldSizeExceeded { .. } | multer::Error::StreamSizeExceeded { .. } => {
            GatewayError::validation("file", format!("must be at most {} bytes", max_bytes))
        }
        other => {
            debug!(error = %other, "Malformed multipart body");
            GatewayError::validation("body", "malformed multipart body")
        }
    }
}

/// Read exactly one allowlisted file from a multipart body.
///
/// The part's type is checked from its headers before its data is read.
pub async fn read_single_file<S, O, E>(content_type: Option<&str>, body: S, policy: &UploadPolicy) -> Result<UploadedFile>
where
    S: Stream<Item = std::result::Result<O, E>> + Send + 'static,
    O: Into<Bytes> + 'static,
    E: Into<Box<dyn std::error::Error + Send + Sync>> + 'static,
{
    let boundary = content_type
        .and_then(|ct| multer::parse_boundary(ct).ok())
        .ok_or_else(|| GatewayError::validation("body", "expected multipart/form-data"))?;

    let constraints = Constraints::new().size_limit(
        SizeLimit::new()
            .per_field(policy.max_bytes as u64)
            .whole_stream(policy.max_bytes as u64 + FORM_OVERHEAD_BYTES),
    );
    let mut multipart = Multipart::with_constraints(body, boundary, constraints);

    let mut uploaded: Option<UploadedFile> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| map_multer_error(e, policy.max_bytes))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if name != policy.field_name {
            return Err(GatewayError::validation(name, "unknown field"));
        }
        if uploaded.is_some() {
            return Err(GatewayError::validation(policy.field_name, "exactly one file is allowed"));
        }

        let file_name = field
            .file_name()
            .map(sanitize_file_name)
            .ok_or_else(|| GatewayError::validation(policy.field_name, "must be a file"))?;

        let content_type = UploadPolicy::resolve_type(field.content_type(), &file_name)
            .unwrap_or_else(|| mime::APPLICATION_OCTET_STREAM.to_string());
        if !policy.is_allowed(&content_type) {
            warn!(content_type = %content_type, "Rejected upload type");
            return Err(GatewayError::UnsupportedMediaType(content_type));
        }
        if !policy.has_allowed_extension(&file_name) {
            let extension = file_name.rsplit_once('.').map_or("", |(_, ext)| ext);
            warn!(extension = %extension, "Rejected upload extension");
            return Err(GatewayError::UnsupportedMediaType(format!(".{}", extension)));
        }

        let data = field
            .bytes()
            .await
            .map_err(|e| map_multer_error(e, policy.max_bytes))?;
        if data.is_empty() {
            return Err(GatewayError::validation(policy.field_name, "must not be empty"));
        }

        uploaded = Some(UploadedFile {
            file_name,
            content_type,
            data,
        });
    }

    uploaded.ok_or_else(|| GatewayError::validation(policy.field_name, "is required"))
}
