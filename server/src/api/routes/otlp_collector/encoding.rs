//! OTLP content-type and content-encoding decoding
//!
//! Supports protobuf (application/x-protobuf) and JSON (application/json)
//! bodies per the OpenTelemetry Protocol specification, optionally compressed
//! with gzip or deflate. Anything else is rejected with a typed error before
//! any decompression or parsing is attempted; the handlers map error kinds to
//! HTTP statuses (unsupported media type vs. unprocessable entity).

use std::fmt;
use std::io::Read;

use axum::body::Bytes;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use flate2::read::{GzDecoder, ZlibDecoder};
use prost::Message;
use serde::{Deserialize, Serialize};

/// Content type for OTLP requests/responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Protobuf,
    Json,
}

impl ContentType {
    /// Parse content type from HTTP headers. A missing header defaults to
    /// protobuf; an unrecognized one is rejected.
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, DecodeError> {
        let content_type = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/x-protobuf");

        if content_type.starts_with("application/x-protobuf") {
            Ok(ContentType::Protobuf)
        } else if content_type.starts_with("application/json") {
            Ok(ContentType::Json)
        } else {
            Err(DecodeError::UnsupportedContentType(
                content_type.to_string(),
            ))
        }
    }

    /// Get the content type header value for responses
    #[inline]
    pub fn as_header_value(self) -> &'static str {
        match self {
            ContentType::Protobuf => "application/x-protobuf",
            ContentType::Json => "application/json",
        }
    }
}

/// Content encoding of the request body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentEncoding {
    Identity,
    Gzip,
    Deflate,
}

impl ContentEncoding {
    /// Parse content encoding from HTTP headers. A missing header means
    /// identity; an unrecognized one is rejected.
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, DecodeError> {
        let encoding = headers
            .get(header::CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("identity");

        match encoding.trim() {
            "" | "identity" => Ok(ContentEncoding::Identity),
            "gzip" => Ok(ContentEncoding::Gzip),
            "deflate" => Ok(ContentEncoding::Deflate),
            other => Err(DecodeError::UnsupportedEncoding(other.to_string())),
        }
    }
}

/// Decompress a request body according to its declared encoding
pub fn decompress(body: &[u8], encoding: ContentEncoding) -> Result<Vec<u8>, DecodeError> {
    match encoding {
        ContentEncoding::Identity => Ok(body.to_vec()),
        ContentEncoding::Gzip => {
            let mut decoder = GzDecoder::new(body);
            let mut decompressed = Vec::new();
            decoder
                .read_to_end(&mut decompressed)
                .map_err(|e| DecodeError::Decompress(e.to_string()))?;
            Ok(decompressed)
        }
        ContentEncoding::Deflate => {
            let mut decoder = ZlibDecoder::new(body);
            let mut decompressed = Vec::new();
            decoder
                .read_to_end(&mut decompressed)
                .map_err(|e| DecodeError::Decompress(e.to_string()))?;
            Ok(decompressed)
        }
    }
}

/// Decode an OTLP request body: validate headers, decompress, then parse
/// according to the declared content type
pub fn decode_request<T>(body: &Bytes, headers: &HeaderMap) -> Result<(T, ContentType), DecodeError>
where
    T: Message + Default + for<'de> Deserialize<'de>,
{
    let content_type = ContentType::from_headers(headers)?;
    let encoding = ContentEncoding::from_headers(headers)?;
    let payload = decompress(body, encoding)?;

    let decoded = match content_type {
        ContentType::Protobuf => {
            T::decode(payload.as_slice()).map_err(|e| DecodeError::Protobuf(e.to_string()))?
        }
        ContentType::Json => serde_json::from_slice(payload.as_slice())
            .map_err(|e| DecodeError::Json(e.to_string()))?,
    };
    Ok((decoded, content_type))
}

/// Encode an OTLP response to bytes based on content type
fn encode_response<T>(response: &T, content_type: ContentType) -> Result<Vec<u8>, String>
where
    T: Message + Serialize,
{
    match content_type {
        ContentType::Protobuf => Ok(response.encode_to_vec()),
        ContentType::Json => serde_json::to_vec(response).map_err(|e| e.to_string()),
    }
}

/// Create a successful OTLP response with the correct content type
pub fn success_response<T>(response: &T, content_type: ContentType) -> Response
where
    T: Message + Serialize,
{
    match encode_response(response, content_type) {
        Ok(bytes) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, content_type.as_header_value())],
            bytes,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode OTLP response");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, "text/plain")],
                "Internal server error",
            )
                .into_response()
        }
    }
}

/// Error returned when decoding fails
#[derive(Debug, PartialEq, Eq)]
pub enum DecodeError {
    UnsupportedContentType(String),
    UnsupportedEncoding(String),
    Decompress(String),
    Protobuf(String),
    Json(String),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::UnsupportedContentType(ct) => {
                write!(f, "unsupported content type: {}", ct)
            }
            DecodeError::UnsupportedEncoding(enc) => {
                write!(f, "unsupported content encoding: {}", enc)
            }
            DecodeError::Decompress(e) => write!(f, "decompression failed: {}", e),
            DecodeError::Protobuf(e) => write!(f, "protobuf decode error: {}", e),
            DecodeError::Json(e) => write!(f, "JSON decode error: {}", e),
        }
    }
}

impl std::error::Error for DecodeError {}

impl DecodeError {
    /// HTTP status for this failure: unsupported type/encoding is 415, a
    /// payload that cannot be decompressed or parsed is 422
    pub fn status_code(&self) -> StatusCode {
        match self {
            DecodeError::UnsupportedContentType(_) | DecodeError::UnsupportedEncoding(_) => {
                StatusCode::UNSUPPORTED_MEDIA_TYPE
            }
            DecodeError::Decompress(_) | DecodeError::Protobuf(_) | DecodeError::Json(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
        }
    }

    /// Create an error response for a decode failure.
    /// Internal error details are logged but not exposed to clients.
    pub fn into_response(self) -> Response {
        tracing::warn!(error = %self, "Failed to decode OTLP request");

        let message = match &self {
            DecodeError::UnsupportedContentType(_) => "Unsupported content type",
            DecodeError::UnsupportedEncoding(_) => "Unsupported content encoding",
            DecodeError::Decompress(_) => "Failed to decompress request body",
            DecodeError::Protobuf(_) => "Failed to decode protobuf request",
            DecodeError::Json(_) => "Failed to decode JSON request",
        };
        (
            self.status_code(),
            [(header::CONTENT_TYPE, "text/plain")],
            message,
        )
            .into_response()
    }
}
