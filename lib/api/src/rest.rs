use actix_cors::Cors;
use actix_multipart::Multipart;
use actix_web::http::StatusCode;
use actix_web::{web, App, HttpResponse, HttpServer, ResponseError, Result as ActixResult};
use bytes::{Bytes, BytesMut};
use futures_util::TryStreamExt;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use vizdex_core::{Deadline, Error, PayloadFilter};
use vizdex_embed::ImageInput;
use vizdex_storage::IndexEngine;

use crate::retrieval::RetrievalService;

/// Largest accepted request body.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;
pub const DEFAULT_TOP_K: usize = 5;
/// Longest accepted `filter` expression.
pub const MAX_FILTER_BYTES: usize = 4096;

/// Written only after the record is committed, so `status` is always "success".
/// Every failed ingest is answered with a 4xx or 5xx and a `detail` body instead.
#[derive(Serialize)]
struct UpsertResponse {
    image_id: String,
    status: &'static str,
    metadata: Map<String, Value>,
}

#[derive(Serialize)]
struct RetrievedRecord {
    image_id: String,
    metadata: Map<String, Value>,
    similarity: f32,
}

#[derive(Serialize)]
struct RetrieveResponse {
    results: Vec<RetrievedRecord>,
}

#[derive(Serialize)]
struct DeleteResponse {
    image_id: String,
    status: &'static str,
}

/// Error rendered as `{"detail": ...}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn bad_request(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            detail: detail.into(),
        }
    }

    fn not_found(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.detail)
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        self.status
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status).json(json!({"detail": self.detail}))
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        match &e {
            Error::NotFound(_) => ApiError::not_found(e.to_string()),
            Error::ImageDecode { .. } | Error::Preprocess(_) => {
                ApiError::bad_request(format!("Image processing error: {e}"))
            }
            _ if e.is_client_error() => ApiError::bad_request(e.to_string()),
            Error::Timeout { .. } => Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                detail: e.to_string(),
            },
            _ => {
                error!("Request failed: {}", e);
                Self {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    detail: "An unexpected error occurred".to_string(),
                }
            }
        }
    }
}

impl From<actix_multipart::MultipartError> for ApiError {
    fn from(e: actix_multipart::MultipartError) -> Self {
        ApiError::bad_request(format!("Malformed multipart body: {e}"))
    }
}

/// Shared handler state.
pub struct AppState<E: IndexEngine> {
    pub service: Arc<RetrievalService<E>>,
    pub request_timeout: Duration,
}

impl<E: IndexEngine> AppState<E> {
    pub fn new(service: Arc<RetrievalService<E>>, request_timeout: Duration) -> Self {
        Self {
            service,
            request_timeout,
        }
    }

    fn deadline(&self) -> Deadline {
        Deadline::after(self.request_timeout)
    }
}

/// Parts of a multipart form: text fields and file fields, each read fully.
#[derive(Default)]
struct FormParts {
    fields: HashMap<String, Bytes>,
}

impl FormParts {
    async fn read(mut payload: Multipart) -> Result<Self, ApiError> {
        let mut parts = FormParts::default();
        let mut total = 0usize;
        while let Some(mut field) = payload.try_next().await? {
            let name = field.name().unwrap_or_default().to_string();
            let mut buf = BytesMut::new();
            while let Some(chunk) = field.try_next().await? {
                total += chunk.len();
                if total > MAX_BODY_BYTES {
                    return Err(ApiError {
                        status: StatusCode::PAYLOAD_TOO_LARGE,
                        detail: format!("Request body exceeds {MAX_BODY_BYTES} bytes"),
                    });
                }
                buf.extend_from_slice(&chunk);
            }
            parts.fields.insert(name, buf.freeze());
        }
        Ok(parts)
    }

    fn text(&self, name: &str) -> Result<Option<String>, ApiError> {
        self.fields
            .get(name)
            .map(|b| {
                std::str::from_utf8(b)
                    .map(|s| s.trim().to_string())
                    .map_err(|_| ApiError::bad_request(format!("Field '{name}' is not valid UTF-8")))
            })
            .transpose()
    }

    fn required_text(&self, name: &str) -> Result<String, ApiError> {
        match self.text(name)? {
            Some(value) if !value.is_empty() => Ok(value),
            _ => Err(ApiError::bad_request(format!("Field '{name}' is required and must not be empty"))),
        }
    }

    fn file(&self, name: &str) -> Result<Bytes, ApiError> {
        match self.fields.get(name) {
            Some(bytes) if !bytes.is_empty() => Ok(bytes.clone()),
            _ => Err(ApiError::bad_request(format!("File '{name}' is required"))),
        }
    }
}

fn parse_top_k(raw: Option<String>) -> Result<usize, ApiError> {
    match raw {
        None => Ok(DEFAULT_TOP_K),
        Some(s) if s.is_empty() => Ok(DEFAULT_TOP_K),
        Some(s) => match s.parse::<i64>() {
            Ok(k) if k > 0 => Ok(k as usize),
            _ => Err(ApiError::bad_request("top_k must be a positive integer")),
        },
    }
}

fn parse_filter(raw: Option<String>) -> Result<Option<PayloadFilter>, ApiError> {
    match raw {
        Some(expr) if expr.len() > MAX_FILTER_BYTES => Err(ApiError::bad_request(format!(
            "filter exceeds {MAX_FILTER_BYTES} bytes"
        ))),
        Some(expr) if !expr.trim().is_empty() => Ok(Some(PayloadFilter::parse(&expr)?)),
        _ => Ok(None),
    }
}

async fn health() -> ActixResult<HttpResponse> {
    Ok(HttpResponse::Ok().json(json!({
        "status": "ok",
        "message": "Image retrieval service is running."
    })))
}

async fn upsert_image<E: IndexEngine>(
    state: web::Data<AppState<E>>,
    payload: Multipart,
) -> Result<HttpResponse, ApiError> {
    let form = FormParts::read(payload).await?;
    let image_id = form.required_text("image_id")?;
    let item_id = form.required_text("item_id")?;
    let image = form.file("image_bytes")?;

    let mut metadata = Map::new();
    metadata.insert("item_id".to_string(), Value::String(item_id));

    let outcome = state
        .service
        .ingest(&image_id, ImageInput::Bytes(image), metadata, state.deadline())
        .await?;

    Ok(HttpResponse::Ok().json(UpsertResponse {
        image_id: outcome.key,
        status: "success",
        metadata: outcome.metadata,
    }))
}

async fn retrieve_similar<E: IndexEngine>(
    state: web::Data<AppState<E>>,
    payload: Multipart,
) -> Result<HttpResponse, ApiError> {
    let form = FormParts::read(payload).await?;
    let top_k = parse_top_k(form.text("top_k")?)?;
    let image = ImageInput::Bytes(form.file("image_bytes")?);
    let filter = parse_filter(form.text("filter")?)?;

    let deadline = state.deadline();
    let hits = match &filter {
        Some(filter) => state.service.query_filtered(image, top_k, filter, deadline).await?,
        None => state.service.query(image, top_k, deadline).await?,
    };

    Ok(HttpResponse::Ok().json(RetrieveResponse {
        results: hits
            .into_iter()
            .map(|hit| RetrievedRecord {
                image_id: hit.key,
                metadata: hit.metadata,
                similarity: hit.score,
            })
            .collect(),
    }))
}

async fn delete_record<E: IndexEngine>(
    state: web::Data<AppState<E>>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let image_id = path.into_inner();
    if !state.service.delete(&image_id, state.deadline()).await? {
        return Err(ApiError::not_found("Image ID not found"));
    }
    Ok(HttpResponse::Ok().json(DeleteResponse {
        image_id,
        status: "deleted",
    }))
}

/// Register every route; shared by the server and by tests.
pub fn configure<E: IndexEngine>(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health))
        .route("/upsert/", web::post().to(upsert_image::<E>))
        .route("/retrieve/", web::post().to(retrieve_similar::<E>))
        .route("/record/{image_id}", web::delete().to(delete_record::<E>));
}

pub struct RestApi;

impl RestApi {
    pub async fn start<E: IndexEngine>(state: web::Data<AppState<E>>, host: &str, port: u16) -> std::io::Result<()> {
        info!("HTTP API listening on {}:{}", host, port);
        HttpServer::new(move || {
            let cors = Cors::default()
                .allow_any_origin()
                .allow_any_method()
                .allow_any_header()
                .max_age(3600);

            App::new()
                .wrap(cors)
                .app_data(state.clone())
                .app_data(web::PayloadConfig::new(MAX_BODY_BYTES))
                .configure(configure::<E>)
        })
        .bind((host, port))?
        .run()
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_top_k() {
        assert_eq!(parse_top_k(None).unwrap(), DEFAULT_TOP_K);
        assert_eq!(parse_top_k(Some("3".into())).unwrap(), 3);
        assert!(parse_top_k(Some("0".into())).is_err());
        assert!(parse_top_k(Some("-2".into())).is_err());
        assert!(parse_top_k(Some("abc".into())).is_err());
    }

    #[test]
    fn test_error_mapping() {
        let e: ApiError = Error::image_decode("bytes(3)", "bad").into();
        assert_eq!(e.status_code(), StatusCode::BAD_REQUEST);
        assert!(e.detail.starts_with("Image processing error"));

        let e: ApiError = Error::Storage("lmdb: MDB_PANIC".into()).into();
        assert_eq!(e.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!e.detail.contains("MDB_PANIC"));

        let e: ApiError = Error::DimensionMismatch { expected: 4, actual: 3 }.into();
        assert_eq!(e.status_code(), StatusCode::BAD_REQUEST);

        let e: ApiError = Error::InvalidKey("key is 600 bytes".into()).into();
        assert_eq!(e.status_code(), StatusCode::BAD_REQUEST);

        let e: ApiError = Error::Inference("model produced 3 values, expected 128".into()).into();
        assert_eq!(e.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_parse_filter() {
        assert!(parse_filter(None).unwrap().is_none());
        assert!(parse_filter(Some("  ".into())).unwrap().is_none());
        assert!(parse_filter(Some("a == 1".into())).unwrap().is_some());

        let nested = format!("{}a == 1", "!".repeat(MAX_FILTER_BYTES - 10));
        assert_eq!(parse_filter(Some(nested)).unwrap_err().status_code(), StatusCode::BAD_REQUEST);

        let oversized = format!("a == \"{}\"", "x".repeat(MAX_FILTER_BYTES));
        let err = parse_filter(Some(oversized)).unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert!(err.detail.contains("exceeds"));
    }
}
