//! # POST /upload-url
//!
//! アップロード用の署名付きURL発行。

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Response;
use axum::Json;
use vaultguard_types::{UploadUrlRequest, UploadUrlResponse};

use super::{authorization, with_cors};
use crate::config::GatewayState;

/// POST /upload-url: アップロード用の署名付きURL発行。
///
/// 本文がJSONとして読めない場合も認証を先に行い、その後フィールドの検証で拒否する。
pub async fn handle_upload_url(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    body: Result<Json<UploadUrlRequest>, JsonRejection>,
) -> Response {
    let request = body.map(|Json(req)| req).unwrap_or_else(|rejection| {
        tracing::debug!(error = %rejection.body_text(), "リクエスト本文を読めませんでした");
        UploadUrlRequest {
            file_name: String::new(),
            file_type: String::new(),
        }
    });

    let result = state
        .vault
        .request_upload(
            authorization(&headers),
            &request.file_name,
            &request.file_type,
        )
        .await
        .map(|grant| {
            Json(UploadUrlResponse {
                url: grant.capability.url,
                object_key: grant.capability.object_key,
                expires_at: grant.capability.expires_at,
            })
        });

    with_cors(result)
}
