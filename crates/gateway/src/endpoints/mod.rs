//! # Gatewayエンドポイント
//!
//! - `POST /upload-url`: アップロード用の署名付きURL発行
//! - `GET /files`: 存在が確認できたファイルの一覧
//!
//! どちらも `Authorization` ヘッダーのBearerトークンで利用者を識別し、
//! 成功・失敗を問わず `Access-Control-Allow-Origin: *` を付けて返す。

pub mod files;
pub mod upload_url;

pub use files::handle_files;
pub use upload_url::handle_upload_url;

use std::sync::Arc;

use axum::http::{header, HeaderMap, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;

use crate::config::GatewayState;
use crate::error::GatewayError;

/// Gatewayのルーターを構築する。
pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/upload-url", post(handle_upload_url))
        .route("/files", get(handle_files))
        .with_state(state)
}

/// `Authorization` ヘッダーの値。無い・UTF-8でない場合はNone。
fn authorization(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
}

/// 結果を応答に変換し、CORSヘッダーを付与する。
fn with_cors<T: IntoResponse>(result: Result<T, GatewayError>) -> Response {
    let mut response = result.into_response();
    response.headers_mut().insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    response
}
