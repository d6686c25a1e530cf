//! # GET /files
//!
//! 存在が確認できたファイルの一覧。

use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Response;
use axum::Json;

use super::{authorization, with_cors};
use crate::config::GatewayState;

/// GET /files: 呼び出し元のファイル一覧（作成時刻の新しい順）。
pub async fn handle_files(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
) -> Response {
    let result = state
        .vault
        .list_files(authorization(&headers))
        .await
        .map(Json);

    with_cors(result)
}
