//! # Gateway エラー型
//!
//! クライアントへの応答は分類ごとに固定する。
//! 認証失敗の内部原因や依存サービスの詳細はログにのみ残し、応答には含めない。

use axum::http::StatusCode;
use axum::Json;
use vaultguard_auth::AuthError;
use vaultguard_types::ErrorBody;

/// Gatewayエラー型。
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// トークン検証に失敗（原因は問わず401）
    #[error("認証に失敗: {0}")]
    Unauthorized(#[from] AuthError),
    /// 入力値が不正
    #[error("不正な入力 ({field}): {reason}")]
    Validation {
        /// クライアントが送ったフィールド名
        field: &'static str,
        /// 不正の内容
        reason: String,
    },
    /// 署名付きURLの発行に失敗
    #[error("署名付きURLの発行に失敗: {0}")]
    Issue(String),
    /// メタデータの追記に失敗
    #[error("メタデータの追記に失敗: {0}")]
    Write(String),
    /// メタデータの取得に失敗
    #[error("メタデータの取得に失敗: {0}")]
    Query(String),
    /// 内部エラー
    #[error("内部エラー: {0}")]
    Internal(String),
}

impl GatewayError {
    pub(crate) fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        GatewayError::Validation {
            field,
            reason: reason.into(),
        }
    }
}

impl axum::response::IntoResponse for GatewayError {
    fn into_response(self) -> axum::response::Response {
        let (status, body) = match self {
            GatewayError::Unauthorized(_) => (
                StatusCode::UNAUTHORIZED,
                ErrorBody {
                    message: "unauthorized".to_string(),
                    field: None,
                },
            ),
            GatewayError::Validation { field, reason } => (
                StatusCode::BAD_REQUEST,
                ErrorBody {
                    message: reason,
                    field: Some(field.to_string()),
                },
            ),
            GatewayError::Issue(_)
            | GatewayError::Write(_)
            | GatewayError::Query(_)
            | GatewayError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorBody {
                    message: "Internal Server Error".to_string(),
                    field: None,
                },
            ),
        };
        (status, Json(body)).into_response()
    }
}
