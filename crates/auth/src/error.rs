//! # 認証エラー型
//!
//! トークン検証と鍵解決で発生するエラー。
//! single-flightで複数の待機者に同じ結果を配るため `Clone` を実装する。

/// トークン検証のエラー型。
///
/// 呼び出し側にはすべて「unauthorized」として返す。内部原因はログにのみ残す。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// Authorizationヘッダーが無い、または空
    #[error("トークンがありません")]
    MissingToken,
    /// 3部構成の署名付き構造として解釈できない
    #[error("トークンの形式が不正です: {0}")]
    MalformedToken(String),
    /// 許可リスト外のアルゴリズム（none・対称鍵を含む）
    #[error("サポートされていない署名アルゴリズムです: {0}")]
    UnsupportedAlgorithm(String),
    /// 最新の鍵セットに鍵IDが存在しない
    #[error("署名鍵が見つかりません: {kid}")]
    KeyNotFound {
        /// トークンヘッダーの鍵ID
        kid: String,
    },
    /// 署名が一致しない
    #[error("署名の検証に失敗しました")]
    SignatureInvalid,
    /// exp/iat/nbf による有効期間外
    #[error("トークンの有効期間外です: {0}")]
    ExpiredToken(String),
    /// 発行者が設定値と一致しない
    #[error("トークンの発行者が一致しません: {0}")]
    InvalidIssuer(String),
    /// 鍵セットの取得失敗（ネットワーク、不正なレスポンス）
    #[error("鍵セットの取得に失敗しました: {0}")]
    FetchError(String),
}

impl AuthError {
    /// 構造化ログ用の短い分類名。
    pub fn kind(&self) -> &'static str {
        match self {
            AuthError::MissingToken => "missing_token",
            AuthError::MalformedToken(_) => "malformed_token",
            AuthError::UnsupportedAlgorithm(_) => "unsupported_algorithm",
            AuthError::KeyNotFound { .. } => "key_not_found",
            AuthError::SignatureInvalid => "signature_invalid",
            AuthError::ExpiredToken(_) => "expired_token",
            AuthError::InvalidIssuer(_) => "invalid_issuer",
            AuthError::FetchError(_) => "fetch_error",
        }
    }
}
