//! # JWKS鍵セット
//!
//! IDプロバイダの鍵セットエンドポイントから公開鍵を取得し、検証に使える形に変換する。
//!
//! 利用可能なエントリは `kty = "RSA"` で、`alg` が指定されていれば `RS256` のもののみ。
//! 暗号化用の鍵（`use = "enc"`）などは読み飛ばす。

use std::fmt;
use std::time::{Duration, Instant};

use jsonwebtoken::DecodingKey;
use serde::Deserialize;

use crate::error::AuthError;

/// 鍵IDで識別される公開署名鍵。
///
/// `KeyRing` に格納された後は変更されない。
#[derive(Clone)]
pub struct SigningKey {
    /// 鍵ID（JWKの`kid`）
    pub key_id: String,
    /// RSA公開鍵（検証用）
    pub decoding_key: DecodingKey,
    /// 鍵セットを取得した時刻
    pub fetched_at: Instant,
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("key_id", &self.key_id)
            .field("fetched_at", &self.fetched_at)
            .finish_non_exhaustive()
    }
}

impl SigningKey {
    /// Base64url形式のRSA公開鍵成分（`n`, `e`）から構築する。
    pub fn from_rsa_components(
        key_id: impl Into<String>,
        modulus: &str,
        exponent: &str,
        fetched_at: Instant,
    ) -> Result<Self, AuthError> {
        let key_id = key_id.into();
        let decoding_key = DecodingKey::from_rsa_components(modulus, exponent).map_err(|e| {
            AuthError::FetchError(format!("RSA公開鍵として不正 (kid={key_id}): {e}"))
        })?;
        Ok(Self {
            key_id,
            decoding_key,
            fetched_at,
        })
    }
}

/// JWKSドキュメント。
#[derive(Debug, Deserialize)]
struct JwkSet {
    keys: Vec<Jwk>,
}

/// JWKの1エントリ。他形式も読めるよう、使わないフィールドは無視する。
#[derive(Debug, Deserialize)]
struct Jwk {
    kty: String,
    #[serde(default)]
    kid: Option<String>,
    #[serde(default)]
    n: Option<String>,
    #[serde(default)]
    e: Option<String>,
    #[serde(default)]
    alg: Option<String>,
    #[serde(rename = "use", default)]
    key_use: Option<String>,
}

impl Jwk {
    /// 検証に使える鍵へ変換する。使えない場合は理由を返す。
    fn into_signing_key(self, fetched_at: Instant) -> Result<SigningKey, String> {
        if self.kty != "RSA" {
            return Err(format!("対象外の鍵形式: kty={}", self.kty));
        }
        if let Some(alg) = self.alg.as_deref().filter(|alg| *alg != "RS256") {
            return Err(format!("対象外のalg: {alg}"));
        }
        if let Some(key_use) = self.key_use.as_deref().filter(|u| *u != "sig") {
            return Err(format!("署名用ではない鍵: use={key_use}"));
        }
        let key_id = self
            .kid
            .filter(|kid| !kid.is_empty())
            .ok_or_else(|| "kidがありません".to_string())?;
        let (Some(n), Some(e)) = (self.n, self.e) else {
            return Err(format!("n/eがありません (kid={key_id})"));
        };
        if n.is_empty() || e.is_empty() {
            return Err(format!("n/eが空です (kid={key_id})"));
        }

        SigningKey::from_rsa_components(key_id, &n, &e, fetched_at).map_err(|e| e.to_string())
    }
}

/// JWKSドキュメントをパースし、利用可能な鍵の一覧を返す。
///
/// ドキュメント全体が不正な場合は `FetchError`。個々の利用できないエントリは読み飛ばす。
pub fn parse_key_set(body: &[u8], fetched_at: Instant) -> Result<Vec<SigningKey>, AuthError> {
    let set: JwkSet = serde_json::from_slice(body)
        .map_err(|e| AuthError::FetchError(format!("JWKSのパースに失敗: {e}")))?;

    let mut keys = Vec::with_capacity(set.keys.len());
    for jwk in set.keys {
        match jwk.into_signing_key(fetched_at) {
            Ok(key) => keys.push(key),
            Err(reason) => tracing::debug!(%reason, "JWKエントリを読み飛ばします"),
        }
    }
    Ok(keys)
}

/// 鍵セットの取得元。
///
/// 本番ではHTTP経由のJWKSエンドポイント、テストでは静的な鍵一覧を差し込む。
#[async_trait::async_trait]
pub trait KeySetSource: Send + Sync {
    /// 現在公開されている鍵セット全体を取得する。
    async fn fetch(&self) -> Result<Vec<SigningKey>, AuthError>;
}

/// HTTP経由でJWKSエンドポイントから鍵セットを取得するソース。
pub struct HttpKeySetSource {
    /// HTTPクライアント（タイムアウト設定済み）
    client: reqwest::Client,
    /// JWKSエンドポイントURL
    jwks_uri: String,
}

impl HttpKeySetSource {
    /// 新しいHttpKeySetSourceを作成する。
    ///
    /// # 引数
    /// - `jwks_uri`: 鍵セットのURL（例: `https://cognito-idp.<region>.amazonaws.com/<pool>/.well-known/jwks.json`）
    /// - `timeout`: 1回の取得に許す時間
    pub fn new(jwks_uri: impl Into<String>, timeout: Duration) -> Result<Self, AuthError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AuthError::FetchError(format!("HTTPクライアントの構築に失敗: {e}")))?;
        Ok(Self {
            client,
            jwks_uri: jwks_uri.into(),
        })
    }
}

#[async_trait::async_trait]
impl KeySetSource for HttpKeySetSource {
    async fn fetch(&self) -> Result<Vec<SigningKey>, AuthError> {
        let response = self
            .client
            .get(&self.jwks_uri)
            .send()
            .await
            .map_err(|e| AuthError::FetchError(format!("HTTP送信失敗: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuthError::FetchError(format!(
                "JWKSエンドポイントがエラーを返しました: HTTP {status}"
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| AuthError::FetchError(format!("レスポンス読み取り失敗: {e}")))?;

        parse_key_set(&body, Instant::now())
    }
}
