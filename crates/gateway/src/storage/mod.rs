//! # Blobストアの署名付きURL発行
//!
//! Blobストアが持つ署名付きURL（委任アクセス）と存在確認の抽象インターフェース。
//! S3互換ストレージ実装は `s3` サブモジュールを参照。
//!
//! ローカル状態は持たない。全操作はBlobストアの機能への委譲である。

#[cfg(feature = "vendor-aws")]
pub mod s3;

#[cfg(feature = "vendor-aws")]
pub use s3::S3CapabilityIssuer;

use std::time::{SystemTime, UNIX_EPOCH};

/// 署名付きURLが許可する操作。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityMethod {
    /// アップロード
    Put,
    /// ダウンロード
    Get,
}

/// 1つのオブジェクトキーに対する1操作だけを許可する、期限付きの署名付きURL。
/// 永続化しない。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capability {
    /// 許可する操作
    pub method: CapabilityMethod,
    /// 対象のオブジェクトキー
    pub object_key: String,
    /// 署名付きURL
    pub url: String,
    /// 有効期限（UNIXタイムスタンプ、秒）
    pub expires_at: u64,
}

impl Capability {
    /// 現在時刻から `expiry_secs` 秒後に失効する署名付きURLとして構築する。
    pub fn expiring(
        method: CapabilityMethod,
        object_key: &str,
        url: String,
        expiry_secs: u32,
    ) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Self {
            method,
            object_key: object_key.to_string(),
            url,
            expires_at: now + u64::from(expiry_secs),
        }
    }
}

/// Blobストア操作のエラー型。
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// 署名付きURLの発行に失敗
    #[error("署名付きURLの発行に失敗: {0}")]
    Issue(String),
    /// 存在確認に失敗（「存在しない」とは区別する）
    #[error("存在確認に失敗: {0}")]
    Check(String),
}

/// 署名付きURL発行と存在確認の抽象インターフェース。
///
/// `exists` は「存在しないことを確認した」(`Ok(false)`) と
/// 「確認自体が失敗した」(`Err(StorageError::Check)`) を必ず区別する。
#[async_trait::async_trait]
pub trait CapabilityIssuer: Send + Sync {
    /// アップロード用（PUT）の署名付きURLを発行する。
    async fn issue_write(
        &self,
        object_key: &str,
        content_type: &str,
        expiry_secs: u32,
    ) -> Result<Capability, StorageError>;

    /// ダウンロード用（GET）の署名付きURLを発行する。
    async fn issue_read(&self, object_key: &str, expiry_secs: u32)
        -> Result<Capability, StorageError>;

    /// オブジェクトの存在を軽量に確認する（本体は読まない）。
    async fn exists(&self, object_key: &str) -> Result<bool, StorageError>;
}
