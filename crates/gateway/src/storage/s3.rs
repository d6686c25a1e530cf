//! # S3互換 Blobストア実装
//!
//! AWS S3, MinIO, Cloudflare R2 等のS3互換APIを使用する署名付きURL発行・存在確認。

use super::{Capability, CapabilityIssuer, CapabilityMethod, StorageError};
use crate::config::S3Settings;

/// S3互換ストレージによる署名付きURL発行の実装。
pub struct S3CapabilityIssuer {
    /// 内部通信用バケット（存在確認に使用）
    bucket_internal: s3::Bucket,
    /// クライアント向けバケット（署名付きURL生成用）。
    /// Docker内部ホスト名と外部ホスト名が異なる場合に使用。
    /// Noneの場合はbucket_internalを使用する。
    bucket_public: Option<s3::Bucket>,
}

impl S3CapabilityIssuer {
    /// S3互換バケットから構築する。
    pub fn new(bucket_internal: s3::Bucket, bucket_public: Option<s3::Bucket>) -> Self {
        Self {
            bucket_internal,
            bucket_public,
        }
    }

    /// エンドポイントを指定してS3互換バケットを初期化する。
    fn init_bucket(
        endpoint: &str,
        region: Option<&str>,
        access_key: &str,
        secret_key: &str,
        bucket_name: &str,
    ) -> anyhow::Result<s3::Bucket> {
        // 未指定ならAWSエンドポイント（s3.REGION.amazonaws.com）から推定し、
        // 非AWSエンドポイントではus-east-1を使う。
        let region = s3::Region::Custom {
            region: region
                .map(str::to_string)
                .unwrap_or_else(|| detect_region(endpoint)),
            endpoint: endpoint.to_string(),
        };

        let credentials = s3::creds::Credentials::new(
            Some(access_key),
            Some(secret_key),
            None,
            None,
            None,
        )?;

        let bucket = s3::Bucket::new(bucket_name, region, credentials)?.with_path_style();

        Ok(*bucket)
    }

    /// 接続設定から構築する。
    pub fn from_settings(settings: &S3Settings) -> anyhow::Result<Self> {
        let init = |endpoint: &str| {
            Self::init_bucket(
                endpoint,
                settings.region.as_deref(),
                &settings.access_key,
                &settings.secret_key,
                &settings.bucket,
            )
        };

        let bucket_internal = init(&settings.endpoint)?;
        let bucket_public = settings
            .public_endpoint
            .as_deref()
            .map(|public_ep| {
                tracing::info!(
                    s3_public_endpoint = %public_ep,
                    "クライアント向けS3エンドポイントを設定"
                );
                init(public_ep)
            })
            .transpose()?;

        tracing::info!(
            s3_endpoint = %settings.endpoint,
            bucket = %settings.bucket,
            "S3互換ストレージを設定しました"
        );
        Ok(Self::new(bucket_internal, bucket_public))
    }

    fn public_bucket(&self) -> &s3::Bucket {
        self.bucket_public.as_ref().unwrap_or(&self.bucket_internal)
    }
}

/// `s3.<region>.amazonaws.com` 形式のエンドポイントからリージョンを取り出す。
fn detect_region(endpoint: &str) -> String {
    endpoint
        .find("s3.")
        .and_then(|start| {
            let rest = &endpoint[start + 3..];
            rest.find(".amazonaws.com").map(|end| rest[..end].to_string())
        })
        .filter(|region| !region.is_empty())
        .unwrap_or_else(|| "us-east-1".to_string())
}

#[async_trait::async_trait]
impl CapabilityIssuer for S3CapabilityIssuer {
    async fn issue_write(
        &self,
        object_key: &str,
        content_type: &str,
        expiry_secs: u32,
    ) -> Result<Capability, StorageError> {
        // Content-Typeを署名に含める。クライアントは同じContent-TypeでPUTする必要がある。
        let content_type = http::HeaderValue::from_str(content_type)
            .map_err(|e| StorageError::Issue(format!("Content-Typeが不正です: {e}")))?;
        let mut headers = http::HeaderMap::new();
        headers.insert(http::header::CONTENT_TYPE, content_type);

        tracing::debug!(object_key, "アップロード用URLを発行します");
        let url = self
            .public_bucket()
            .presign_put(object_key, expiry_secs, Some(headers), None)
            .await
            .map_err(|e| StorageError::Issue(format!("署名付きアップロードURL生成失敗: {e}")))?;

        Ok(Capability::expiring(
            CapabilityMethod::Put,
            object_key,
            url,
            expiry_secs,
        ))
    }

    async fn issue_read(
        &self,
        object_key: &str,
        expiry_secs: u32,
    ) -> Result<Capability, StorageError> {
        let url = self
            .public_bucket()
            .presign_get(object_key, expiry_secs, None)
            .await
            .map_err(|e| StorageError::Issue(format!("署名付きダウンロードURL生成失敗: {e}")))?;

        Ok(Capability::expiring(
            CapabilityMethod::Get,
            object_key,
            url,
            expiry_secs,
        ))
    }

    async fn exists(&self, object_key: &str) -> Result<bool, StorageError> {
        match self.bucket_internal.head_object(object_key).await {
            Ok((_, status)) if (200..300).contains(&status) => Ok(true),
            Ok((_, 404)) => Ok(false),
            Ok((_, status)) => Err(StorageError::Check(format!(
                "HEADがHTTP {status}を返しました"
            ))),
            Err(e) => Err(StorageError::Check(format!("HEAD送信失敗: {e}"))),
        }
    }
}
