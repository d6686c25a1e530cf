//! # Gateway設定・共有状態
//!
//! 環境変数からの設定読み込みとGatewayの共有状態の定義。

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;

use crate::vault::{VaultGateway, VaultSettings};

/// Gatewayの共有状態。
pub struct GatewayState {
    /// アップロードURL発行・ファイル一覧のオーケストレーション
    pub vault: VaultGateway,
}

/// メタデータログの保存先。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataBackend {
    /// JSON Linesファイル（既定）
    File,
    /// プロセス内（再起動で消える）
    Memory,
}

impl FromStr for MetadataBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "file" => Ok(MetadataBackend::File),
            "memory" => Ok(MetadataBackend::Memory),
            other => anyhow::bail!("METADATA_BACKENDは file または memory です: {other}"),
        }
    }
}

/// S3互換ストレージの接続設定。
#[derive(Debug, Clone)]
pub struct S3Settings {
    /// 内部通信用エンドポイント
    pub endpoint: String,
    /// アクセスキー
    pub access_key: String,
    /// シークレットキー
    pub secret_key: String,
    /// バケット名
    pub bucket: String,
    /// リージョン（未指定ならエンドポイントから推定）
    pub region: Option<String>,
    /// クライアント向けエンドポイント（署名付きURLのホスト）
    pub public_endpoint: Option<String>,
}

/// Gateway設定。
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// 公開鍵セット（JWKS）のURL
    pub jwks_uri: String,
    /// 受け入れる `iss`（未指定なら検証しない）
    pub token_issuer: Option<String>,
    /// 時刻検証の許容誤差
    pub clock_skew: Duration,
    /// 鍵キャッシュの有効期間（未指定なら失効しない）
    pub key_cache_ttl: Option<Duration>,
    /// 公開鍵セット取得のタイムアウト
    pub jwks_fetch_timeout: Duration,
    /// アップロード用URLの有効期限（秒）
    pub write_url_expiry_secs: u32,
    /// ダウンロード用URLの有効期限（秒）
    pub read_url_expiry_secs: u32,
    /// 存在確認の同時実行数
    pub probe_concurrency: usize,
    /// メタデータログの保存先
    pub metadata_backend: MetadataBackend,
    /// メタデータログのファイルパス（`File` の場合）
    pub metadata_log_path: PathBuf,
    /// 待ち受けアドレス
    pub listen_addr: SocketAddr,
    /// S3互換ストレージ
    pub s3: S3Settings,
}

impl GatewayConfig {
    /// 環境変数から読み込む。
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// 任意の変数参照関数から読み込む。空文字の値は未設定として扱う。
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let jwks_uri = get("JWKS_URI").context("JWKS_URIが未設定です")?;
        let probe_concurrency: usize = parse_or(&get, "PROBE_CONCURRENCY", 16)?;
        if probe_concurrency == 0 {
            anyhow::bail!("PROBE_CONCURRENCYは1以上である必要があります");
        }

        Ok(Self {
            jwks_uri,
            token_issuer: get("TOKEN_ISSUER"),
            clock_skew: Duration::from_secs(parse_or(&get, "CLOCK_SKEW_SECS", 60)?),
            key_cache_ttl: get("KEY_CACHE_TTL_SECS")
                .map(|v| parse_value::<u64>("KEY_CACHE_TTL_SECS", &v))
                .transpose()?
                .map(Duration::from_secs),
            jwks_fetch_timeout: Duration::from_secs(parse_or(&get, "JWKS_FETCH_TIMEOUT_SECS", 5)?),
            write_url_expiry_secs: parse_or(&get, "WRITE_URL_EXPIRY_SECS", 60)?,
            read_url_expiry_secs: parse_or(&get, "READ_URL_EXPIRY_SECS", 300)?,
            probe_concurrency,
            metadata_backend: parse_or(&get, "METADATA_BACKEND", MetadataBackend::File)?,
            metadata_log_path: get("METADATA_LOG_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("data/file-records.jsonl")),
            listen_addr: parse_or(
                &get,
                "LISTEN_ADDR",
                SocketAddr::from(([0, 0, 0, 0], 3000)),
            )?,
            s3: S3Settings {
                endpoint: get("S3_ENDPOINT")
                    .unwrap_or_else(|| "http://localhost:9000".to_string()),
                access_key: get("S3_ACCESS_KEY").unwrap_or_else(|| "minioadmin".to_string()),
                secret_key: get("S3_SECRET_KEY").unwrap_or_else(|| "minioadmin".to_string()),
                bucket: get("S3_BUCKET").unwrap_or_else(|| "vaultguard-files".to_string()),
                region: get("S3_REGION"),
                public_endpoint: get("S3_PUBLIC_ENDPOINT"),
            },
        })
    }

    /// オーケストレーション層の設定を取り出す。
    pub fn vault_settings(&self) -> VaultSettings {
        VaultSettings {
            write_url_expiry_secs: self.write_url_expiry_secs,
            read_url_expiry_secs: self.read_url_expiry_secs,
            probe_concurrency: self.probe_concurrency,
        }
    }
}

fn parse_value<T>(name: &str, value: &str) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|e| anyhow::anyhow!("{name}の値が不正です ({value}): {e}"))
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(name) {
        Some(value) => parse_value(name, &value),
        None => Ok(default),
    }
}
