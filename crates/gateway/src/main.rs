//! # VaultGuard Gateway
//!
//! 利用者ごとのファイル保管庫へのアクセスを仲介するGateway。
//! ファイル本体は扱わず、Blobストアへの署名付きURLだけを発行する。
//!
//! ## 役割
//! - Bearerトークン（RS256署名、JWKSで公開されたRSA鍵）による利用者の識別
//! - アップロード用署名付きURLの発行と所有権レコードの追記
//! - 所有権レコードとBlobストアの実体を突き合わせたファイル一覧
//!
//! ## API エンドポイント
//! - `POST /upload-url`: アップロード用署名付きURL発行
//! - `GET /files`: ファイル一覧（ダウンロード用署名付きURL付き）

mod config;
mod endpoints;
mod error;
mod metadata;
mod storage;
mod vault;

#[cfg(test)]
mod test_helpers;

use std::sync::Arc;

use vaultguard_auth::{HttpKeySetSource, KeyRing, TokenVerifier};

use crate::config::{GatewayConfig, GatewayState, MetadataBackend};
use crate::metadata::{FileMetadataLog, MemoryMetadataLog, MetadataLog};
use crate::storage::CapabilityIssuer;
use crate::vault::VaultGateway;

// ---------------------------------------------------------------------------
// 依存の組み立て
// ---------------------------------------------------------------------------

/// 設定からトークン検証器を構築し、鍵キャッシュを事前に温める。
async fn build_verifier(config: &GatewayConfig) -> anyhow::Result<TokenVerifier> {
    let source = HttpKeySetSource::new(&config.jwks_uri, config.jwks_fetch_timeout)?;
    let mut key_ring = KeyRing::new(Arc::new(source));
    if let Some(ttl) = config.key_cache_ttl {
        key_ring = key_ring.with_ttl(ttl);
    }

    // 起動時に取得できなくても、最初のリクエストで再取得する
    match key_ring.warm_up().await {
        Ok(count) => tracing::info!(keys = count, jwks_uri = %config.jwks_uri, "署名鍵を取得しました"),
        Err(e) => tracing::warn!(
            jwks_uri = %config.jwks_uri,
            error = %e,
            "起動時の署名鍵取得に失敗しました。初回リクエスト時に再取得します"
        ),
    }

    let mut verifier =
        TokenVerifier::new(Arc::new(key_ring)).with_clock_skew(config.clock_skew);
    if let Some(issuer) = &config.token_issuer {
        verifier = verifier.with_issuer(issuer.clone());
    }
    Ok(verifier)
}

/// 設定に従ってメタデータログを開く。
async fn build_metadata(config: &GatewayConfig) -> anyhow::Result<Arc<dyn MetadataLog>> {
    match config.metadata_backend {
        MetadataBackend::File => {
            let log = FileMetadataLog::open(&config.metadata_log_path).await?;
            tracing::info!(path = %log.path().display(), "ファイルメタデータログを使用します");
            Ok(Arc::new(log))
        }
        MetadataBackend::Memory => {
            tracing::warn!("METADATA_BACKEND=memory: レコードは再起動で失われます（開発環境用）");
            Ok(Arc::new(MemoryMetadataLog::new()))
        }
    }
}

/// 設定からBlobストアの署名付きURL発行を構築する。
#[cfg(feature = "vendor-aws")]
fn build_issuer(config: &GatewayConfig) -> anyhow::Result<Arc<dyn CapabilityIssuer>> {
    Ok(Arc::new(storage::S3CapabilityIssuer::from_settings(
        &config.s3,
    )?))
}

#[cfg(not(feature = "vendor-aws"))]
fn build_issuer(_config: &GatewayConfig) -> anyhow::Result<Arc<dyn CapabilityIssuer>> {
    anyhow::bail!("Blobストア実装が有効になっていません（vendor-aws featureが必要です）")
}

// ---------------------------------------------------------------------------
// エントリポイント
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = GatewayConfig::from_env()?;

    let verifier = build_verifier(&config).await?;
    let metadata = build_metadata(&config).await?;
    let issuer = build_issuer(&config)?;

    let state = Arc::new(GatewayState {
        vault: VaultGateway::new(verifier, metadata, issuer, config.vault_settings()),
    });

    let app = endpoints::router(state);

    tracing::info!(
        probe_concurrency = config.probe_concurrency,
        write_url_expiry_secs = config.write_url_expiry_secs,
        read_url_expiry_secs = config.read_url_expiry_secs,
        "Gatewayを {} で起動します",
        config.listen_addr
    );

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
