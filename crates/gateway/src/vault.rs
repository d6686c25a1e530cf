//! # VaultGateway
//!
//! 利用者向けの2操作（アップロードURL発行・ファイル一覧）を、
//! トークン検証・メタデータログ・署名付きURL発行を組み合わせて実現する。
//!
//! ## メタデータとオブジェクトの整合
//! クライアントはBlobストアへ直接アップロードするため、レコードは
//! オブジェクトの存在より先に追記される。一覧取得時に各レコードの存在を確認し、
//! まだ存在しないものは結果から除外する。ログ自体は追記専用のまま変更しない。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use futures::TryStreamExt;
use vaultguard_auth::{AuthError, TokenVerifier, VerifiedIdentity};
use vaultguard_types::{FileEntry, FileRecord};

use crate::error::GatewayError;
use crate::metadata::MetadataLog;
use crate::storage::{Capability, CapabilityIssuer};

/// 表示名の最大長（バイト）
pub const MAX_DISPLAY_NAME_BYTES: usize = 255;
/// MIMEタイプの最大長（バイト）
pub const MAX_CONTENT_TYPE_BYTES: usize = 127;

/// Gatewayの動作設定。
#[derive(Debug, Clone)]
pub struct VaultSettings {
    /// アップロード用URLの有効期限（秒）
    pub write_url_expiry_secs: u32,
    /// ダウンロード用URLの有効期限（秒）
    pub read_url_expiry_secs: u32,
    /// 一覧取得時に同時に行う存在確認の上限
    pub probe_concurrency: usize,
}

impl Default for VaultSettings {
    fn default() -> Self {
        Self {
            write_url_expiry_secs: 60,
            read_url_expiry_secs: 300,
            probe_concurrency: 16,
        }
    }
}

/// アップロードURL発行の結果。
#[derive(Debug, Clone)]
pub struct UploadGrant {
    /// アップロード用の署名付きURL
    pub capability: Capability,
    /// 追記したレコード
    pub record: FileRecord,
}

/// 1レコードの存在確認の結果。
#[derive(Debug)]
enum ProbeOutcome {
    /// 存在を確認し、ダウンロードURLを発行できた
    Present(FileEntry),
    /// 存在しないことを確認した（アップロード未完了）
    ConfirmedAbsent,
    /// 存在確認自体が失敗した
    CheckFailed,
    /// 存在は確認したがダウンロードURLの発行に失敗した
    ReadIssueFailed,
}

/// プロセス内で単調増加するミリ秒時計。オブジェクトキーの時刻部分に使う。
#[derive(Default)]
struct KeyClock {
    last: AtomicU64,
}

impl KeyClock {
    /// `now` 以上で、これまでに返したどの値よりも大きい値を返す。
    fn next(&self, now: u64) -> u64 {
        let prev = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or(now);
        now.max(prev + 1)
    }
}

/// 表示名を検証する。
fn validate_display_name(name: &str) -> Result<(), GatewayError> {
    const FIELD: &str = "fileName";
    if name.trim().is_empty() {
        return Err(GatewayError::validation(FIELD, "ファイル名が空です"));
    }
    if name.len() > MAX_DISPLAY_NAME_BYTES {
        return Err(GatewayError::validation(
            FIELD,
            format!("ファイル名は{MAX_DISPLAY_NAME_BYTES}バイト以下である必要があります"),
        ));
    }
    if name == "." || name == ".." {
        return Err(GatewayError::validation(FIELD, "ファイル名として使用できません"));
    }
    if name.contains('/') {
        return Err(GatewayError::validation(FIELD, "ファイル名に'/'は使用できません"));
    }
    if name.chars().any(char::is_control) {
        return Err(GatewayError::validation(FIELD, "ファイル名に制御文字は使用できません"));
    }
    Ok(())
}

/// MIMEタイプ（type/subtype）を検証する。
fn validate_content_type(content_type: &str) -> Result<(), GatewayError> {
    const FIELD: &str = "fileType";
    if content_type.is_empty() {
        return Err(GatewayError::validation(FIELD, "MIMEタイプが空です"));
    }
    if content_type.len() > MAX_CONTENT_TYPE_BYTES {
        return Err(GatewayError::validation(
            FIELD,
            format!("MIMEタイプは{MAX_CONTENT_TYPE_BYTES}バイト以下である必要があります"),
        ));
    }
    if content_type
        .chars()
        .any(|c| c.is_whitespace() || c.is_control())
    {
        return Err(GatewayError::validation(FIELD, "MIMEタイプに空白は使用できません"));
    }
    match content_type.split_once('/') {
        Some((kind, subtype)) if !kind.is_empty() && !subtype.is_empty() && !subtype.contains('/') => {
            Ok(())
        }
        _ => Err(GatewayError::validation(
            FIELD,
            "MIMEタイプは type/subtype 形式である必要があります",
        )),
    }
}

/// オブジェクトキー `{subject}/{millis}-{displayName}` を組み立てる。
fn object_key_for(subject: &str, millis: u64, display_name: &str) -> String {
    format!("{subject}/{millis}-{display_name}")
}

fn unix_millis() -> Result<u64, GatewayError> {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| GatewayError::Internal(format!("時刻取得失敗: {e}")))?;
    Ok(elapsed.as_millis() as u64)
}

/// アップロードURL発行とファイル一覧のオーケストレーション。
pub struct VaultGateway {
    /// トークン検証器
    verifier: TokenVerifier,
    /// 所有権レコードのログ
    metadata: Arc<dyn MetadataLog>,
    /// Blobストアの署名付きURL発行
    issuer: Arc<dyn CapabilityIssuer>,
    /// 動作設定
    settings: VaultSettings,
    /// オブジェクトキー用の時計
    clock: KeyClock,
}

impl VaultGateway {
    /// 依存を注入して構築する。
    pub fn new(
        verifier: TokenVerifier,
        metadata: Arc<dyn MetadataLog>,
        issuer: Arc<dyn CapabilityIssuer>,
        settings: VaultSettings,
    ) -> Self {
        Self {
            verifier,
            metadata,
            issuer,
            settings,
            clock: KeyClock::default(),
        }
    }

    /// Authorizationヘッダー値を検証する。失敗の原因はログにのみ残す。
    async fn authenticate(&self, bearer: Option<&str>) -> Result<VerifiedIdentity, GatewayError> {
        let result = match bearer {
            Some(raw) => self.verifier.verify(raw).await,
            None => Err(AuthError::MissingToken),
        };
        let identity = result.and_then(|identity| {
            if identity.subject.contains('/') {
                Err(AuthError::MalformedToken(
                    "subに'/'が含まれています".to_string(),
                ))
            } else {
                Ok(identity)
            }
        });

        identity.map_err(|e| {
            tracing::warn!(cause = e.kind(), error = %e, "リクエストを認証できませんでした");
            GatewayError::Unauthorized(e)
        })
    }

    /// アップロード用の署名付きURLを発行し、所有権レコードを追記する。
    ///
    /// URLの発行に失敗した場合は何も追記しない。
    /// 追記に失敗した場合、発行済みのURLで作られたオブジェクトはレコードを持たず、
    /// 一覧には現れない。
    pub async fn request_upload(
        &self,
        bearer: Option<&str>,
        display_name: &str,
        content_type: &str,
    ) -> Result<UploadGrant, GatewayError> {
        let identity = self.authenticate(bearer).await?;
        validate_display_name(display_name)?;
        validate_content_type(content_type)?;

        let created_at = self.clock.next(unix_millis()?);
        let object_key = object_key_for(&identity.subject, created_at, display_name);

        let capability = self
            .issuer
            .issue_write(&object_key, content_type, self.settings.write_url_expiry_secs)
            .await
            .map_err(|e| {
                tracing::error!(
                    subject = %identity.subject,
                    object_key = %object_key,
                    error = %e,
                    "アップロード用URLの発行に失敗しました"
                );
                GatewayError::Issue(e.to_string())
            })?;

        let record = FileRecord {
            file_id: uuid::Uuid::new_v4(),
            owner_subject: identity.subject.clone(),
            display_name: display_name.to_string(),
            object_key: object_key.clone(),
            content_type: content_type.to_string(),
            created_at,
        };

        self.metadata.append(record.clone()).await.map_err(|e| {
            tracing::error!(
                subject = %identity.subject,
                object_key = %object_key,
                error = %e,
                "メタデータの追記に失敗しました（発行済みURLは参照されません）"
            );
            GatewayError::Write(e.to_string())
        })?;

        tracing::info!(
            subject = %identity.subject,
            object_key = %object_key,
            file_id = %record.file_id,
            "アップロード用URLを発行しました"
        );

        Ok(UploadGrant { capability, record })
    }

    /// 存在が確認できたファイルの一覧を、作成時刻の新しい順に返す。
    ///
    /// 存在確認はレコードごとに並行して行う（同時実行数は `probe_concurrency`）。
    /// 存在しないレコード・確認に失敗したレコードは結果から除外し、操作全体は失敗させない。
    pub async fn list_files(&self, bearer: Option<&str>) -> Result<Vec<FileEntry>, GatewayError> {
        let identity = self.authenticate(bearer).await?;
        let subject = identity.subject.as_str();

        let outcomes: Vec<ProbeOutcome> = self
            .metadata
            .list_by_owner(subject)
            .map_err(|e| {
                tracing::error!(subject, error = %e, "メタデータの取得に失敗しました");
                GatewayError::Query(e.to_string())
            })
            .map_ok(|record| async move { Ok::<_, GatewayError>(self.reconcile(record).await) })
            .try_buffer_unordered(self.settings.probe_concurrency.max(1))
            .try_collect()
            .await?;

        let (mut absent, mut check_failed, mut read_issue_failed) = (0usize, 0usize, 0usize);
        let mut entries = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            match outcome {
                ProbeOutcome::Present(entry) => entries.push(entry),
                ProbeOutcome::ConfirmedAbsent => absent += 1,
                ProbeOutcome::CheckFailed => check_failed += 1,
                ProbeOutcome::ReadIssueFailed => read_issue_failed += 1,
            }
        }

        entries.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.object_key.cmp(&b.object_key))
        });

        tracing::info!(
            subject,
            present = entries.len(),
            absent,
            check_failed,
            read_issue_failed,
            "ファイル一覧を返却します"
        );

        Ok(entries)
    }

    /// 1レコードの存在を確認し、存在すればダウンロードURLを付けて返す。
    async fn reconcile(&self, record: FileRecord) -> ProbeOutcome {
        match self.issuer.exists(&record.object_key).await {
            Ok(false) => {
                tracing::debug!(
                    object_key = %record.object_key,
                    "オブジェクトが未作成のため一覧から除外します"
                );
                ProbeOutcome::ConfirmedAbsent
            }
            Err(e) => {
                tracing::warn!(
                    object_key = %record.object_key,
                    error = %e,
                    "存在確認に失敗したため一覧から除外します"
                );
                ProbeOutcome::CheckFailed
            }
            Ok(true) => match self
                .issuer
                .issue_read(&record.object_key, self.settings.read_url_expiry_secs)
                .await
            {
                Ok(capability) => ProbeOutcome::Present(FileEntry {
                    display_name: record.display_name,
                    object_key: record.object_key,
                    created_at: record.created_at,
                    url: capability.url,
                }),
                Err(e) => {
                    tracing::warn!(
                        object_key = %record.object_key,
                        error = %e,
                        "ダウンロード用URLの発行に失敗したため一覧から除外します"
                    );
                    ProbeOutcome::ReadIssueFailed
                }
            },
        }
    }
}
