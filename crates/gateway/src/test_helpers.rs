//! テスト用のモックBlobストア・メタデータログと、`VaultGateway` の組み立て。

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::{self, BoxStream, StreamExt};
use vaultguard_auth::testutil::{StaticKeySource, TestSigner};
use vaultguard_auth::{KeyRing, TokenVerifier};
use vaultguard_types::FileRecord;

use crate::metadata::{MemoryMetadataLog, MetadataError, MetadataLog};
use crate::storage::{Capability, CapabilityIssuer, CapabilityMethod, StorageError};
use crate::vault::{VaultGateway, VaultSettings};

/// プロセス内のモックBlobストア。
///
/// `put_object` でクライアントのアップロード完了を再現する。
/// キーごとの存在確認失敗・ダウンロードURL発行失敗、アップロードURL発行失敗を注入できる。
#[derive(Default)]
pub struct MockBlobStore {
    objects: Mutex<HashSet<String>>,
    failing_checks: Mutex<HashSet<String>>,
    failing_reads: Mutex<HashSet<String>>,
    fail_writes: AtomicBool,
    probe_delay: Mutex<Option<Duration>>,
    write_issued: AtomicUsize,
    exists_calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl MockBlobStore {
    /// オブジェクトのアップロード完了を再現する。
    pub fn put_object(&self, key: &str) {
        self.objects.lock().unwrap().insert(key.to_string());
    }

    /// 指定キーの存在確認を失敗させる。
    pub fn fail_checks_for(&self, key: &str) {
        self.failing_checks.lock().unwrap().insert(key.to_string());
    }

    /// 指定キーのダウンロードURL発行を失敗させる。
    pub fn fail_reads_for(&self, key: &str) {
        self.failing_reads.lock().unwrap().insert(key.to_string());
    }

    /// 以降のアップロードURL発行を失敗させる。
    pub fn fail_write_issuance(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    /// 存在確認ごとに遅延を入れる。
    pub fn set_probe_delay(&self, delay: Duration) {
        *self.probe_delay.lock().unwrap() = Some(delay);
    }

    /// 発行したアップロードURLの数。
    pub fn write_issued(&self) -> usize {
        self.write_issued.load(Ordering::SeqCst)
    }

    /// 存在確認の呼び出し回数。
    pub fn exists_calls(&self) -> usize {
        self.exists_calls.load(Ordering::SeqCst)
    }

    /// 存在確認の同時実行数の最大値。
    pub fn peak_concurrent_probes(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn url(method: &str, key: &str, expiry_secs: u32) -> String {
        format!("mock://blob/{key}?op={method}&expires={expiry_secs}")
    }
}

#[async_trait::async_trait]
impl CapabilityIssuer for MockBlobStore {
    async fn issue_write(
        &self,
        object_key: &str,
        _content_type: &str,
        expiry_secs: u32,
    ) -> Result<Capability, StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Issue("模擬的な発行失敗".to_string()));
        }
        self.write_issued.fetch_add(1, Ordering::SeqCst);
        Ok(Capability::expiring(
            CapabilityMethod::Put,
            object_key,
            Self::url("PUT", object_key, expiry_secs),
            expiry_secs,
        ))
    }

    async fn issue_read(
        &self,
        object_key: &str,
        expiry_secs: u32,
    ) -> Result<Capability, StorageError> {
        if self.failing_reads.lock().unwrap().contains(object_key) {
            return Err(StorageError::Issue("模擬的な発行失敗".to_string()));
        }
        Ok(Capability::expiring(
            CapabilityMethod::Get,
            object_key,
            Self::url("GET", object_key, expiry_secs),
            expiry_secs,
        ))
    }

    async fn exists(&self, object_key: &str) -> Result<bool, StorageError> {
        self.exists_calls.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(current, Ordering::SeqCst);

        let delay = *self.probe_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let result = if self.failing_checks.lock().unwrap().contains(object_key) {
            Err(StorageError::Check("模擬的なHEAD失敗".to_string()))
        } else {
            Ok(self.objects.lock().unwrap().contains(object_key))
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// 追記も取得も常に失敗するメタデータログ。
pub struct FailingMetadataLog;

#[async_trait::async_trait]
impl MetadataLog for FailingMetadataLog {
    async fn append(&self, _record: FileRecord) -> Result<(), MetadataError> {
        Err(MetadataError::Write("模擬的な追記失敗".to_string()))
    }

    fn list_by_owner<'a>(
        &'a self,
        _owner_subject: &'a str,
    ) -> BoxStream<'a, Result<FileRecord, MetadataError>> {
        stream::once(async { Err(MetadataError::Query("模擬的な取得失敗".to_string())) }).boxed()
    }
}

/// テスト用に組み立てた `VaultGateway` と、その依存。
pub struct TestVault {
    pub vault: VaultGateway,
    pub signer: TestSigner,
    pub blobs: Arc<MockBlobStore>,
    pub metadata: Arc<MemoryMetadataLog>,
    /// `vault` と同じ鍵キャッシュを共有する検証器
    pub verifier: TokenVerifier,
}

/// 1つの署名鍵を信頼する `VaultGateway` をモック依存で組み立てる。
pub fn test_vault(settings: VaultSettings) -> TestVault {
    let signer = TestSigner::new("test-kid");
    let source = Arc::new(StaticKeySource::new(vec![signer.signing_key()]));
    let verifier = TokenVerifier::new(Arc::new(KeyRing::new(source)));
    let blobs = Arc::new(MockBlobStore::default());
    let metadata = Arc::new(MemoryMetadataLog::new());

    let vault = VaultGateway::new(
        verifier.clone(),
        metadata.clone(),
        blobs.clone(),
        settings,
    );

    TestVault {
        vault,
        signer,
        blobs,
        metadata,
        verifier,
    }
}
