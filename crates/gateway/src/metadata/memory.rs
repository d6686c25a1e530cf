//! # プロセス内メタデータログ
//!
//! 再起動で消える。`METADATA_BACKEND=memory` の開発環境とテストで使用する。

use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::RwLock;
use vaultguard_types::FileRecord;

use super::{MetadataError, MetadataLog};

/// プロセス内に保持するメタデータログ。
#[derive(Default)]
pub struct MemoryMetadataLog {
    records: RwLock<Vec<FileRecord>>,
}

impl MemoryMetadataLog {
    /// 空のログを作成する。
    pub fn new() -> Self {
        Self::default()
    }

    /// 保持しているレコード数。
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait::async_trait]
impl MetadataLog for MemoryMetadataLog {
    async fn append(&self, record: FileRecord) -> Result<(), MetadataError> {
        self.records.write().await.push(record);
        Ok(())
    }

    fn list_by_owner<'a>(
        &'a self,
        owner_subject: &'a str,
    ) -> BoxStream<'a, Result<FileRecord, MetadataError>> {
        stream::once(async move {
            let records = self.records.read().await;
            records
                .iter()
                .filter(|record| record.owner_subject == owner_subject)
                .cloned()
                .map(Ok)
                .collect::<Vec<_>>()
        })
        .flat_map(stream::iter)
        .boxed()
    }
}
