//! # メタデータログ
//!
//! アップロードごとの所有権レコード（`FileRecord`）の追記・所有者別取得。
//!
//! ## 実装
//! - `MemoryMetadataLog`: プロセス内（開発・テスト用）
//! - `FileMetadataLog`: JSON Lines形式の追記専用ファイル
//!
//! 更新・削除の操作は持たない。`list_by_owner` の順序は保証しない。

pub mod file;
pub mod memory;

pub use file::FileMetadataLog;
pub use memory::MemoryMetadataLog;

use futures::stream::BoxStream;
use vaultguard_types::FileRecord;

/// メタデータログ操作のエラー型。
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    /// 追記に失敗
    #[error("レコードの追記に失敗: {0}")]
    Write(String),
    /// 取得に失敗
    #[error("レコードの取得に失敗: {0}")]
    Query(String),
}

/// 所有権レコードの追記専用ログ。
#[async_trait::async_trait]
pub trait MetadataLog: Send + Sync {
    /// レコードを1件追記する。
    async fn append(&self, record: FileRecord) -> Result<(), MetadataError>;

    /// 所有者のレコードを逐次返す。
    ///
    /// ストリームは有限で、何度でも呼び直せる。順序は保証しない。
    fn list_by_owner<'a>(
        &'a self,
        owner_subject: &'a str,
    ) -> BoxStream<'a, Result<FileRecord, MetadataError>>;
}
