//! # VaultGuard 共有型定義
//!
//! Gateway・メタデータログ・クライアント間で共有するデータ構造。
//!
//! ## エンコーディング規則
//! - タイムスタンプ: UNIXエポックからのミリ秒（`u64`）
//! - HTTPボディ: 既存クライアント互換のcamelCaseフィールド名

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// メタデータログのレコード
// ---------------------------------------------------------------------------

/// アップロード1件ごとの所有権レコード。
///
/// 書き込み用署名付きURLの発行直後に追記される（バイト転送の完了前）。
/// そのため、参照先オブジェクトがまだ存在しない、あるいは永久に存在しない
/// 場合がある。一覧取得時の存在確認で整合させる。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    /// レコード識別子
    pub file_id: Uuid,
    /// 所有者（トークンの`sub`）
    pub owner_subject: String,
    /// クライアントが指定したファイル名
    pub display_name: String,
    /// Blobストア上のオブジェクトキー。全レコードで一意。
    pub object_key: String,
    /// アップロード時に宣言されたMIMEタイプ
    pub content_type: String,
    /// 作成時刻（UNIXミリ秒）
    pub created_at: u64,
}

// ---------------------------------------------------------------------------
// POST /upload-url
// ---------------------------------------------------------------------------

/// /upload-url リクエスト。欠けたフィールドは空文字として入力検証で拒否される。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadUrlRequest {
    /// 表示用ファイル名
    #[serde(rename = "fileName", default)]
    pub file_name: String,
    /// コンテンツのMIMEタイプ
    #[serde(rename = "fileType", default)]
    pub file_type: String,
}

/// /upload-url レスポンス。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadUrlResponse {
    /// 署名付きアップロードURL（PUT）
    pub url: String,
    /// 発行されたオブジェクトキー
    pub object_key: String,
    /// URL有効期限（UNIXタイムスタンプ、秒）
    pub expires_at: u64,
}

// ---------------------------------------------------------------------------
// GET /files
// ---------------------------------------------------------------------------

/// /files レスポンスの1要素。存在が確認されたオブジェクトのみ含まれる。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// 表示用ファイル名
    #[serde(rename = "fileName")]
    pub display_name: String,
    /// オブジェクトキー
    #[serde(rename = "s3Key")]
    pub object_key: String,
    /// アップロード要求時刻（UNIXミリ秒）
    #[serde(rename = "uploadTime")]
    pub created_at: u64,
    /// 署名付きダウンロードURL（GET）
    #[serde(rename = "signedUrl")]
    pub url: String,
}

/// エラーレスポンスのボディ。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// クライアント向けメッセージ
    pub message: String,
    /// 不正だったフィールド（入力検証エラーのみ）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}
