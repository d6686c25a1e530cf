//! # ファイルメタデータログ
//!
//! 1行1レコードのJSON Lines形式で追記するメタデータログ。
//!
//! - 追記は非同期ミューテックスで直列化し、`sync_data` で永続化してから返す
//! - 末尾が改行で終わっていなければ（書き込み途中のクラッシュ等）、改行を補ってから追記する
//! - 取得はファイルを先頭から1行ずつ読み、所有者で絞り込む
//! - ファイルが無ければ空として扱う
//! - パースできない行（書き込み途中のクラッシュ等）は警告を出して読み飛ばす

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use futures::stream::{self, BoxStream, StreamExt};
use tokio::fs::{File, OpenOptions};
use tokio::io::{
    AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader, Lines,
};
use tokio::sync::Mutex;
use vaultguard_types::FileRecord;

use super::{MetadataError, MetadataLog};

/// JSON Lines形式の追記専用メタデータログ。
pub struct FileMetadataLog {
    /// ログファイルのパス
    path: PathBuf,
    /// 追記の直列化
    write_lock: Mutex<()>,
}

/// `list_by_owner` の走査状態。
enum Scan {
    /// まだファイルを開いていない
    Pending,
    /// 読み取り中（行番号付き）
    Reading(Lines<BufReader<File>>, usize),
    /// 終了
    Done,
}

impl FileMetadataLog {
    /// ログファイルのパスを指定して開く。親ディレクトリが無ければ作成する。
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, MetadataError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                MetadataError::Write(format!(
                    "ディレクトリの作成に失敗 ({}): {e}",
                    parent.display()
                ))
            })?;
        }
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    /// ログファイルのパス。
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// 空のファイル、または最後のバイトが改行なら `true`。
async fn ends_with_newline(file: &mut File) -> std::io::Result<bool> {
    if file.metadata().await?.len() == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::End(-1)).await?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last).await?;
    Ok(last[0] == b'\n')
}

#[async_trait::async_trait]
impl MetadataLog for FileMetadataLog {
    async fn append(&self, record: FileRecord) -> Result<(), MetadataError> {
        let mut line = serde_json::to_vec(&record)
            .map_err(|e| MetadataError::Write(format!("レコードのシリアライズに失敗: {e}")))?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| MetadataError::Write(format!("ログファイルを開けません: {e}")))?;

        let terminated = ends_with_newline(&mut file)
            .await
            .map_err(|e| MetadataError::Write(format!("末尾の確認に失敗: {e}")))?;
        if !terminated {
            tracing::warn!(
                path = %self.path.display(),
                "改行で終わっていない末尾を検出したため、改行を補って追記します"
            );
            line.insert(0, b'\n');
        }

        file.write_all(&line)
            .await
            .map_err(|e| MetadataError::Write(format!("書き込みに失敗: {e}")))?;
        file.sync_data()
            .await
            .map_err(|e| MetadataError::Write(format!("同期に失敗: {e}")))?;
        Ok(())
    }

    fn list_by_owner<'a>(
        &'a self,
        owner_subject: &'a str,
    ) -> BoxStream<'a, Result<FileRecord, MetadataError>> {
        stream::unfold(Scan::Pending, move |mut scan| async move {
            loop {
                scan = match scan {
                    Scan::Pending => match File::open(&self.path).await {
                        Ok(file) => Scan::Reading(BufReader::new(file).lines(), 0),
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
                        Err(e) => {
                            let err =
                                MetadataError::Query(format!("ログファイルを開けません: {e}"));
                            return Some((Err(err), Scan::Done));
                        }
                    },
                    Scan::Reading(mut lines, line_no) => match lines.next_line().await {
                        Ok(Some(line)) => {
                            let line_no = line_no + 1;
                            if line.trim().is_empty() {
                                Scan::Reading(lines, line_no)
                            } else {
                                match serde_json::from_str::<FileRecord>(&line) {
                                    Ok(record) if record.owner_subject == owner_subject => {
                                        return Some((Ok(record), Scan::Reading(lines, line_no)));
                                    }
                                    Ok(_) => Scan::Reading(lines, line_no),
                                    Err(e) => {
                                        tracing::warn!(
                                            path = %self.path.display(),
                                            line_no,
                                            error = %e,
                                            "パースできない行を読み飛ばします"
                                        );
                                        Scan::Reading(lines, line_no)
                                    }
                                }
                            }
                        }
                        Ok(None) => return None,
                        Err(e) => {
                            let err = MetadataError::Query(format!("読み取りに失敗: {e}"));
                            return Some((Err(err), Scan::Done));
                        }
                    },
                    Scan::Done => return None,
                };
            }
        })
        .boxed()
    }
}
