//! # 署名鍵キャッシュ
//!
//! 鍵IDをキーとするプロセス内の公開鍵キャッシュ。
//!
//! ## 並行性
//! - キャッシュヒットは読み取りロックのみで返す（ネットワークアクセスなし）
//! - 同じ鍵IDへの同時ミスは1回の鍵セット取得にまとめ、全待機者に同じ結果を返す
//! - ネットワーク取得中に保持するロックは無い。取得中フライトの登録表を守る
//!   ミューテックスは登録・削除の間だけ保持する
//! - 取得失敗はキャッシュに残さない。次の呼び出しで再取得される
//! - 取得に成功しても見つからなかった鍵IDは短時間だけ記録し、その間は再取得しない
//! - 呼び出し側のfutureが途中で破棄されても、完了したフライトは登録表に残らない

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{OnceCell, RwLock};

use crate::error::AuthError;
use crate::jwks::{KeySetSource, SigningKey};

/// 1回の鍵セット取得（フライト）の結果。
type FlightResult = Result<Arc<SigningKey>, AuthError>;

type FlightTable = Mutex<HashMap<String, Arc<OnceCell<FlightResult>>>>;

/// 未知の鍵IDを再取得せずに拒否する期間の既定値。
pub const DEFAULT_MISS_COOLDOWN: Duration = Duration::from_secs(5);

/// 登録したフライトを外すガード。
///
/// `resolve` のfutureが待機中に破棄された場合も `Drop` で実行される。
/// 未完了のフライトは残す（残った待機者か、次の呼び出しが引き継ぐ）。
struct FlightGuard<'a> {
    table: &'a FlightTable,
    kid: &'a str,
    flight: Arc<OnceCell<FlightResult>>,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if !self.flight.initialized() {
            return;
        }
        let mut flights = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        if flights
            .get(self.kid)
            .is_some_and(|registered| Arc::ptr_eq(registered, &self.flight))
        {
            flights.remove(self.kid);
        }
    }
}

/// 直近に取得に成功した鍵セット。
#[derive(Default)]
struct CachedKeys {
    /// 鍵ID → 鍵
    keys: HashMap<String, Arc<SigningKey>>,
    /// 最後に取得に成功した時刻
    refreshed_at: Option<Instant>,
    /// 取得後も見つからなかった鍵ID → 記録した時刻
    misses: HashMap<String, Instant>,
}

/// 公開署名鍵のキャッシュ。
///
/// 鍵セット全体の取得に成功するたびに内容を置き換える。
/// プロバイダはローテーション中に新旧両方の鍵を公開するため、TTLは必須ではない。
/// TTLを設定した場合、期限切れの鍵は再取得の対象になるが、
/// 再取得に失敗したときは最後に取得できた鍵をそのまま使う。
pub struct KeyRing {
    /// 鍵セットの取得元
    source: Arc<dyn KeySetSource>,
    /// キャッシュ本体
    cached: RwLock<CachedKeys>,
    /// 取得中フライトの登録表（鍵ID → 共有結果）。awaitをまたいで保持しない
    in_flight: FlightTable,
    /// 鍵の有効期間（Noneなら無期限）
    ttl: Option<Duration>,
    /// 未知の鍵IDを再取得せずに拒否する期間
    miss_cooldown: Duration,
}

impl KeyRing {
    /// 空のキャッシュを作成する。最初の解決時に鍵セットを取得する。
    pub fn new(source: Arc<dyn KeySetSource>) -> Self {
        Self {
            source,
            cached: RwLock::new(CachedKeys::default()),
            in_flight: Mutex::new(HashMap::new()),
            ttl: None,
            miss_cooldown: DEFAULT_MISS_COOLDOWN,
        }
    }

    /// 未知の鍵IDを再取得せずに拒否する期間を設定する。`Duration::ZERO` で無効。
    pub fn with_miss_cooldown(mut self, cooldown: Duration) -> Self {
        self.miss_cooldown = cooldown;
        self
    }

    /// キャッシュした鍵の有効期間を設定する。
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// 起動時に鍵セットを先読みする。取得できた鍵の数を返す。
    pub async fn warm_up(&self) -> Result<usize, AuthError> {
        let fetched = self.source.fetch().await?;
        let count = fetched.len();
        self.replace(fetched).await;
        Ok(count)
    }

    /// 鍵IDに対応する公開鍵を返す。
    ///
    /// - キャッシュヒット: 即座に返す
    /// - ミス: 鍵セットを取得し直す（同じ鍵IDへの同時ミスは1回にまとめる）
    /// - 取得成功後も見つからない: `KeyNotFound`
    /// - 取得失敗: `FetchError`（キャッシュは汚さない）
    pub async fn resolve(&self, kid: &str) -> Result<Arc<SigningKey>, AuthError> {
        let started = Instant::now();

        {
            let cached = self.cached.read().await;
            match cached.keys.get(kid) {
                Some(key) if !self.is_stale(key) => return Ok(key.clone()),
                Some(_) => {}
                None => {
                    if self.recently_missed(&cached, kid) {
                        tracing::debug!(kid, "直近の取得で見つからなかった鍵IDです");
                        return Err(AuthError::KeyNotFound {
                            kid: kid.to_string(),
                        });
                    }
                }
            }
        }

        let flight = {
            let mut flights = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            flights.entry(kid.to_string()).or_default().clone()
        };
        // 完了したフライトを登録表から外す。後続のミスは新しいフライトで再取得する。
        let guard = FlightGuard {
            table: &self.in_flight,
            kid,
            flight,
        };

        let result = guard
            .flight
            .get_or_init(|| self.refresh_for(kid, started))
            .await
            .clone();
        drop(guard);
        result
    }

    /// 現在キャッシュされている鍵IDの一覧。
    pub async fn key_ids(&self) -> Vec<String> {
        self.cached.read().await.keys.keys().cloned().collect()
    }

    async fn lookup(&self, kid: &str) -> Option<Arc<SigningKey>> {
        self.cached.read().await.keys.get(kid).cloned()
    }

    fn recently_missed(&self, cached: &CachedKeys, kid: &str) -> bool {
        cached
            .misses
            .get(kid)
            .is_some_and(|at| at.elapsed() < self.miss_cooldown)
    }

    async fn record_miss(&self, kid: &str) {
        if self.miss_cooldown.is_zero() {
            return;
        }
        let mut cached = self.cached.write().await;
        let cooldown = self.miss_cooldown;
        cached.misses.retain(|_, at| at.elapsed() < cooldown);
        cached.misses.insert(kid.to_string(), Instant::now());
    }

    fn is_stale(&self, key: &SigningKey) -> bool {
        self.ttl.is_some_and(|ttl| key.fetched_at.elapsed() >= ttl)
    }

    async fn replace(&self, fetched: Vec<SigningKey>) {
        let mut cached = self.cached.write().await;
        cached.keys = fetched
            .into_iter()
            .map(|key| (key.key_id.clone(), Arc::new(key)))
            .collect();
        cached.refreshed_at = Some(Instant::now());
        let CachedKeys { keys, misses, .. } = &mut *cached;
        misses.retain(|kid, _| !keys.contains_key(kid));
    }

    /// フライトの本体。登録表に最初に入った呼び出しだけが実行する。
    async fn refresh_for(&self, kid: &str, started: Instant) -> FlightResult {
        // 直前のフライトが既に新しい鍵セットを取り込んでいれば、それを使う
        {
            let cached = self.cached.read().await;
            match cached.keys.get(kid) {
                Some(key) if !self.is_stale(key) => return Ok(key.clone()),
                Some(_) => {}
                None => {
                    if cached.refreshed_at.is_some_and(|at| at >= started) {
                        return Err(AuthError::KeyNotFound {
                            kid: kid.to_string(),
                        });
                    }
                }
            }
        }

        match self.source.fetch().await {
            Ok(fetched) => {
                let key_count = fetched.len();
                self.replace(fetched).await;
                tracing::info!(kid, key_count, "鍵セットを取得しました");

                match self.lookup(kid).await {
                    Some(key) => Ok(key),
                    None => {
                        tracing::warn!(kid, "鍵セットに存在しない鍵IDです");
                        self.record_miss(kid).await;
                        Err(AuthError::KeyNotFound {
                            kid: kid.to_string(),
                        })
                    }
                }
            }
            Err(e) => {
                if let Some(stale) = self.lookup(kid).await {
                    tracing::warn!(
                        kid,
                        error = %e,
                        "鍵セットの再取得に失敗したため、前回取得した鍵を使用します"
                    );
                    return Ok(stale);
                }
                tracing::warn!(kid, error = %e, "鍵セットの取得に失敗しました");
                Err(e)
            }
        }
    }
}
