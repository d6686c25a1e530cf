//! # VaultGuard トークン検証
//!
//! IDプロバイダが公開するJWKS鍵セットを用いて、Bearerトークンをステートレスに検証する。
//!
//! ## 構成
//! | モジュール | 役割 |
//! |-----------|------|
//! | `jwks` | 鍵セットの取得とパース（`KeySetSource`） |
//! | `key_ring` | 鍵IDごとのプロセス内キャッシュ（single-flight取得） |
//! | `token` | 署名・アルゴリズム・時刻クレームの検証 |
//!
//! ## 署名アルゴリズム
//! 受け付けるのは `RS256`（RSA公開鍵、JWKの `kty` は `RSA`）のみ。
//! 署名と時刻クレームの検証は `jsonwebtoken` に任せる。ヘッダーは閉じた構造体に変換され、
//! それ以外のアルゴリズムは鍵の解決前に拒否される。

pub mod error;
pub mod jwks;
pub mod key_ring;
pub mod token;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use error::AuthError;
pub use jwks::{HttpKeySetSource, KeySetSource, SigningKey};
pub use key_ring::KeyRing;
pub use token::{strip_bearer, SigningAlgorithm, TokenHeader, TokenVerifier, VerifiedIdentity};
