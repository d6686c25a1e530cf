//! # Bearerトークン検証
//!
//! 3部構成（header.payload.signature）の署名付きトークンを検証し、
//! 検証済みの主体（`sub`）とクレームを返す。
//!
//! ## 検証手順
//! 1. `Bearer ` プレフィックス（大文字小文字を区別しない）を除去する
//! 2. ヘッダーを閉じた構造体 `TokenHeader` に変換（許可リスト外のアルゴリズムはここで拒否）
//! 3. `KeyRing` で鍵IDから公開鍵を解決
//! 4. `jsonwebtoken::decode` で署名と exp / nbf / iss を検証
//! 5. iat が未来でないことを確認し、クレームを `VerifiedIdentity` として返す

use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use jsonwebtoken::errors::{Error as JwtError, ErrorKind};
use jsonwebtoken::{decode, decode_header, Algorithm, Validation};
use serde::Deserialize;

use crate::error::AuthError;
use crate::key_ring::KeyRing;

/// 時刻クレームの許容誤差の既定値。
pub const DEFAULT_CLOCK_SKEW: Duration = Duration::from_secs(60);

/// Base64エンジン（URL-safe、パディングなし）
pub(crate) fn b64url() -> base64::engine::GeneralPurpose {
    base64::engine::general_purpose::URL_SAFE_NO_PAD
}

type Claims = serde_json::Map<String, serde_json::Value>;

/// 受け付ける署名アルゴリズム。
///
/// 列挙子は1つだけで、`none` や対称鍵アルゴリズムを表す値は存在しない。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningAlgorithm {
    /// RSASSA-PKCS1-v1_5 + SHA-256
    Rs256,
}

impl SigningAlgorithm {
    /// ヘッダーの`alg`値。
    pub fn as_str(&self) -> &'static str {
        match self {
            SigningAlgorithm::Rs256 => "RS256",
        }
    }

    /// `jsonwebtoken` の検証に渡すアルゴリズム。列挙子に対して網羅的に対応させる。
    fn to_jwt(self) -> Algorithm {
        match self {
            SigningAlgorithm::Rs256 => Algorithm::RS256,
        }
    }
}

impl FromStr for SigningAlgorithm {
    type Err = AuthError;

    fn from_str(alg: &str) -> Result<Self, Self::Err> {
        match alg {
            "RS256" => Ok(SigningAlgorithm::Rs256),
            other => Err(AuthError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

impl TryFrom<Algorithm> for SigningAlgorithm {
    type Error = AuthError;

    fn try_from(alg: Algorithm) -> Result<Self, Self::Error> {
        match alg {
            Algorithm::RS256 => Ok(SigningAlgorithm::Rs256),
            other => Err(AuthError::UnsupportedAlgorithm(format!("{other:?}"))),
        }
    }
}

/// `jsonwebtoken` が表現できない `alg`（`none` など）を分類するためだけに読むヘッダー。
#[derive(Deserialize)]
struct AlgOnly {
    alg: String,
}

/// 検証済みのトークンヘッダー。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenHeader {
    /// 署名アルゴリズム
    pub alg: SigningAlgorithm,
    /// 鍵ID
    pub kid: String,
}

impl TokenHeader {
    /// トークンのヘッダーを変換する。アルゴリズムは鍵IDより先に検査する。
    pub fn parse(token: &str) -> Result<Self, AuthError> {
        let header = decode_header(token).map_err(|e| header_error(token, e))?;
        let alg = SigningAlgorithm::try_from(header.alg)?;
        let kid = header
            .kid
            .filter(|kid| !kid.is_empty())
            .ok_or_else(|| AuthError::MalformedToken("ヘッダーにkidがありません".to_string()))?;
        Ok(Self { alg, kid })
    }
}

/// `decode_header` の失敗を分類する。
///
/// `alg` が文字列として読めるのに `Algorithm` に無い値（`none` 等）であれば
/// `UnsupportedAlgorithm`、それ以外は `MalformedToken`。
fn header_error(token: &str, err: JwtError) -> AuthError {
    if matches!(err.kind(), ErrorKind::Json(_)) {
        let alg = token
            .split('.')
            .next()
            .and_then(|segment| b64url().decode(segment).ok())
            .and_then(|json| serde_json::from_slice::<AlgOnly>(&json).ok());
        if let Some(AlgOnly { alg }) = alg {
            return match alg.parse::<SigningAlgorithm>() {
                Err(e) => e,
                Ok(_) => AuthError::MalformedToken(format!("ヘッダーのパースに失敗: {err}")),
            };
        }
    }
    AuthError::MalformedToken(format!("ヘッダーのパースに失敗: {err}"))
}

/// 署名・クレーム検証の失敗を認証エラーに変換する。
fn claims_error(err: JwtError) -> AuthError {
    match err.kind() {
        ErrorKind::InvalidSignature => AuthError::SignatureInvalid,
        ErrorKind::ExpiredSignature => AuthError::ExpiredToken("expが過去です".to_string()),
        ErrorKind::ImmatureSignature => {
            AuthError::ExpiredToken("nbfに達していません".to_string())
        }
        ErrorKind::InvalidIssuer => AuthError::InvalidIssuer("issが一致しません".to_string()),
        ErrorKind::MissingRequiredClaim(claim) if claim == "iss" => {
            AuthError::InvalidIssuer("issクレームがありません".to_string())
        }
        ErrorKind::MissingRequiredClaim(claim) => {
            AuthError::MalformedToken(format!("{claim}クレームがありません"))
        }
        ErrorKind::InvalidAlgorithm => AuthError::UnsupportedAlgorithm("不一致".to_string()),
        ErrorKind::InvalidRsaKey(_) | ErrorKind::InvalidKeyFormat => AuthError::SignatureInvalid,
        _ => AuthError::MalformedToken(err.to_string()),
    }
}

/// 検証済みの主体。1リクエストの間だけ使う。
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedIdentity {
    /// `sub` クレーム
    pub subject: String,
    /// ペイロードの全クレーム
    pub claims: Claims,
}

/// Authorizationヘッダー値から `Bearer ` プレフィックスを除去する。
///
/// プレフィックスは任意で、大文字小文字を区別しない。空なら `MissingToken`。
pub fn strip_bearer(raw: &str) -> Result<&str, AuthError> {
    let trimmed = raw.trim();
    let token = match trimmed.get(..7) {
        Some(prefix) if prefix.eq_ignore_ascii_case("bearer ") => trimmed[7..].trim_start(),
        _ => trimmed,
    };
    if token.is_empty() {
        return Err(AuthError::MissingToken);
    }
    Ok(token)
}

/// Bearerトークンの検証器。
///
/// 状態を持たない。鍵キャッシュ（`KeyRing`）は外部から注入する。
#[derive(Clone)]
pub struct TokenVerifier {
    /// 署名鍵キャッシュ
    key_ring: Arc<KeyRing>,
    /// exp/nbf/iat の許容誤差
    clock_skew: Duration,
    /// 期待する発行者（Noneなら検査しない）
    expected_issuer: Option<String>,
}

impl TokenVerifier {
    /// 既定の許容誤差で検証器を作成する。
    pub fn new(key_ring: Arc<KeyRing>) -> Self {
        Self {
            key_ring,
            clock_skew: DEFAULT_CLOCK_SKEW,
            expected_issuer: None,
        }
    }

    /// 時刻クレームの許容誤差を設定する。
    pub fn with_clock_skew(mut self, clock_skew: Duration) -> Self {
        self.clock_skew = clock_skew;
        self
    }

    /// `iss` クレームの一致を要求する。
    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.expected_issuer = Some(issuer.into());
        self
    }

    /// Authorizationヘッダー値を検証し、主体を返す。
    pub async fn verify(&self, raw_token: &str) -> Result<VerifiedIdentity, AuthError> {
        let token = strip_bearer(raw_token)?;
        let header = TokenHeader::parse(token)?;

        let key = self.key_ring.resolve(&header.kid).await?;
        let claims = decode::<Claims>(token, &key.decoding_key, &self.validation(header.alg))
            .map_err(claims_error)?
            .claims;

        self.validate_issued_at(&claims)?;

        let subject = claims
            .get("sub")
            .and_then(|sub| sub.as_str())
            .filter(|sub| !sub.is_empty())
            .ok_or_else(|| AuthError::MalformedToken("subクレームが不正です".to_string()))?
            .to_string();

        Ok(VerifiedIdentity { subject, claims })
    }

    /// ヘッダーのアルゴリズムに固定した検証設定。
    fn validation(&self, alg: SigningAlgorithm) -> Validation {
        let mut validation = Validation::new(alg.to_jwt());
        validation.leeway = self.clock_skew.as_secs();
        validation.validate_exp = true;
        validation.validate_nbf = true;
        // IDトークンのaudはクライアントIDであり、ここでは検査しない
        validation.validate_aud = false;
        match &self.expected_issuer {
            Some(issuer) => {
                validation.set_issuer(&[issuer.as_str()]);
                validation.set_required_spec_claims(&["exp", "sub", "iss"]);
            }
            None => validation.set_required_spec_claims(&["exp", "sub"]),
        }
        validation
    }

    /// `iat` が許容誤差を超えて未来でないことを確認する。
    fn validate_issued_at(&self, claims: &Claims) -> Result<(), AuthError> {
        let Some(iat) = claims.get("iat") else {
            return Ok(());
        };
        let iat = iat
            .as_f64()
            .ok_or_else(|| AuthError::MalformedToken("iatクレームが数値ではありません".to_string()))?;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        if iat > now + self.clock_skew.as_secs_f64() {
            return Err(AuthError::ExpiredToken("iatが未来です".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{craft_token, now_secs, StaticKeySource, TestKey, TestSigner};

    fn verifier_for(signers: &[&TestSigner]) -> (TokenVerifier, Arc<StaticKeySource>) {
        let source = Arc::new(StaticKeySource::new(
            signers.iter().map(|s| s.signing_key()).collect(),
        ));
        let ring = Arc::new(KeyRing::new(source.clone()));
        (TokenVerifier::new(ring), source)
    }

    /// 正しく署名されたトークンが検証され、主体とクレームが返ることを確認
    #[tokio::test]
    async fn test_verify_valid_token() {
        let signer = TestSigner::new("kid-1");
        let (verifier, _) = verifier_for(&[&signer]);

        let token = signer.token_for("u1");
        let identity = verifier.verify(&format!("Bearer {token}")).await.unwrap();

        assert_eq!(identity.subject, "u1");
        assert_eq!(identity.claims["sub"], "u1");
        assert!(identity.claims.contains_key("exp"));
    }

    /// プレフィックスは任意で、大文字小文字を区別しないことを確認
    #[tokio::test]
    async fn test_verify_bearer_prefix_variants() {
        let signer = TestSigner::new("kid-1");
        let (verifier, _) = verifier_for(&[&signer]);
        let token = signer.token_for("u1");

        for raw in [
            token.clone(),
            format!("bearer {token}"),
            format!("BEARER {token}"),
            format!("  Bearer   {token}  "),
        ] {
            assert_eq!(verifier.verify(&raw).await.unwrap().subject, "u1");
        }
    }

    /// 空のヘッダー値はMissingTokenになることを確認
    #[tokio::test]
    async fn test_verify_missing_token() {
        let signer = TestSigner::new("kid-1");
        let (verifier, _) = verifier_for(&[&signer]);

        assert_eq!(verifier.verify("").await, Err(AuthError::MissingToken));
        assert_eq!(verifier.verify("Bearer   ").await, Err(AuthError::MissingToken));
    }

    /// 3部構成でないトークンはMalformedTokenになることを確認
    #[tokio::test]
    async fn test_verify_malformed_structure() {
        let signer = TestSigner::new("kid-1");
        let (verifier, source) = verifier_for(&[&signer]);

        for raw in ["abc", "a.b", "a.b.c.d", "..", "a.!!!.c", "Bearer"] {
            assert!(
                matches!(verifier.verify(raw).await, Err(AuthError::MalformedToken(_))),
                "{raw} はMalformedTokenになるべき"
            );
        }
        assert_eq!(source.fetch_count(), 0);
    }

    /// RS256以外のアルゴリズムは鍵の取得前に拒否されることを確認
    #[tokio::test]
    async fn test_verify_rejects_forbidden_algorithms() {
        let signer = TestSigner::new("kid-1");
        let (verifier, source) = verifier_for(&[&signer]);
        let claims = serde_json::json!({ "sub": "u1", "exp": now_secs() + 3600 });

        for alg in [
            "none", "HS256", "HS384", "HS512", "RS384", "PS256", "ES256", "EdDSA", "eddsa",
        ] {
            let header = serde_json::json!({ "alg": alg, "kid": "kid-1", "typ": "JWT" });
            let token = craft_token(&header, &claims, &[7u8; 64]);
            assert_eq!(
                verifier.verify(&token).await,
                Err(AuthError::UnsupportedAlgorithm(alg.to_string())),
            );
        }

        // kidの無いnoneトークンも、アルゴリズムの検査で先に拒否される
        let header = serde_json::json!({ "alg": "none" });
        let token = craft_token(&header, &claims, b"x");
        assert!(matches!(
            verifier.verify(&token).await,
            Err(AuthError::UnsupportedAlgorithm(_))
        ));

        assert_eq!(source.fetch_count(), 0);
    }

    /// 正規の鍵で署名されていても、ヘッダーをHS256に書き換えれば拒否されることを確認
    #[tokio::test]
    async fn test_verify_rejects_algorithm_substitution() {
        let signer = TestSigner::new("kid-1");
        let (verifier, _) = verifier_for(&[&signer]);
        let claims = serde_json::json!({ "sub": "u1", "exp": now_secs() + 3600 });
        let header = serde_json::json!({ "alg": "HS256", "kid": "kid-1" });

        let token = signer.sign_with_header(&header, &claims);
        assert!(matches!(
            verifier.verify(&token).await,
            Err(AuthError::UnsupportedAlgorithm(_))
        ));
    }

    /// 鍵セットに無い鍵で署名されたトークンはSignatureInvalidではなくKeyNotFoundになることを確認
    #[tokio::test]
    async fn test_verify_unknown_key_is_key_not_found() {
        let published = TestSigner::new("kid-1");
        let rogue = TestSigner::new("kid-rogue");
        let (verifier, _) = verifier_for(&[&published]);

        let token = rogue.token_for("u1");
        assert_eq!(
            verifier.verify(&token).await,
            Err(AuthError::KeyNotFound {
                kid: "kid-rogue".to_string()
            })
        );
    }

    /// 公開済みの鍵IDを名乗る別の鍵の署名はSignatureInvalidになることを確認
    #[tokio::test]
    async fn test_verify_wrong_key_same_kid() {
        let published = TestSigner::new("kid-1");
        let impostor = TestSigner::with_key("kid-1", TestKey::Secondary);
        let (verifier, _) = verifier_for(&[&published]);

        let token = impostor.token_for("u1");
        assert_eq!(verifier.verify(&token).await, Err(AuthError::SignatureInvalid));
    }

    /// ペイロードを改ざんするとSignatureInvalidになることを確認
    #[tokio::test]
    async fn test_verify_tampered_payload() {
        let signer = TestSigner::new("kid-1");
        let (verifier, _) = verifier_for(&[&signer]);

        let token = signer.token_for("u1");
        let mut segments: Vec<String> = token.split('.').map(|s| s.to_string()).collect();
        let forged = serde_json::json!({ "sub": "admin", "exp": now_secs() + 3600 });
        segments[1] = b64url().encode(serde_json::to_vec(&forged).unwrap());
        let tampered = segments.join(".");

        assert_eq!(verifier.verify(&tampered).await, Err(AuthError::SignatureInvalid));
    }

    /// 署名が有効でもexpが過去ならExpiredTokenになることを確認
    #[tokio::test]
    async fn test_verify_expired_token() {
        let signer = TestSigner::new("kid-1");
        let (verifier, _) = verifier_for(&[&signer]);

        let claims = serde_json::json!({
            "sub": "u1",
            "iat": now_secs() - 7200,
            "exp": now_secs() - 600,
        });
        let token = signer.sign_claims(&claims);
        assert!(matches!(
            verifier.verify(&token).await,
            Err(AuthError::ExpiredToken(_))
        ));
    }

    /// iatが許容誤差を超えて未来ならExpiredToken、誤差内なら通ることを確認
    #[tokio::test]
    async fn test_verify_iat_clock_skew() {
        let signer = TestSigner::new("kid-1");
        let (verifier, _) = verifier_for(&[&signer]);
        let verifier = verifier.with_clock_skew(Duration::from_secs(30));

        let within = signer.sign_claims(&serde_json::json!({
            "sub": "u1",
            "iat": now_secs() + 10,
            "exp": now_secs() + 3600,
        }));
        assert!(verifier.verify(&within).await.is_ok());

        let beyond = signer.sign_claims(&serde_json::json!({
            "sub": "u1",
            "iat": now_secs() + 600,
            "exp": now_secs() + 3600,
        }));
        assert!(matches!(
            verifier.verify(&beyond).await,
            Err(AuthError::ExpiredToken(_))
        ));
    }

    /// nbfが未来のトークンが拒否されることを確認
    #[tokio::test]
    async fn test_verify_not_before() {
        let signer = TestSigner::new("kid-1");
        let (verifier, _) = verifier_for(&[&signer]);

        let token = signer.sign_claims(&serde_json::json!({
            "sub": "u1",
            "nbf": now_secs() + 3600,
            "exp": now_secs() + 7200,
        }));
        assert!(matches!(
            verifier.verify(&token).await,
            Err(AuthError::ExpiredToken(_))
        ));
    }

    /// sub・expが欠けたクレームはMalformedTokenになることを確認
    #[tokio::test]
    async fn test_verify_missing_required_claims() {
        let signer = TestSigner::new("kid-1");
        let (verifier, _) = verifier_for(&[&signer]);

        let no_sub = signer.sign_claims(&serde_json::json!({ "exp": now_secs() + 3600 }));
        assert!(matches!(
            verifier.verify(&no_sub).await,
            Err(AuthError::MalformedToken(_))
        ));

        let no_exp = signer.sign_claims(&serde_json::json!({ "sub": "u1" }));
        assert!(matches!(
            verifier.verify(&no_exp).await,
            Err(AuthError::MalformedToken(_))
        ));

        let text_exp = signer.sign_claims(&serde_json::json!({ "sub": "u1", "exp": "tomorrow" }));
        assert!(matches!(
            verifier.verify(&text_exp).await,
            Err(AuthError::MalformedToken(_))
        ));
    }

    /// 発行者を固定した場合、異なるissが拒否されることを確認
    #[tokio::test]
    async fn test_verify_issuer_pinning() {
        let signer = TestSigner::new("kid-1");
        let (verifier, _) = verifier_for(&[&signer]);
        let verifier = verifier.with_issuer("https://idp.example.com/pool");

        let good = signer.sign_claims(&serde_json::json!({
            "sub": "u1",
            "iss": "https://idp.example.com/pool",
            "exp": now_secs() + 3600,
        }));
        assert!(verifier.verify(&good).await.is_ok());

        let other = signer.sign_claims(&serde_json::json!({
            "sub": "u1",
            "iss": "https://evil.example.com",
            "exp": now_secs() + 3600,
        }));
        assert!(matches!(
            verifier.verify(&other).await,
            Err(AuthError::InvalidIssuer(_))
        ));

        let missing = signer.sign_claims(&serde_json::json!({
            "sub": "u1",
            "exp": now_secs() + 3600,
        }));
        assert!(matches!(
            verifier.verify(&missing).await,
            Err(AuthError::InvalidIssuer(_))
        ));
    }

    /// 鍵セットの取得失敗がFetchErrorとして伝播することを確認
    #[tokio::test]
    async fn test_verify_propagates_fetch_error() {
        let signer = TestSigner::new("kid-1");
        let (verifier, source) = verifier_for(&[&signer]);
        source.fail_next(1);

        let token = signer.token_for("u1");
        assert!(matches!(
            verifier.verify(&token).await,
            Err(AuthError::FetchError(_))
        ));
        // 失敗はキャッシュされず、再試行で成功する
        assert!(verifier.verify(&token).await.is_ok());
    }

    /// 期限切れでも許容誤差の範囲内なら受け付けることを確認
    #[tokio::test]
    async fn test_verify_exp_within_clock_skew() {
        let signer = TestSigner::new("kid-1");
        let (verifier, _) = verifier_for(&[&signer]);

        let token = signer.sign_claims(&serde_json::json!({
            "sub": "u1",
            "exp": now_secs() - 10,
        }));
        assert!(verifier.verify(&token).await.is_ok());

        let strict = verifier.with_clock_skew(Duration::ZERO);
        assert!(matches!(
            strict.verify(&token).await,
            Err(AuthError::ExpiredToken(_))
        ));
    }

    /// kidの無いRS256トークンはMalformedTokenになり、鍵を取得しないことを確認
    #[tokio::test]
    async fn test_verify_missing_kid() {
        let signer = TestSigner::new("kid-1");
        let (verifier, source) = verifier_for(&[&signer]);
        let claims = serde_json::json!({ "sub": "u1", "exp": now_secs() + 3600 });

        for header in [
            serde_json::json!({ "alg": "RS256" }),
            serde_json::json!({ "alg": "RS256", "kid": "" }),
        ] {
            let token = signer.sign_with_header(&header, &claims);
            assert!(matches!(
                verifier.verify(&token).await,
                Err(AuthError::MalformedToken(_))
            ));
        }
        assert_eq!(source.fetch_count(), 0);
    }

    /// 許可リストはRS256のみであることを確認
    #[test]
    fn test_algorithm_allow_list() {
        assert_eq!(
            "RS256".parse::<SigningAlgorithm>().unwrap().as_str(),
            "RS256"
        );
        assert_eq!(
            SigningAlgorithm::try_from(Algorithm::RS256),
            Ok(SigningAlgorithm::Rs256)
        );
        for alg in [Algorithm::HS256, Algorithm::RS512, Algorithm::ES256, Algorithm::EdDSA] {
            assert!(matches!(
                SigningAlgorithm::try_from(alg),
                Err(AuthError::UnsupportedAlgorithm(_))
            ));
        }
        assert!("rs256".parse::<SigningAlgorithm>().is_err());
    }
}
