use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use http::HeaderMap;
use jsonwebtoken::{
    Algorithm, DecodingKey, Validation, decode, decode_header,
    jwk::{AlgorithmParameters, Jwk, JwkSet},
};
use serde::Deserialize;
use tokio::sync::RwLock;
use url::Url;

use super::{AuthenticationFailure, Authenticator, Principal, extract_bearer_token};
use crate::{OpenIdConfig, service::ApplicationId};

/// Unknown key ids trigger an early refresh at most this often.
const UNKNOWN_KID_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct DiscoveryDocument {
    issuer: String,
    jwks_uri: Url,
}

#[derive(Debug, Deserialize)]
struct AccessTokenClaims {
    #[serde(default)]
    appid: Option<String>,
    #[serde(default)]
    azp: Option<String>,
    #[serde(default)]
    roles: Vec<String>,
}

#[derive(Debug)]
struct SigningKeys {
    issuer: String,
    keys: JwkSet,
    fetched_at: Instant,
}

#[derive(Debug)]
enum KeySource {
    Discovery {
        provider_uri: Url,
        client: reqwest::Client,
        refresh_interval: Duration,
    },
    Static,
}

/// Validates bearer tokens issued by an OpenID provider.
///
/// Signing keys are taken from the provider's JWKS document and refreshed
/// periodically. The calling application is read from the `appid` claim, or
/// `azp` if `appid` is absent, and must be a UUID.
#[derive(Debug, Clone)]
pub struct JwtAuthenticator {
    inner: Arc<JwtAuthenticatorInner>,
}

#[derive(Debug)]
struct JwtAuthenticatorInner {
    source: KeySource,
    audiences: Vec<String>,
    keys: RwLock<Option<Arc<SigningKeys>>>,
}

impl JwtAuthenticator {
    /// Keys are fetched lazily on the first request.
    pub fn new(config: &OpenIdConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            inner: Arc::new(JwtAuthenticatorInner {
                source: KeySource::Discovery {
                    provider_uri: config.provider_uri.clone(),
                    client,
                    refresh_interval: config.jwks_refresh_interval,
                },
                audiences: config.accepted_audiences(),
                keys: RwLock::new(None),
            }),
        })
    }

    /// An authenticator with a fixed key set that is never refreshed.
    #[must_use]
    pub fn with_static_keys(
        issuer: impl Into<String>,
        audiences: Vec<String>,
        keys: JwkSet,
    ) -> Self {
        Self {
            inner: Arc::new(JwtAuthenticatorInner {
                source: KeySource::Static,
                audiences,
                keys: RwLock::new(Some(Arc::new(SigningKeys {
                    issuer: issuer.into(),
                    keys,
                    fetched_at: Instant::now(),
                }))),
            }),
        }
    }

    pub async fn validate(&self, token: &str) -> Result<Principal, AuthenticationFailure> {
        let header = decode_header(token)?;
        let kid = header.kid.as_deref();
        let (jwk, issuer) = self.find_key(kid).await?;

        if !key_accepts(&jwk, header.alg) {
            return Err(AuthenticationFailure::AlgorithmMismatch { alg: header.alg });
        }
        let key = DecodingKey::from_jwk(&jwk)?;

        let mut validation = Validation::new(header.alg);
        validation.set_audience(self.inner.audiences.as_slice());
        validation.set_issuer(&[issuer]);

        let claims = decode::<AccessTokenClaims>(token, &key, &validation)?.claims;
        let app_id = claims
            .appid
            .or(claims.azp)
            .and_then(|id| id.parse::<ApplicationId>().ok())
            .ok_or(AuthenticationFailure::MissingApplicationId)?;

        tracing::debug!(%app_id, roles = ?claims.roles, "Validated access token");
        Ok(Principal::new(app_id, claims.roles))
    }

    async fn find_key(&self, kid: Option<&str>) -> Result<(Jwk, String), AuthenticationFailure> {
        let keys = self.signing_keys(false).await?;
        if let Some(jwk) = select_key(&keys.keys, kid) {
            return Ok((jwk.clone(), keys.issuer.clone()));
        }

        // The provider may have rotated its keys since the last fetch.
        if matches!(self.inner.source, KeySource::Discovery { .. })
            && keys.fetched_at.elapsed() > UNKNOWN_KID_REFRESH_INTERVAL
        {
            let keys = self.signing_keys(true).await?;
            if let Some(jwk) = select_key(&keys.keys, kid) {
                return Ok((jwk.clone(), keys.issuer.clone()));
            }
        }

        Err(AuthenticationFailure::UnknownKey {
            kid: kid.map(ToString::to_string),
        })
    }

    async fn signing_keys(&self, force: bool) -> Result<Arc<SigningKeys>, AuthenticationFailure> {
        let KeySource::Discovery {
            provider_uri,
            client,
            refresh_interval,
        } = &self.inner.source
        else {
            return self.inner.keys.read().await.clone().ok_or_else(|| {
                AuthenticationFailure::KeysUnavailable {
                    reason: "no static keys configured".to_string(),
                }
            });
        };

        if !force
            && let Some(keys) = self.inner.keys.read().await.as_ref()
            && keys.fetched_at.elapsed() < *refresh_interval
        {
            return Ok(keys.clone());
        }

        let mut guard = self.inner.keys.write().await;
        // Another request may have refreshed while we waited for the lock.
        if let Some(keys) = guard.as_ref() {
            let max_age = if force {
                UNKNOWN_KID_REFRESH_INTERVAL
            } else {
                *refresh_interval
            };
            if keys.fetched_at.elapsed() < max_age {
                return Ok(keys.clone());
            }
        }

        match fetch_signing_keys(client, provider_uri).await {
            Ok(keys) => {
                tracing::info!(
                    issuer = %keys.issuer,
                    key_count = keys.keys.keys.len(),
                    "Refreshed signing keys"
                );
                let keys = Arc::new(keys);
                *guard = Some(keys.clone());
                Ok(keys)
            }
            Err(e) => {
                tracing::error!(error = %e, %provider_uri, "Failed to refresh signing keys");
                // Keep using the previous keys if there are any.
                (*guard).clone().ok_or(e)
            }
        }
    }
}

#[async_trait]
impl Authenticator for JwtAuthenticator {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<Principal, AuthenticationFailure> {
        let token = extract_bearer_token(headers).ok_or(AuthenticationFailure::MissingToken)?;
        self.validate(token).await
    }
}

async fn fetch_signing_keys(
    client: &reqwest::Client,
    provider_uri: &Url,
) -> Result<SigningKeys, AuthenticationFailure> {
    let unavailable = |reason: String| AuthenticationFailure::KeysUnavailable { reason };

    let discovery_url = format!(
        "{}/.well-known/openid-configuration",
        provider_uri.as_str().trim_end_matches('/')
    );
    tracing::debug!(url = %discovery_url, "Fetching OpenID discovery document");
    let discovery: DiscoveryDocument = client
        .get(&discovery_url)
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(|e| unavailable(format!("Failed to fetch discovery document: {e}")))?
        .json()
        .await
        .map_err(|e| unavailable(format!("Invalid discovery document: {e}")))?;

    tracing::debug!(url = %discovery.jwks_uri, "Fetching JWKS");
    let keys: JwkSet = client
        .get(discovery.jwks_uri.clone())
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(|e| unavailable(format!("Failed to fetch JWKS: {e}")))?
        .json()
        .await
        .map_err(|e| unavailable(format!("Invalid JWKS document: {e}")))?;

    if keys.keys.is_empty() {
        return Err(unavailable("JWKS document contains no keys".to_string()));
    }

    Ok(SigningKeys {
        issuer: discovery.issuer,
        keys,
        fetched_at: Instant::now(),
    })
}

fn select_key<'a>(keys: &'a JwkSet, kid: Option<&str>) -> Option<&'a Jwk> {
    match kid {
        Some(kid) => keys.find(kid),
        None if keys.keys.len() == 1 => keys.keys.first(),
        None => None,
    }
}

/// Whether a token signed with `alg` may be verified with `jwk`.
fn key_accepts(jwk: &Jwk, alg: Algorithm) -> bool {
    if let Some(declared) = jwk.common.key_algorithm {
        // Both enums serialize to their JOSE names.
        return serde_json::to_value(declared).ok() == serde_json::to_value(alg).ok();
    }
    #[allow(unreachable_patterns)]
    match &jwk.algorithm {
        AlgorithmParameters::RSA(_) => matches!(
            alg,
            Algorithm::RS256
                | Algorithm::RS384
                | Algorithm::RS512
                | Algorithm::PS256
                | Algorithm::PS384
                | Algorithm::PS512
        ),
        AlgorithmParameters::EllipticCurve(_) => {
            matches!(alg, Algorithm::ES256 | Algorithm::ES384)
        }
        AlgorithmParameters::OctetKey(_) => {
            matches!(alg, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512)
        }
        AlgorithmParameters::OctetKeyPair(_) => matches!(alg, Algorithm::EdDSA),
        _ => false,
    }
}
