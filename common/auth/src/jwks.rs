use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use jsonwebtoken::DecodingKey;
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::{AuthError, AuthResult};

const FETCH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct JwksFetcher {
    client: Client,
    url: String,
}

impl JwksFetcher {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: Client::builder()
                .timeout(FETCH_TIMEOUT)
                .build()
                .unwrap_or_else(|_| Client::new()),
            url: url.into(),
        }
    }

    pub fn with_client(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn fetch(&self) -> AuthResult<HashMap<String, DecodingKey>> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|err| AuthError::JwksFetch(err.to_string()))?;

        if !response.status().is_success() {
            return Err(AuthError::JwksFetch(format!(
                "HTTP {} from {}",
                response.status(),
                self.url
            )));
        }

        let body: JwksResponse = response
            .json()
            .await
            .map_err(|err| AuthError::JwksDecode(err.to_string()))?;

        let mut keys = HashMap::new();
        for key in body.keys.into_iter() {
            let Some(kid) = key.kid else {
                // Keys without a kid can never be matched to a header.
                continue;
            };
            let kty = key.kty.unwrap_or_else(|| "RSA".to_string());
            if kty != "RSA" {
                warn!(kid, kty, "skipping JWKS key with unsupported type");
                continue;
            }
            let (Some(n), Some(e)) = (key.n, key.e) else {
                return Err(AuthError::JwksBadKey {
                    kid,
                    reason: "missing RSA components".into(),
                });
            };
            let decoding_key =
                DecodingKey::from_rsa_components(&n, &e).map_err(|err| AuthError::JwksBadKey {
                    kid: kid.clone(),
                    reason: err.to_string(),
                })?;
            keys.insert(kid, decoding_key);
        }

        Ok(keys)
    }
}

#[derive(Debug, Deserialize)]
struct JwksResponse {
    keys: Vec<JwkEntry>,
}

#[derive(Debug, Deserialize)]
struct JwkEntry {
    kid: Option<String>,
    kty: Option<String>,
    n: Option<String>,
    e: Option<String>,
}

/// Guard around the remote fetch: stops hammering an unavailable provider,
/// admits a single probe after the cool-down.
struct FetchGuard {
    failure_threshold: u32,
    cooldown: Duration,
    state: Mutex<GuardState>,
}

struct GuardState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

impl FetchGuard {
    fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold,
            cooldown,
            state: Mutex::new(GuardState {
                consecutive_failures: 0,
                open_until: None,
            }),
        }
    }

    async fn admit(&self) -> bool {
        let mut state = self.state.lock().await;
        match state.open_until {
            Some(until) if Instant::now() < until => false,
            Some(_) => {
                // Cool-down elapsed: allow one probe, re-arm if it fails.
                state.open_until = None;
                true
            }
            None => true,
        }
    }

    async fn record(&self, success: bool) {
        let mut state = self.state.lock().await;
        if success {
            state.consecutive_failures = 0;
            state.open_until = None;
        } else {
            state.consecutive_failures += 1;
            if state.consecutive_failures >= self.failure_threshold {
                state.open_until = Some(Instant::now() + self.cooldown);
            }
        }
    }
}

struct CachedKeys {
    keys: HashMap<String, DecodingKey>,
    fetched_at: Instant,
}

/// TTL cache over the identity provider's published key set. Stale material
/// is served when a refresh fails; verification only hard-fails when no set
/// was ever loaded.
pub struct JwksCache {
    fetcher: JwksFetcher,
    ttl: Duration,
    guard: FetchGuard,
    cached: RwLock<Option<CachedKeys>>,
}

impl JwksCache {
    pub fn new(fetcher: JwksFetcher, ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            fetcher,
            ttl,
            guard: FetchGuard::new(3, Duration::from_secs(30)),
            cached: RwLock::new(None),
        })
    }

    pub fn url(&self) -> &str {
        self.fetcher.url()
    }

    /// Resolve a verification key by kid, refreshing the cached set when its
    /// TTL has lapsed.
    pub async fn key_for(&self, kid: &str) -> AuthResult<DecodingKey> {
        {
            let cached = self.cached.read().await;
            if let Some(entry) = cached.as_ref() {
                if entry.fetched_at.elapsed() < self.ttl {
                    return entry
                        .keys
                        .get(kid)
                        .cloned()
                        .ok_or_else(|| AuthError::UnknownKeyId(kid.to_string()));
                }
            }
        }

        match self.refresh().await {
            Ok(_) => {}
            Err(err) => {
                let cached = self.cached.read().await;
                match cached.as_ref() {
                    Some(stale) => {
                        warn!(error = %err, "JWKS refresh failed, serving stale key set");
                        return stale
                            .keys
                            .get(kid)
                            .cloned()
                            .ok_or_else(|| AuthError::UnknownKeyId(kid.to_string()));
                    }
                    None => return Err(AuthError::JwksUnavailable),
                }
            }
        }

        let cached = self.cached.read().await;
        cached
            .as_ref()
            .and_then(|entry| entry.keys.get(kid).cloned())
            .ok_or_else(|| AuthError::UnknownKeyId(kid.to_string()))
    }

    /// Fetch and replace the cached set. Failures leave the cache untouched.
    pub async fn refresh(&self) -> AuthResult<usize> {
        if !self.guard.admit().await {
            return Err(AuthError::JwksFetch(
                "key endpoint fetch suppressed while recovering".into(),
            ));
        }

        match self.fetcher.fetch().await {
            Ok(keys) => {
                self.guard.record(true).await;
                let count = keys.len();
                let mut cached = self.cached.write().await;
                *cached = Some(CachedKeys {
                    keys,
                    fetched_at: Instant::now(),
                });
                debug!(count, url = self.fetcher.url(), "refreshed JWKS key set");
                Ok(count)
            }
            Err(err) => {
                self.guard.record(false).await;
                Err(err)
            }
        }
    }

    /// Warm the cache at startup; a failure is logged, not fatal, because the
    /// first verification will retry.
    pub async fn warmup(&self) {
        if let Err(err) = self.refresh().await {
            warn!(error = %err, "JWKS warmup failed; verification will retry on demand");
        }
    }

    /// Drop the cached set so the next lookup refetches.
    pub async fn invalidate(&self) {
        let mut cached = self.cached.write().await;
        *cached = None;
    }

    /// Seed the cache directly. Intended for tests and single-key dev setups.
    pub async fn seed(&self, kid: impl Into<String>, key: DecodingKey) {
        let mut cached = self.cached.write().await;
        let entry = cached.get_or_insert_with(|| CachedKeys {
            keys: HashMap::new(),
            fetched_at: Instant::now(),
        });
        entry.keys.insert(kid.into(), key);
        entry.fetched_at = Instant::now();
    }
}
