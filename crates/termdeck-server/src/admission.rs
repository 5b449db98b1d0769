//! Who may open a terminal socket: per-IP connection accounting and
//! credential / single-use token checks.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use serde::Serialize;

/// Lifetime of a token issued by `POST /api/ws-token`.
pub const WS_TOKEN_TTL: Duration = Duration::from_secs(60);

/// Counts open sockets per client IP against a runtime-adjustable cap.
#[derive(Debug)]
pub struct ConnectionLimiter {
    limit: AtomicUsize,
    per_ip: Mutex<HashMap<IpAddr, usize>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStats {
    pub limit: usize,
    pub total: usize,
    pub per_ip: BTreeMap<String, usize>,
}

impl ConnectionLimiter {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: AtomicUsize::new(limit.max(1)),
            per_ip: Mutex::new(HashMap::new()),
        }
    }

    fn counts(&self) -> MutexGuard<'_, HashMap<IpAddr, usize>> {
        self.per_ip.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reserve a slot for `ip`, or `None` when it is at the cap. The slot is
    /// released when the returned guard drops.
    pub fn try_acquire(self: &Arc<Self>, ip: IpAddr) -> Option<ConnectionSlot> {
        let limit = self.limit();
        let mut counts = self.counts();
        let count = counts.entry(ip).or_insert(0);
        if *count >= limit {
            return None;
        }
        *count += 1;
        Some(ConnectionSlot {
            limiter: Arc::clone(self),
            ip,
        })
    }

    fn release(&self, ip: IpAddr) {
        let mut counts = self.counts();
        if let Some(count) = counts.get_mut(&ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.remove(&ip);
            }
        }
    }

    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::Relaxed)
    }

    /// Existing connections above a lowered cap are left alone; only new
    /// admissions see it.
    pub fn set_limit(&self, limit: usize) {
        self.limit.store(limit.max(1), Ordering::Relaxed);
    }

    pub fn stats(&self) -> ConnectionStats {
        let counts = self.counts();
        ConnectionStats {
            limit: self.limit(),
            total: counts.values().sum(),
            per_ip: counts
                .iter()
                .map(|(ip, count)| (ip.to_string(), *count))
                .collect(),
        }
    }
}

/// An admitted connection's share of its IP's budget.
#[derive(Debug)]
pub struct ConnectionSlot {
    limiter: Arc<ConnectionLimiter>,
    ip: IpAddr,
}

impl ConnectionSlot {
    pub fn ip(&self) -> IpAddr {
        self.ip
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.limiter.release(self.ip);
    }
}

/// Credential and single-use token checks.
///
/// With no credential configured every request is authorized.
#[derive(Debug)]
pub struct Authenticator {
    credential: Option<String>,
    tokens: Mutex<HashMap<String, Instant>>,
    ttl: Duration,
}

impl Authenticator {
    pub fn new(credential: Option<String>) -> Self {
        Self::with_ttl(credential, WS_TOKEN_TTL)
    }

    pub fn with_ttl(credential: Option<String>, ttl: Duration) -> Self {
        Self {
            credential,
            tokens: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn is_open(&self) -> bool {
        self.credential.is_none()
    }

    fn tokens(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        self.tokens.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// `Authorization: Bearer <credential>`.
    pub fn check_header(&self, headers: &HeaderMap) -> bool {
        let Some(expected) = &self.credential else {
            return true;
        };
        headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .is_some_and(|presented| constant_time_eq(presented.as_bytes(), expected.as_bytes()))
    }

    pub fn issue_token(&self) -> String {
        let token = uuid::Uuid::new_v4().simple().to_string();
        let now = Instant::now();
        let mut tokens = self.tokens();
        tokens.retain(|_, expires| *expires > now);
        tokens.insert(token.clone(), now + self.ttl);
        token
    }

    /// Consume a token. Unknown, reused and expired tokens fail.
    pub fn redeem_token(&self, token: &str) -> bool {
        match self.tokens().remove(token) {
            Some(expires) => expires > Instant::now(),
            None => false,
        }
    }

    /// Socket admission: the credential header, or a valid token.
    pub fn authorize(&self, headers: &HeaderMap, token: Option<&str>) -> bool {
        if self.is_open() || self.check_header(headers) {
            return true;
        }
        token.is_some_and(|t| self.redeem_token(t))
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
