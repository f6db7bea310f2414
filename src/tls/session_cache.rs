//! Single-slot client TLS session cache
//!
//! Holds the last session material handed out by a server so the next
//! outbound connection can resume it. The slot is process-wide and
//! lossy: a newer session silently replaces the old one.

use rustls::client::{ClientSessionStore, Tls12ClientSessionValue, Tls13ClientSessionValue};
use rustls::pki_types::ServerName;
use rustls::NamedGroup;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Default)]
struct Slot {
    kx_hint: Option<(ServerName<'static>, NamedGroup)>,
    tls12: Option<(ServerName<'static>, Tls12ClientSessionValue, Instant)>,
    tls13: Option<(ServerName<'static>, Tls13ClientSessionValue, Instant)>,
}

/// A `ClientSessionStore` holding at most one session
#[derive(Default)]
pub struct SingleSessionCache {
    slot: Mutex<Slot>,
    /// Stored sessions older than this are never handed out
    timeout: Option<Duration>,
}

impl std::fmt::Debug for SingleSessionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleSessionCache")
            .field("primed", &self.is_primed())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl SingleSessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache whose entries expire after `timeout`
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            slot: Mutex::new(Slot::default()),
            timeout: Some(timeout),
        }
    }

    /// Whether any resumable state is currently cached
    pub fn is_primed(&self) -> bool {
        let slot = self.slot.lock().unwrap();
        slot.tls12.is_some() || slot.tls13.is_some()
    }

    fn expired(&self, stored_at: Instant) -> bool {
        self.timeout
            .is_some_and(|timeout| stored_at.elapsed() > timeout)
    }
}

impl ClientSessionStore for SingleSessionCache {
    fn set_kx_hint(&self, server_name: ServerName<'static>, group: NamedGroup) {
        self.slot.lock().unwrap().kx_hint = Some((server_name, group));
    }

    fn kx_hint(&self, server_name: &ServerName<'_>) -> Option<NamedGroup> {
        let slot = self.slot.lock().unwrap();
        slot.kx_hint
            .as_ref()
            .filter(|(name, _)| name == server_name)
            .map(|(_, group)| *group)
    }

    fn set_tls12_session(&self, server_name: ServerName<'static>, value: Tls12ClientSessionValue) {
        self.slot.lock().unwrap().tls12 = Some((server_name, value, Instant::now()));
    }

    fn tls12_session(&self, server_name: &ServerName<'_>) -> Option<Tls12ClientSessionValue> {
        let slot = self.slot.lock().unwrap();
        slot.tls12
            .as_ref()
            .filter(|(name, _, stored_at)| name == server_name && !self.expired(*stored_at))
            .map(|(_, value, _)| value.clone())
    }

    fn remove_tls12_session(&self, server_name: &ServerName<'_>) {
        let mut slot = self.slot.lock().unwrap();
        if slot.tls12.as_ref().is_some_and(|(name, ..)| name == server_name) {
            slot.tls12 = None;
        }
    }

    fn insert_tls13_ticket(&self, server_name: ServerName<'static>, value: Tls13ClientSessionValue) {
        self.slot.lock().unwrap().tls13 = Some((server_name, value, Instant::now()));
    }

    fn take_tls13_ticket(&self, server_name: &ServerName<'_>) -> Option<Tls13ClientSessionValue> {
        let mut slot = self.slot.lock().unwrap();
        match slot.tls13.take() {
            Some((name, value, stored_at))
                if &name == server_name && !self.expired(stored_at) =>
            {
                Some(value)
            }
            Some(other) if &other.0 != server_name => {
                // Not ours; put it back
                slot.tls13 = Some(other);
                None
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kx_hint_by_name() {
        let cache = SingleSessionCache::new();
        let name = ServerName::try_from("example.com").unwrap();
        cache.set_kx_hint(name.clone(), NamedGroup::X25519);

        assert_eq!(cache.kx_hint(&name), Some(NamedGroup::X25519));

        let other = ServerName::try_from("example.org").unwrap();
        assert_eq!(cache.kx_hint(&other), None);
    }

    #[test]
    fn test_kx_hint_overwrite_is_lossy() {
        let cache = SingleSessionCache::new();
        let a = ServerName::try_from("a.example").unwrap();
        let b = ServerName::try_from("b.example").unwrap();
        cache.set_kx_hint(a.clone(), NamedGroup::X25519);
        cache.set_kx_hint(b.clone(), NamedGroup::secp256r1);

        assert_eq!(cache.kx_hint(&a), None);
        assert_eq!(cache.kx_hint(&b), Some(NamedGroup::secp256r1));
    }

    #[test]
    fn test_starts_unprimed() {
        assert!(!SingleSessionCache::new().is_primed());
    }
}
