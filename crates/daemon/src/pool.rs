//! Keyed pool of upstream TCP connections.
//!
//! The pool is a bounded map from [`EndpointKey`] to one persistent
//! socket with lifecycle metadata. Ownership follows a checkout model:
//! `acquire` removes the entry from the map and hands it to the caller,
//! `release` puts it back, so at most one in-flight request ever owns a
//! given pooled socket. Leased entries still count toward the size cap
//! and appear in snapshots.
//!
//! Eviction is LRU by last use. Before reuse every socket passes a
//! zero-timeout liveness probe; a probe failure counts as a pool miss
//! and the caller reconnects.

use std::collections::HashMap;
use std::io;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};

use tokio::net::TcpStream;
use tracing::{debug, info, trace};

use sockpool_common::{ConnectionId, EndpointKey};

/// One pooled upstream connection.
#[derive(Debug)]
pub struct PoolEntry {
    pub key: EndpointKey,
    pub socket: TcpStream,
    /// Unique id for log correlation
    pub connection_id: ConnectionId,
    /// Wall-clock creation time, for reporting
    pub created_at: SystemTime,
    opened_at: Instant,
    last_used_at: Instant,
    pub usage_count: u64,
}

impl PoolEntry {
    fn new(key: EndpointKey, socket: TcpStream) -> Self {
        let now = Instant::now();
        Self {
            key,
            socket,
            connection_id: ConnectionId::new(),
            created_at: SystemTime::now(),
            opened_at: now,
            last_used_at: now,
            usage_count: 1,
        }
    }

    /// Time since this connection was opened.
    pub fn age(&self) -> Duration {
        self.opened_at.elapsed()
    }

    /// Time since this connection last carried a request.
    pub fn idle_for(&self) -> Duration {
        self.last_used_at.elapsed()
    }

    #[cfg(test)]
    fn backdate(&mut self, by: Duration) {
        self.last_used_at -= by;
    }
}

/// Point-in-time view of the pool, without the sockets.
#[derive(Debug, Clone)]
pub struct PoolSnapshot {
    pub size: usize,
    pub max_size: usize,
    pub keys: Vec<EndpointKey>,
}

struct Inner {
    entries: HashMap<EndpointKey, PoolEntry>,
    /// Keys currently checked out, with lease counts. Distinct requests
    /// to the same endpoint may briefly hold separate sockets.
    leased: HashMap<EndpointKey, usize>,
    leased_total: usize,
}

/// Bounded keyed pool with LRU eviction.
///
/// All operations are short and lock-free of I/O; the single mutex is
/// only ever held for map manipulation and the non-blocking probe.
pub struct ConnectionPool {
    max_size: usize,
    inner: Mutex<Inner>,
}

impl ConnectionPool {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                leased: HashMap::new(),
                leased_total: 0,
            }),
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Check out the pooled connection for an endpoint.
    ///
    /// Returns `None` on a miss — no entry, or an entry whose socket
    /// failed the liveness probe (it is destroyed). On a hit the
    /// entry's `last_used_at` is refreshed and `usage_count`
    /// incremented before it is handed out.
    pub fn acquire(&self, key: &EndpointKey) -> Option<PoolEntry> {
        let mut inner = self.inner.lock().expect("pool lock poisoned");
        let mut entry = inner.entries.remove(key)?;

        if !socket_is_alive(&entry.socket) {
            debug!(
                endpoint = %key,
                connection_id = %entry.connection_id,
                "Pooled socket failed liveness probe, destroying"
            );
            return None;
        }

        entry.last_used_at = Instant::now();
        entry.usage_count += 1;
        *inner.leased.entry(key.clone()).or_insert(0) += 1;
        inner.leased_total += 1;
        trace!(
            endpoint = %key,
            connection_id = %entry.connection_id,
            usage_count = entry.usage_count,
            "Pool hit"
        );
        Some(entry)
    }

    /// Register a freshly connected socket as a leased entry.
    ///
    /// Runs exactly one LRU eviction first when the pool (checked-in
    /// plus leased) is at capacity, so `size ≤ max_size` holds across
    /// the insertion.
    pub fn register(&self, key: EndpointKey, socket: TcpStream) -> PoolEntry {
        let mut inner = self.inner.lock().expect("pool lock poisoned");
        if inner.entries.len() + inner.leased_total >= self.max_size {
            if let Some(victim) = lru_key(&inner.entries) {
                if let Some(evicted) = inner.entries.remove(&victim) {
                    info!(
                        endpoint = %victim,
                        connection_id = %evicted.connection_id,
                        "Pool at capacity, evicted least recently used connection"
                    );
                }
            }
        }
        *inner.leased.entry(key.clone()).or_insert(0) += 1;
        inner.leased_total += 1;
        let entry = PoolEntry::new(key, socket);
        debug!(
            endpoint = %entry.key,
            connection_id = %entry.connection_id,
            "Registered new upstream connection"
        );
        entry
    }

    /// Check a leased entry back in, refreshing its last-use time.
    ///
    /// If another request raced a newer connection in under the same
    /// key, the incoming entry replaces it (the older socket is
    /// destroyed).
    pub fn release(&self, mut entry: PoolEntry) {
        let mut inner = self.inner.lock().expect("pool lock poisoned");
        release_lease(&mut inner, &entry.key);
        entry.last_used_at = Instant::now();
        if let Some(previous) = inner.entries.insert(entry.key.clone(), entry) {
            debug!(
                endpoint = %previous.key,
                connection_id = %previous.connection_id,
                "Replaced pooled connection for endpoint"
            );
        }
    }

    /// Destroy a leased entry without returning it to the pool.
    pub fn discard(&self, entry: PoolEntry) {
        let mut inner = self.inner.lock().expect("pool lock poisoned");
        release_lease(&mut inner, &entry.key);
        debug!(
            endpoint = %entry.key,
            connection_id = %entry.connection_id,
            "Discarded upstream connection"
        );
    }

    /// Tear down the checked-in entry for an endpoint. Idempotent.
    pub fn remove(&self, key: &EndpointKey) -> bool {
        let mut inner = self.inner.lock().expect("pool lock poisoned");
        match inner.entries.remove(key) {
            Some(entry) => {
                info!(
                    endpoint = %key,
                    connection_id = %entry.connection_id,
                    usage_count = entry.usage_count,
                    "Closed pooled connection"
                );
                true
            }
            None => false,
        }
    }

    /// Evict entries idle longer than `ttl`. Returns the evicted keys.
    pub fn evict_expired(&self, ttl: Duration) -> Vec<EndpointKey> {
        let mut inner = self.inner.lock().expect("pool lock poisoned");
        let expired: Vec<EndpointKey> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.idle_for() > ttl)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            if let Some(entry) = inner.entries.remove(key) {
                debug!(
                    endpoint = %key,
                    connection_id = %entry.connection_id,
                    idle_ms = entry.idle_for().as_millis() as u64,
                    "Evicted idle-expired connection"
                );
            }
        }
        expired
    }

    /// Evict the least recently used checked-in entry, if any.
    pub fn evict_oldest(&self) -> Option<EndpointKey> {
        let mut inner = self.inner.lock().expect("pool lock poisoned");
        let victim = lru_key(&inner.entries)?;
        inner.entries.remove(&victim);
        Some(victim)
    }

    /// Total entries, leased included.
    pub fn size(&self) -> usize {
        let inner = self.inner.lock().expect("pool lock poisoned");
        inner.entries.len() + inner.leased_total
    }

    /// Snapshot of size and keys, without copying sockets.
    pub fn snapshot(&self) -> PoolSnapshot {
        let inner = self.inner.lock().expect("pool lock poisoned");
        let mut keys: Vec<EndpointKey> = inner
            .entries
            .keys()
            .chain(inner.leased.keys())
            .cloned()
            .collect();
        keys.sort();
        keys.dedup();
        PoolSnapshot {
            size: inner.entries.len() + inner.leased_total,
            max_size: self.max_size,
            keys,
        }
    }

    /// Destroy every checked-in connection. Returns how many were closed.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock().expect("pool lock poisoned");
        let count = inner.entries.len();
        inner.entries.clear();
        count
    }

    #[cfg(test)]
    fn backdate(&self, key: &EndpointKey, by: Duration) {
        let mut inner = self.inner.lock().expect("pool lock poisoned");
        if let Some(entry) = inner.entries.get_mut(key) {
            entry.backdate(by);
        }
    }

    #[cfg(test)]
    fn set_last_used(&self, key: &EndpointKey, at: Instant) {
        let mut inner = self.inner.lock().expect("pool lock poisoned");
        if let Some(entry) = inner.entries.get_mut(key) {
            entry.last_used_at = at;
        }
    }
}

fn release_lease(inner: &mut Inner, key: &EndpointKey) {
    if let Some(count) = inner.leased.get_mut(key) {
        *count -= 1;
        if *count == 0 {
            inner.leased.remove(key);
        }
    }
    inner.leased_total = inner.leased_total.saturating_sub(1);
}

/// Least recently used key; ties broken by canonical key order so the
/// choice is deterministic.
fn lru_key(entries: &HashMap<EndpointKey, PoolEntry>) -> Option<EndpointKey> {
    entries
        .iter()
        .min_by(|(ka, ea), (kb, eb)| {
            ea.last_used_at
                .cmp(&eb.last_used_at)
                .then_with(|| ka.cmp(kb))
        })
        .map(|(key, _)| key.clone())
}

/// Zero-timeout readiness probe.
///
/// An idle pooled socket should have nothing to read: `WouldBlock`
/// means alive, EOF means the peer closed, and stray readable bytes
/// mean the request/reply framing is out of sync — both of the latter
/// make the socket unusable for the next exchange.
fn socket_is_alive(socket: &TcpStream) -> bool {
    let mut probe = [0u8; 1];
    match socket.try_read(&mut probe) {
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => true,
        Ok(0) => false,
        Ok(_) => false,
        Err(_) => false,
    }
}
