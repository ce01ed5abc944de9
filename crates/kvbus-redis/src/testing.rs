//! In-memory stand-in for a Redis server, with fault injection.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};

use crate::client::{Backend, Connector, RedisError, RedisResult, Subscription};

/// Shared server state. Survives reconnects, like a real server would.
#[derive(Default)]
pub(crate) struct MemoryServer {
    data: Mutex<BTreeMap<String, (Vec<u8>, Option<Instant>)>>,
    channels: Mutex<HashMap<String, Vec<(u64, mpsc::UnboundedSender<Vec<u8>>)>>>,
    lists: Mutex<HashMap<String, VecDeque<Vec<u8>>>>,
    list_ready: Notify,
    next_subscriber: AtomicU64,
    scan_cursors: Mutex<HashMap<u64, String>>,
    next_cursor: AtomicU64,
    faults: AtomicUsize,
    del_batches: Mutex<Vec<usize>>,
    unsubscribes: AtomicUsize,
    commands: AtomicUsize,
    publish_delay: Mutex<Duration>,
}

impl MemoryServer {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next `n` commands fail with a connection reset.
    pub(crate) fn fail_next(&self, n: usize) {
        self.faults.store(n, Ordering::SeqCst);
    }

    /// Make every PUBLISH take `delay` before delivering.
    pub(crate) fn stall_publish(&self, delay: Duration) {
        *self.publish_delay.lock().unwrap() = delay;
    }

    pub(crate) fn del_batches(&self) -> Vec<usize> {
        self.del_batches.lock().unwrap().clone()
    }

    pub(crate) fn unsubscribes(&self) -> usize {
        self.unsubscribes.load(Ordering::SeqCst)
    }

    pub(crate) fn commands(&self) -> usize {
        self.commands.load(Ordering::SeqCst)
    }

    pub(crate) fn subscribers(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .unwrap()
            .get(channel)
            .map_or(0, Vec::len)
    }

    pub(crate) fn insert_raw(&self, key: &str, value: &[u8]) {
        self.data
            .lock()
            .unwrap()
            .insert(key.to_string(), (value.to_vec(), None));
    }

    pub(crate) fn push_raw(&self, list: &str, value: &[u8]) {
        self.lists
            .lock()
            .unwrap()
            .entry(list.to_string())
            .or_default()
            .push_front(value.to_vec());
        self.list_ready.notify_one();
    }

    pub(crate) fn list_len(&self, list: &str) -> usize {
        self.lists.lock().unwrap().get(list).map_or(0, VecDeque::len)
    }

    fn check(&self) -> RedisResult<()> {
        self.commands.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(redis::RedisError::from(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "connection reset by peer",
            ))
            .into());
        }
        Ok(())
    }

    fn live_keys(&self) -> Vec<String> {
        let mut data = self.data.lock().unwrap();
        let now = Instant::now();
        data.retain(|_, (_, deadline)| deadline.map_or(true, |d| d > now));
        data.keys().cloned().collect()
    }
}

pub(crate) struct MemoryBackend {
    server: Arc<MemoryServer>,
    closed: AtomicBool,
}

impl MemoryBackend {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn check(&self) -> RedisResult<()> {
        if self.is_closed() {
            return Err(RedisError::Closed("connection pool disposed".to_string()));
        }
        self.server.check()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn ping(&self) -> RedisResult<()> {
        self.check()
    }

    async fn get(&self, key: &str) -> RedisResult<Option<Vec<u8>>> {
        self.check()?;
        let live = self.server.live_keys();
        if !live.iter().any(|k| k == key) {
            return Ok(None);
        }
        Ok(self.server.data.lock().unwrap().get(key).map(|(v, _)| v.clone()))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<u64>) -> RedisResult<()> {
        self.check()?;
        let deadline = ttl.map(|s| Instant::now() + Duration::from_secs(s));
        self.server
            .data
            .lock()
            .unwrap()
            .insert(key.to_string(), (value.to_vec(), deadline));
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> RedisResult<u64> {
        self.check()?;
        self.server.live_keys();
        self.server.del_batches.lock().unwrap().push(keys.len());
        let mut data = self.server.data.lock().unwrap();
        Ok(keys.iter().filter(|k| data.remove(*k).is_some()).count() as u64)
    }

    async fn exists(&self, key: &str) -> RedisResult<bool> {
        self.check()?;
        Ok(self.server.live_keys().iter().any(|k| k == key))
    }

    async fn expire(&self, key: &str, seconds: i64) -> RedisResult<bool> {
        self.check()?;
        self.server.live_keys();
        let mut data = self.server.data.lock().unwrap();
        match data.get_mut(key) {
            Some(entry) => {
                entry.1 = Some(Instant::now() + Duration::from_secs(seconds.max(0) as u64));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> RedisResult<(u64, Vec<String>)> {
        self.check()?;
        let matcher = glob::Pattern::new(pattern)
            .map_err(|e| RedisError::OperationFailed(e.to_string()))?;
        let after = match cursor {
            0 => None,
            id => self.server.scan_cursors.lock().unwrap().remove(&id),
        };
        let keys = self.server.live_keys();
        let remaining: Vec<&String> = keys
            .iter()
            .filter(|k| after.as_ref().map_or(true, |last| *k > last))
            .collect();
        let examined = &remaining[..count.max(1).min(remaining.len())];
        let found = examined
            .iter()
            .filter(|k| matcher.matches(k))
            .map(|k| k.to_string())
            .collect();
        let next = match examined.last() {
            Some(last) if examined.len() < remaining.len() => {
                let id = self.server.next_cursor.fetch_add(1, Ordering::SeqCst) + 1;
                self.server
                    .scan_cursors
                    .lock()
                    .unwrap()
                    .insert(id, last.to_string());
                id
            }
            _ => 0,
        };
        Ok((next, found))
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> RedisResult<usize> {
        self.check()?;
        let delay = *self.server.publish_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let channels = self.server.channels.lock().unwrap();
        let delivered = channels
            .get(channel)
            .map(|subs| {
                subs.iter()
                    .filter(|(_, tx)| tx.send(payload.to_vec()).is_ok())
                    .count()
            })
            .unwrap_or(0);
        Ok(delivered)
    }

    async fn subscribe(&self, channel: &str) -> RedisResult<Box<dyn Subscription>> {
        self.check()?;
        let id = self.server.next_subscriber.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.server
            .channels
            .lock()
            .unwrap()
            .entry(channel.to_string())
            .or_default()
            .push((id, tx));
        Ok(Box::new(MemorySubscription {
            server: self.server.clone(),
            channel: channel.to_string(),
            id,
            rx,
        }))
    }

    async fn push(&self, list: &str, value: &[u8]) -> RedisResult<()> {
        self.check()?;
        self.server.push_raw(list, value);
        Ok(())
    }

    async fn pop(&self, list: &str, wait: Duration) -> RedisResult<Option<Vec<u8>>> {
        self.check()?;
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let popped = self
                .server
                .lists
                .lock()
                .unwrap()
                .get_mut(list)
                .and_then(VecDeque::pop_back);
            if popped.is_some() {
                return Ok(popped);
            }
            let ready = self.server.list_ready.notified();
            if tokio::time::timeout_at(deadline, ready).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct MemorySubscription {
    server: Arc<MemoryServer>,
    channel: String,
    id: u64,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next_message(&mut self, wait: Duration) -> RedisResult<Option<Vec<u8>>> {
        self.server.check()?;
        match tokio::time::timeout(wait, self.rx.recv()).await {
            Ok(Some(payload)) => Ok(Some(payload)),
            Ok(None) => Err(RedisError::Closed("subscription dropped".to_string())),
            Err(_) => Ok(None),
        }
    }

    async fn unsubscribe(&mut self) -> RedisResult<()> {
        if let Some(subs) = self.server.channels.lock().unwrap().get_mut(&self.channel) {
            subs.retain(|(id, _)| *id != self.id);
        }
        self.server.unsubscribes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Connector handing out backends over one [`MemoryServer`].
pub(crate) struct MemoryConnector {
    pub(crate) server: Arc<MemoryServer>,
    connects: AtomicUsize,
    refuse: AtomicBool,
    delay: Duration,
    opened: Mutex<Vec<Arc<MemoryBackend>>>,
}

impl MemoryConnector {
    pub(crate) fn new(server: Arc<MemoryServer>) -> Arc<Self> {
        Self::with_delay(server, Duration::ZERO)
    }

    /// Connects take `delay`, widening init races.
    pub(crate) fn with_delay(server: Arc<MemoryServer>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            server,
            connects: AtomicUsize::new(0),
            refuse: AtomicBool::new(false),
            delay,
            opened: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Every backend opened so far, oldest first.
    pub(crate) fn opened(&self) -> Vec<Arc<MemoryBackend>> {
        self.opened.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> RedisResult<Arc<dyn Backend>> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.refuse.load(Ordering::SeqCst) {
            return Err(redis::RedisError::from(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            ))
            .into());
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        let backend = Arc::new(MemoryBackend {
            server: self.server.clone(),
            closed: AtomicBool::new(false),
        });
        self.opened.lock().unwrap().push(backend.clone());
        Ok(backend)
    }

    fn target(&self) -> String {
        "memory".to_string()
    }
}
