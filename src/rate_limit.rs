//! Per-model request pacing.
//!
//! Each model owns a bucket of `rate_limit_per_minute` tokens. A spent token comes
//! back exactly one window (60 s) after it was spent, so no rolling window ever
//! admits more than the capacity. Buckets are locked individually; the outer map
//! is only write-locked while registering models.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::time::{sleep_until, Instant};
use tracing::debug;

use crate::registry::ModelRegistry;

pub const WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct Bucket {
    capacity: usize,
    /// Spend times of tokens still out, oldest first.
    spent: Mutex<VecDeque<Instant>>,
}

impl Bucket {
    fn new(capacity: u32) -> Self {
        Self {
            capacity: capacity.max(1) as usize,
            spent: Mutex::new(VecDeque::new()),
        }
    }

    fn try_take(&self, now: Instant) -> Result<(), Duration> {
        let mut spent = self.spent.lock().unwrap_or_else(|e| e.into_inner());
        while let Some(&oldest) = spent.front() {
            if oldest + WINDOW <= now {
                spent.pop_front();
            } else {
                break;
            }
        }
        if spent.len() < self.capacity {
            spent.push_back(now);
            return Ok(());
        }
        let oldest = spent.front().copied().unwrap_or(now);
        Err((oldest + WINDOW).saturating_duration_since(now))
    }

    fn available(&self, now: Instant) -> usize {
        let spent = self.spent.lock().unwrap_or_else(|e| e.into_inner());
        let out = spent.iter().filter(|&&t| t + WINDOW > now).count();
        self.capacity.saturating_sub(out)
    }
}

#[derive(Debug, Default)]
pub struct RateLimiter {
    buckets: RwLock<HashMap<String, Arc<Bucket>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// One bucket per enabled model.
    pub fn from_registry(registry: &ModelRegistry) -> Self {
        let limiter = Self::new();
        for model in registry.list_enabled() {
            limiter.register(&model.id, model.rate_limit_per_minute);
        }
        limiter
    }

    /// Add or replace the bucket for `model_id`. Replacing resets its history.
    pub fn register(&self, model_id: &str, per_minute: u32) {
        let mut buckets = self.buckets.write().unwrap_or_else(|e| e.into_inner());
        buckets.insert(model_id.to_string(), Arc::new(Bucket::new(per_minute)));
    }

    fn bucket(&self, model_id: &str) -> Option<Arc<Bucket>> {
        let buckets = self.buckets.read().unwrap_or_else(|e| e.into_inner());
        buckets.get(model_id).cloned()
    }

    /// Take a token if one is free, else return how long until the next one is.
    ///
    /// Models without a bucket are not paced.
    pub fn try_acquire(&self, model_id: &str) -> Result<(), Duration> {
        match self.bucket(model_id) {
            Some(bucket) => bucket.try_take(Instant::now()),
            None => {
                debug!(model = model_id, "no rate-limit bucket registered");
                Ok(())
            }
        }
    }

    /// Suspend until a token is free.
    pub async fn acquire(&self, model_id: &str) {
        while let Err(wait) = self.try_acquire(model_id) {
            sleep_until(Instant::now() + wait).await;
        }
    }

    /// Suspend for a token only while one would free up before `deadline`.
    /// Otherwise returns the remaining wait without taking a token.
    pub async fn acquire_before(&self, model_id: &str, deadline: Instant) -> Result<(), Duration> {
        loop {
            match self.try_acquire(model_id) {
                Ok(()) => return Ok(()),
                Err(wait) => {
                    let wake = Instant::now() + wait;
                    if wake > deadline {
                        return Err(wait);
                    }
                    sleep_until(wake).await;
                }
            }
        }
    }

    /// Tokens currently free for `model_id`; `None` for unknown models.
    pub fn available(&self, model_id: &str) -> Option<usize> {
        self.bucket(model_id).map(|b| b.available(Instant::now()))
    }
}
