//! Per-user, per-operation-class token buckets guarding mutating calls.
//!
//! Limiter state lives only for the life of the process and is never shared
//! across instances. Destructive folder operations get stricter budgets than
//! plain file writes.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpClass {
    SaveFile,
    CreateFile,
    CreateFolder,
    Rename,
    DeleteFile,
    DeleteFolder,
}

impl OpClass {
    /// (tokens per window, window length)
    fn budget(self) -> (u32, Duration) {
        match self {
            OpClass::SaveFile | OpClass::CreateFile | OpClass::Rename | OpClass::DeleteFile => {
                (3, Duration::from_secs(1))
            }
            OpClass::CreateFolder | OpClass::DeleteFolder => (1, Duration::from_secs(2)),
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: u32,
    window_start: Instant,
}

#[derive(Default)]
pub struct RateLimiter {
    buckets: Mutex<HashMap<(String, OpClass), Bucket>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit one call for `(user, class)` or fail with `RateLimited`.
    pub fn consume(&self, user: &str, class: OpClass) -> Result<()> {
        self.consume_at(user, class, Instant::now())
    }

    fn consume_at(&self, user: &str, class: OpClass, now: Instant) -> Result<()> {
        let (capacity, window) = class.budget();
        let mut buckets = self.buckets.lock().expect("limiter mutex poisoned");
        let bucket = buckets
            .entry((user.to_string(), class))
            .or_insert(Bucket { tokens: capacity, window_start: now });

        if now.duration_since(bucket.window_start) >= window {
            bucket.tokens = capacity;
            bucket.window_start = now;
        }

        if bucket.tokens == 0 {
            return Err(Error::RateLimited(
                "you are sending too many requests, please try again later".to_string(),
            ));
        }
        bucket.tokens -= 1;
        Ok(())
    }
}
