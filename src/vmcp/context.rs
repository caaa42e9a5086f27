//! Invocation context: the per-request bundle threaded through every
//! operation of one inbound MCP call.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// One environment variable bound into a vMCP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvVar {
    pub value: String,
    #[serde(default)]
    pub secret: bool,
}

/// How a guarded future ended before producing its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupted {
    /// The absolute deadline passed.
    DeadlineExceeded,
    /// The caller went away.
    Cancelled,
}

/// Key for the request-scoped memo cache: (kind, name, canonical args).
pub type MemoKey = (&'static str, String, String);

pub struct InvocationContext {
    vmcp_id: String,
    env: HashMap<String, EnvVar>,
    deadline: Instant,
    cancel: CancellationToken,
    depth: AtomicUsize,
    max_depth: usize,
    memo: Mutex<HashMap<MemoKey, String>>,
}

impl InvocationContext {
    pub fn new(
        vmcp_id: impl Into<String>,
        env: HashMap<String, EnvVar>,
        timeout: Duration,
        max_depth: usize,
    ) -> Self {
        Self {
            vmcp_id: vmcp_id.into(),
            env,
            deadline: Instant::now() + timeout,
            cancel: CancellationToken::new(),
            depth: AtomicUsize::new(0),
            max_depth,
            memo: Mutex::new(HashMap::new()),
        }
    }

    pub fn vmcp_id(&self) -> &str {
        &self.vmcp_id
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left before the absolute deadline, zero when already past.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Run a future under this context's deadline and cancellation signal.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, Interrupted>
    where
        F: std::future::Future<Output = T>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Interrupted::Cancelled),
            _ = tokio::time::sleep_until(self.deadline) => Err(Interrupted::DeadlineExceeded),
            value = fut => Ok(value),
        }
    }

    // ------------------------------------------------------------------
    // Recursion accounting
    // ------------------------------------------------------------------

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Enter one nested template evaluation. Returns a guard that restores
    /// the depth on drop, or `None` when the bound is exceeded.
    pub fn enter_nested(&self) -> Option<DepthGuard<'_>> {
        let prev = self.depth.fetch_add(1, Ordering::AcqRel);
        if prev >= self.max_depth {
            self.depth.fetch_sub(1, Ordering::AcqRel);
            return None;
        }
        Some(DepthGuard { ctx: self })
    }

    // ------------------------------------------------------------------
    // Request-scoped memoization
    // ------------------------------------------------------------------

    pub fn memo_get(&self, key: &MemoKey) -> Option<String> {
        self.memo.lock().get(key).cloned()
    }

    pub fn memo_put(&self, key: MemoKey, value: String) {
        self.memo.lock().insert(key, value);
    }

    // ------------------------------------------------------------------
    // Environment
    // ------------------------------------------------------------------

    pub fn env_value(&self, name: &str) -> Option<&str> {
        self.env.get(name).map(|v| v.value.as_str())
    }

    pub fn env(&self) -> &HashMap<String, EnvVar> {
        &self.env
    }

    /// Replace every secret environment value occurring in `text`.
    /// Applied to every error detail before it leaves the gateway.
    pub fn scrub_secrets(&self, text: &str) -> String {
        let mut out = text.to_string();
        for var in self.env.values() {
            if var.secret && !var.value.is_empty() {
                out = out.replace(&var.value, "***");
            }
        }
        out
    }
}

pub struct DepthGuard<'a> {
    ctx: &'a InvocationContext,
}

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.ctx.depth.fetch_sub(1, Ordering::AcqRel);
    }
}
