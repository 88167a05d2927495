// Recording utilities for asserting hook order

use async_trait::async_trait;
use keel_core::{Error, Interceptor, RequestContext, Result};
use parking_lot::Mutex;
use std::sync::Arc;

/// One recorded interceptor hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Hook {
    Pre(String),
    Post(String),
    /// Carries the error message when the request failed.
    After(String, Option<String>),
}

/// A log shared by several recording interceptors.
#[derive(Debug, Clone, Default)]
pub struct HookLog {
    entries: Arc<Mutex<Vec<Hook>>>,
}

impl HookLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, hook: Hook) {
        self.entries.lock().push(hook);
    }

    pub fn entries(&self) -> Vec<Hook> {
        self.entries.lock().clone()
    }

    /// Entries rendered as `pre:name`, `post:name`, `after:name`.
    pub fn names(&self) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .map(|hook| match hook {
                Hook::Pre(name) => format!("pre:{name}"),
                Hook::Post(name) => format!("post:{name}"),
                Hook::After(name, _) => format!("after:{name}"),
            })
            .collect()
    }

    pub fn count(&self, matches: impl Fn(&Hook) -> bool) -> usize {
        self.entries.lock().iter().filter(|h| matches(h)).count()
    }

    pub fn after_count(&self) -> usize {
        self.count(|h| matches!(h, Hook::After(..)))
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

/// Interceptor that records every hook it sees.
pub struct RecordingInterceptor {
    name: String,
    allow: bool,
    fail_pre: bool,
    log: HookLog,
}

impl RecordingInterceptor {
    pub fn new(name: &str, log: &HookLog) -> Self {
        Self {
            name: name.to_string(),
            allow: true,
            fail_pre: false,
            log: log.clone(),
        }
    }

    /// `pre_handle` returns `false`.
    pub fn rejecting(mut self) -> Self {
        self.allow = false;
        self
    }

    /// `pre_handle` fails with a `Forbidden` error.
    pub fn failing(mut self) -> Self {
        self.fail_pre = true;
        self
    }

    pub fn log(&self) -> &HookLog {
        &self.log
    }
}

#[async_trait]
impl Interceptor for RecordingInterceptor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn pre_handle(&self, _ctx: &mut RequestContext) -> Result<bool> {
        self.log.record(Hook::Pre(self.name.clone()));
        if self.fail_pre {
            return Err(Error::Forbidden(format!("{} refused", self.name)));
        }
        Ok(self.allow)
    }

    async fn post_handle(&self, _ctx: &mut RequestContext) -> Result<()> {
        self.log.record(Hook::Post(self.name.clone()));
        Ok(())
    }

    async fn after_completion(&self, _ctx: &mut RequestContext, error: Option<&Error>) {
        self.log.record(Hook::After(
            self.name.clone(),
            error.map(|e| e.to_string()),
        ));
    }
}
