//! Scoped compiler configuration.
//!
//! A [`PassContext`] is installed per thread with [`PassContext::enter`]. The returned guard
//! pops it again when dropped, which also happens while unwinding, so a failed compile never
//! leaves its configuration behind for the next one.

use std::cell::RefCell;
use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

thread_local! {
    static CONTEXT_STACK: RefCell<Vec<PassContext>> = RefCell::new(Vec::new());
}

/// Default optimization level when no context is installed.
pub const DEFAULT_OPT_LEVEL: u8 = 2;

/// Builds the configuration key under which options for `backend` are stored.
pub fn accelerator_options_key(backend: &str) -> String {
    format!("offload.ext.{backend}.options")
}

#[derive(Debug, Clone, PartialEq)]
pub struct PassContext {
    pub opt_level: u8,
    pub config: BTreeMap<String, Value>,
}

impl Default for PassContext {
    fn default() -> Self {
        Self {
            opt_level: DEFAULT_OPT_LEVEL,
            config: BTreeMap::new(),
        }
    }
}

impl PassContext {
    pub fn new(opt_level: u8) -> Self {
        Self {
            opt_level,
            config: BTreeMap::new(),
        }
    }

    pub fn with_config(mut self, key: impl Into<String>, value: Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    /// Serializes `value` into the config under `key`.
    pub fn with_typed_config<T: Serialize>(
        self,
        key: impl Into<String>,
        value: &T,
    ) -> Result<Self, serde_json::Error> {
        let value = serde_json::to_value(value)?;
        Ok(self.with_config(key, value))
    }

    /// Decodes the entry stored under `key`. Returns `Ok(None)` when the key is absent.
    pub fn get_config<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, serde_json::Error> {
        match self.config.get(key) {
            Some(value) => serde_json::from_value(value.clone()).map(Some),
            None => Ok(None),
        }
    }

    /// Installs this context as the thread's current one until the guard drops.
    pub fn enter(self) -> PassContextGuard {
        CONTEXT_STACK.with(|stack| stack.borrow_mut().push(self));
        PassContextGuard { active: true }
    }

    /// Returns a snapshot of the current context, or the default if none is installed.
    pub fn current() -> PassContext {
        CONTEXT_STACK.with(|stack| stack.borrow().last().cloned().unwrap_or_default())
    }

    /// Number of contexts currently stacked on this thread.
    pub fn depth() -> usize {
        CONTEXT_STACK.with(|stack| stack.borrow().len())
    }
}

/// RAII guard that restores the previously installed context on drop.
#[must_use = "the context is popped as soon as the guard is dropped"]
pub struct PassContextGuard {
    active: bool,
}

impl Drop for PassContextGuard {
    fn drop(&mut self) {
        if self.active {
            CONTEXT_STACK.with(|stack| {
                stack.borrow_mut().pop();
            });
            self.active = false;
        }
    }
}

/// Runs `f` with `cx` installed as the current pass context.
pub fn with_pass_context<F, R>(cx: PassContext, f: F) -> R
where
    F: FnOnce() -> R,
{
    let guard = cx.enter();
    let result = f();
    drop(guard);
    result
}
