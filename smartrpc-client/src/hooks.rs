//! Call hooks.
//!
//! Observers registered here run synchronously before each call is sent,
//! in registration order. They see an immutable snapshot of the call.

use crate::medium::MediumInfo;
use bytes::Bytes;
use parking_lot::RwLock;
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Snapshot of a call, taken before any bytes are written.
#[derive(Debug, Clone)]
pub struct CallHookParams {
    pub method: Bytes,
    pub args: Vec<Bytes>,
    pub body: Option<Bytes>,
    /// The encoded readv ranges, for readv calls.
    pub readv_body: Option<Bytes>,
    pub medium: MediumInfo,
}

type CallHook = Arc<dyn Fn(&CallHookParams) + Send + Sync>;

/// A registry of call observers.
#[derive(Default)]
pub struct SmartClientHooks {
    call: RwLock<Vec<(String, CallHook)>>,
}

impl SmartClientHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry used by clients that were not given one.
    pub fn global() -> Arc<SmartClientHooks> {
        static GLOBAL: OnceLock<Arc<SmartClientHooks>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(SmartClientHooks::new())).clone()
    }

    /// Registers `hook` under `name`. Names are for diagnostics only.
    pub fn install_call_hook<F>(&self, name: impl Into<String>, hook: F)
    where
        F: Fn(&CallHookParams) + Send + Sync + 'static,
    {
        self.call.write().push((name.into(), Arc::new(hook)));
    }

    /// Names of the registered call hooks, in registration order.
    pub fn call_hook_names(&self) -> Vec<String> {
        self.call.read().iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.call.read().is_empty()
    }

    /// Invokes every call hook with `params`.
    pub fn run_call_hooks(&self, params: &CallHookParams) {
        // Snapshot so a hook may register further hooks without deadlocking.
        let hooks: Vec<CallHook> = self.call.read().iter().map(|(_, h)| h.clone()).collect();
        for hook in hooks {
            hook(params);
        }
    }
}

impl fmt::Debug for SmartClientHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmartClientHooks")
            .field("call", &self.call_hook_names())
            .finish()
    }
}
