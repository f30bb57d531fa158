use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;

use switchboard_core::config::RuntimeConfiguration;
use switchboard_core::engine::AmbientRuntime;
use switchboard_core::errors::EngineError;

/// A process-wide runtime object whose configuration is read at call time.
///
/// Engines built on top of it see whatever configuration is applied when
/// they run, so it must only be mutated under the leased isolation strategy.
#[derive(Default)]
pub struct SharedRuntime {
    config: RwLock<RuntimeConfiguration>,
    failing_applies: AtomicUsize,
    apply_count: AtomicUsize,
}

impl SharedRuntime {
    pub fn new(initial: RuntimeConfiguration) -> Self {
        Self {
            config: RwLock::new(initial),
            failing_applies: AtomicUsize::new(0),
            apply_count: AtomicUsize::new(0),
        }
    }

    /// Make the next `n` calls to `apply` fail without changing anything.
    pub fn fail_next_applies(&self, n: usize) {
        self.failing_applies.store(n, Ordering::SeqCst);
    }

    pub fn apply_count(&self) -> usize {
        self.apply_count.load(Ordering::SeqCst)
    }
}

impl AmbientRuntime for SharedRuntime {
    fn current(&self) -> RuntimeConfiguration {
        self.config.read().clone()
    }

    fn apply(&self, configuration: &RuntimeConfiguration) -> Result<(), EngineError> {
        self.apply_count.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .failing_applies
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(EngineError::Configuration("runtime rejected configuration".into()));
        }
        *self.config.write() = configuration.clone();
        Ok(())
    }
}
