//! Per-request configuration isolation.
//!
//! Under `merge` every call gets its own composed configuration and nothing
//! shared is touched. Under `leased` calls are serialized; the ambient
//! runtime is snapshotted, the composed configuration applied, and a drop
//! guard restores and verifies the snapshot on every exit path, including a
//! dropped future. A failed verification halts the isolator.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};

use switchboard_core::config::{RequestOverride, RuntimeBaseline, RuntimeConfiguration};
use switchboard_core::engine::AmbientRuntime;
use switchboard_core::ids::{LeaseId, RequestId};
use switchboard_telemetry::{Counter, Diagnostics};

use crate::error::IsolationError;

/// Holds the process-wide baseline. Readers get a cheap `Arc` snapshot.
pub struct BaselineStore {
    inner: RwLock<Arc<RuntimeBaseline>>,
}

impl BaselineStore {
    pub fn new(baseline: RuntimeBaseline) -> Self {
        Self {
            inner: RwLock::new(Arc::new(baseline)),
        }
    }

    pub fn snapshot(&self) -> Arc<RuntimeBaseline> {
        Arc::clone(&self.inner.read())
    }

    /// Deliberate configuration change. In-flight requests keep the snapshot
    /// they started with.
    pub fn replace(&self, baseline: RuntimeBaseline) {
        *self.inner.write() = Arc::new(baseline);
    }
}

/// Exclusivity token for one in-flight request.
#[derive(Clone, Debug)]
pub struct ExecutionLease {
    pub lease_id: LeaseId,
    pub acquired_at: DateTime<Utc>,
    pub owner_request_id: RequestId,
}

impl ExecutionLease {
    fn new(owner: &RequestId) -> Self {
        Self {
            lease_id: LeaseId::new(),
            acquired_at: Utc::now(),
            owner_request_id: owner.clone(),
        }
    }
}

enum Strategy {
    Merge,
    Leased {
        runtime: Arc<dyn AmbientRuntime>,
        lock: Arc<Mutex<()>>,
    },
}

pub struct ConfigurationIsolator {
    baseline: Arc<BaselineStore>,
    strategy: Strategy,
    halted: Arc<AtomicBool>,
    active_leases: Arc<AtomicUsize>,
    diagnostics: Arc<Diagnostics>,
}

impl ConfigurationIsolator {
    pub fn merge(baseline: Arc<BaselineStore>, diagnostics: Arc<Diagnostics>) -> Self {
        Self {
            baseline,
            strategy: Strategy::Merge,
            halted: Arc::new(AtomicBool::new(false)),
            active_leases: Arc::new(AtomicUsize::new(0)),
            diagnostics,
        }
    }

    pub fn leased(
        baseline: Arc<BaselineStore>,
        runtime: Arc<dyn AmbientRuntime>,
        diagnostics: Arc<Diagnostics>,
    ) -> Self {
        Self {
            baseline,
            strategy: Strategy::Leased {
                runtime,
                lock: Arc::new(Mutex::new(())),
            },
            halted: Arc::new(AtomicBool::new(false)),
            active_leases: Arc::new(AtomicUsize::new(0)),
            diagnostics,
        }
    }

    pub fn strategy_name(&self) -> &'static str {
        match self.strategy {
            Strategy::Merge => "merge",
            Strategy::Leased { .. } => "leased",
        }
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub fn active_leases(&self) -> usize {
        self.active_leases.load(Ordering::SeqCst)
    }

    pub fn baseline(&self) -> &Arc<BaselineStore> {
        &self.baseline
    }

    /// Run `f` under `baseline ⊕ ovr`. `f` receives the lease and the
    /// composed configuration. Its output, including any error it carries,
    /// is returned as-is; the baseline is unaffected on every exit path.
    #[instrument(skip_all, fields(request_id = %request_id, strategy = self.strategy_name()))]
    pub async fn with_override<F, Fut, T>(
        &self,
        request_id: &RequestId,
        ovr: &RequestOverride,
        f: F,
    ) -> Result<T, IsolationError>
    where
        F: FnOnce(ExecutionLease, RuntimeConfiguration) -> Fut,
        Fut: Future<Output = T>,
    {
        if self.is_halted() {
            return Err(IsolationError::Halted);
        }

        match &self.strategy {
            Strategy::Merge => {
                let configuration = ovr.compose(&self.baseline.snapshot());
                let _active = ActiveLease::enter(&self.active_leases);
                Ok(f(ExecutionLease::new(request_id), configuration).await)
            }
            Strategy::Leased { runtime, lock } => {
                let _serial = Arc::clone(lock).lock_owned().await;
                if self.is_halted() {
                    return Err(IsolationError::Halted);
                }
                let _active = ActiveLease::enter(&self.active_leases);

                let configuration = ovr.compose(&self.baseline.snapshot());
                let restore = RestoreGuard {
                    runtime: Arc::clone(runtime),
                    snapshot: runtime.current(),
                    request_id: request_id.clone(),
                    halted: Arc::clone(&self.halted),
                    diagnostics: Arc::clone(&self.diagnostics),
                    armed: true,
                };

                if let Err(e) = runtime.apply(&configuration) {
                    restore.finish()?;
                    return Err(IsolationError::Apply(e));
                }

                let out = f(ExecutionLease::new(request_id), configuration).await;
                restore.finish()?;
                Ok(out)
            }
        }
    }

    /// Operator action after a leak: put the baseline back on the ambient
    /// runtime, verify it, and resume traffic.
    #[instrument(skip(self))]
    pub async fn reconcile(&self) -> Result<(), IsolationError> {
        if let Strategy::Leased { runtime, lock } = &self.strategy {
            let _serial = lock.lock().await;
            let expected = self.baseline.snapshot().to_configuration();
            runtime.apply(&expected).map_err(IsolationError::Apply)?;
            if runtime.current() != expected {
                return Err(IsolationError::ConfigurationLeak {
                    request_id: RequestId::from_raw("reconcile"),
                    detail: "ambient configuration differs from baseline after reconcile".into(),
                });
            }
        }
        let was_halted = self.halted.swap(false, Ordering::SeqCst);
        info!(was_halted, "isolator reconciled");
        Ok(())
    }
}

struct ActiveLease {
    count: Arc<AtomicUsize>,
}

impl ActiveLease {
    fn enter(count: &Arc<AtomicUsize>) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self {
            count: Arc::clone(count),
        }
    }
}

impl Drop for ActiveLease {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
    }
}

struct RestoreGuard {
    runtime: Arc<dyn AmbientRuntime>,
    snapshot: RuntimeConfiguration,
    request_id: RequestId,
    halted: Arc<AtomicBool>,
    diagnostics: Arc<Diagnostics>,
    armed: bool,
}

impl RestoreGuard {
    fn finish(mut self) -> Result<(), IsolationError> {
        self.armed = false;
        self.restore()
    }

    fn restore(&self) -> Result<(), IsolationError> {
        let detail = match self.runtime.apply(&self.snapshot) {
            Err(e) => Some(format!("restore failed: {e}")),
            Ok(()) if self.runtime.current() != self.snapshot => {
                Some("ambient configuration differs from snapshot after restore".to_string())
            }
            Ok(()) => None,
        };

        match detail {
            None => Ok(()),
            Some(detail) => {
                self.halted.store(true, Ordering::SeqCst);
                self.diagnostics.incr(Counter::ConfigurationLeaks);
                error!(request_id = %self.request_id, %detail, "configuration leak, halting isolator");
                Err(IsolationError::ConfigurationLeak {
                    request_id: self.request_id.clone(),
                    detail,
                })
            }
        }
    }
}

impl Drop for RestoreGuard {
    fn drop(&mut self) {
        if self.armed {
            warn!(request_id = %self.request_id, "request dropped under lease, restoring");
            let _ = self.restore();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use switchboard_core::config::ToolDelta;
    use switchboard_core::tools::{ToolCategory, ToolDescriptor};
    use switchboard_core::Mode;
    use switchboard_runtime::SharedRuntime;

    fn baseline() -> RuntimeBaseline {
        RuntimeBaseline::new(
            vec!["base".into()],
            vec![
                ToolDescriptor::new("exa_search", ToolCategory::DirectAnswer),
                ToolDescriptor::new("think", ToolCategory::Reasoning),
            ]
            .into(),
        )
    }

    fn ovr(marker: &str) -> RequestOverride {
        RequestOverride::builder(Mode::Deep)
            .instructions(marker)
            .delta(ToolDelta {
                added: vec![],
                removed: vec!["exa_search".into()],
            })
            .build()
    }

    fn leased() -> (ConfigurationIsolator, Arc<SharedRuntime>, Arc<Diagnostics>) {
        let store = Arc::new(BaselineStore::new(baseline()));
        let runtime = Arc::new(SharedRuntime::new(baseline().to_configuration()));
        let diagnostics = Arc::new(Diagnostics::new());
        let iso = ConfigurationIsolator::leased(store, runtime.clone(), diagnostics.clone());
        (iso, runtime, diagnostics)
    }

    #[tokio::test]
    async fn merge_composes_without_mutation() {
        let store = Arc::new(BaselineStore::new(baseline()));
        let iso = ConfigurationIsolator::merge(store.clone(), Arc::new(Diagnostics::new()));
        let seen = iso
            .with_override(&RequestId::new(), &ovr("m1"), |lease, cfg| async move {
                assert!(lease.lease_id.as_str().starts_with("lease_"));
                cfg
            })
            .await
            .unwrap();
        assert_eq!(seen.instructions, vec!["base", "m1"]);
        assert!(!seen.tools.contains("exa_search"));
        assert_eq!(*store.snapshot(), baseline());
        assert_eq!(iso.active_leases(), 0);
    }

    #[tokio::test]
    async fn leased_applies_then_restores() {
        let (iso, runtime, _) = leased();
        let rt = runtime.clone();
        let during = iso
            .with_override(&RequestId::new(), &ovr("m1"), |_, _| async move { rt.current() })
            .await
            .unwrap();
        assert_eq!(during.instructions, vec!["base", "m1"]);
        assert_eq!(runtime.current(), baseline().to_configuration());
    }

    #[tokio::test]
    async fn leased_restores_when_f_errors() {
        let (iso, runtime, _) = leased();
        let result: Result<Result<(), String>, _> = iso
            .with_override(&RequestId::new(), &ovr("m1"), |_, _| async { Err("engine blew up".to_string()) })
            .await;
        assert_eq!(result.unwrap(), Err("engine blew up".to_string()));
        assert_eq!(runtime.current(), baseline().to_configuration());
        assert!(!iso.is_halted());
    }

    #[tokio::test(start_paused = true)]
    async fn leased_restores_when_dropped() {
        let (iso, runtime, _) = leased();
        let iso = Arc::new(iso);
        let task = {
            let iso = iso.clone();
            tokio::spawn(async move {
                iso.with_override(&RequestId::new(), &ovr("m1"), |_, _| async {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                })
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(runtime.current().instructions, vec!["base", "m1"]);

        task.abort();
        let _ = task.await;
        assert_eq!(runtime.current(), baseline().to_configuration());
        assert!(!iso.is_halted());
        assert_eq!(iso.active_leases(), 0);
    }

    #[tokio::test]
    async fn failed_restore_halts_until_reconciled() {
        let (iso, runtime, diagnostics) = leased();
        let rt = runtime.clone();
        let result = iso
            .with_override(&RequestId::new(), &ovr("m1"), |_, _| async move {
                rt.fail_next_applies(1);
            })
            .await;
        assert!(matches!(result, Err(IsolationError::ConfigurationLeak { .. })));
        assert!(iso.is_halted());
        assert_eq!(diagnostics.get(Counter::ConfigurationLeaks), 1);

        let next = iso.with_override(&RequestId::new(), &ovr("m2"), |_, _| async {}).await;
        assert!(matches!(next, Err(IsolationError::Halted)));

        iso.reconcile().await.unwrap();
        assert!(!iso.is_halted());
        assert_eq!(runtime.current(), baseline().to_configuration());
        iso.with_override(&RequestId::new(), &ovr("m3"), |_, _| async {}).await.unwrap();
    }

    #[tokio::test]
    async fn rejected_apply_leaves_runtime_clean() {
        let (iso, runtime, _) = leased();
        runtime.fail_next_applies(1);
        let result = iso.with_override(&RequestId::new(), &ovr("m1"), |_, _| async {}).await;
        assert!(matches!(result, Err(IsolationError::Apply(_))));
        assert!(!iso.is_halted());
        assert_eq!(runtime.current(), baseline().to_configuration());
    }

    #[tokio::test]
    async fn leased_serializes_calls() {
        let (iso, _, _) = leased();
        let iso = Arc::new(iso);
        let max_seen = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for i in 0..8 {
            let iso = iso.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                let inner = iso.clone();
                iso.with_override(&RequestId::new(), &ovr(&format!("m{i}")), |_, _| async move {
                    max_seen.fetch_max(inner.active_leases(), Ordering::SeqCst);
                    tokio::task::yield_now().await;
                })
                .await
                .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn baseline_replace_is_deliberate() {
        let store = BaselineStore::new(baseline());
        let before = store.snapshot();
        store.replace(RuntimeBaseline::default());
        assert_eq!(*before, baseline());
        assert!(store.snapshot().base_instructions.is_empty());
    }
}
