use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crystal_protocol::{MetricSample, ResolvedTarget};
use crystal_rules::{ActionInfo, Condition, ObjectFilter};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::fanout::SampleObserver;
use crate::lifecycle::MonitorManager;

/// Lifecycle variant of a monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorKind {
    /// Re-arms after every firing and runs until stopped.
    Persistent,
    /// Fires once and retires.
    Transient,
}

impl MonitorKind {
    pub fn for_action(action: &ActionInfo) -> Self {
        if action.transient {
            MonitorKind::Transient
        } else {
            MonitorKind::Persistent
        }
    }
}

impl fmt::Display for MonitorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitorKind::Persistent => f.write_str("persistent"),
            MonitorKind::Transient => f.write_str("transient"),
        }
    }
}

/// What a monitor wants after its action ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireVerdict {
    Continue,
    Retire,
}

/// Capabilities shared by every monitor variant.
pub trait PolicyMonitor: Send {
    /// Records the sample. Returns `true` when the action should fire now.
    fn on_sample(&mut self, sample: &MetricSample) -> bool;

    fn evaluate_condition(&self) -> bool;

    /// Called once the action for a firing has completed.
    fn on_fire(&mut self, dispatched: bool) -> FireVerdict;

    /// Idempotent.
    fn stop(&mut self);

    fn is_stopped(&self) -> bool;
}

/// State common to both variants.
#[derive(Debug, Clone)]
pub struct MonitorState {
    pub policy_id: u64,
    condition: Condition,
    latest: HashMap<String, f64>,
    armed: bool,
    stopped: bool,
}

impl MonitorState {
    pub fn new(policy_id: u64, condition: Condition) -> Self {
        Self {
            policy_id,
            condition,
            latest: HashMap::new(),
            armed: true,
            stopped: false,
        }
    }
}

/// Monitor state machine, tagged by lifecycle variant.
#[derive(Debug, Clone)]
pub enum Monitor {
    Persistent(MonitorState),
    Transient(MonitorState),
}

impl Monitor {
    pub fn new(kind: MonitorKind, policy_id: u64, condition: Condition) -> Self {
        let state = MonitorState::new(policy_id, condition);
        match kind {
            MonitorKind::Persistent => Monitor::Persistent(state),
            MonitorKind::Transient => Monitor::Transient(state),
        }
    }

    pub fn kind(&self) -> MonitorKind {
        match self {
            Monitor::Persistent(_) => MonitorKind::Persistent,
            Monitor::Transient(_) => MonitorKind::Transient,
        }
    }

    pub fn state(&self) -> &MonitorState {
        match self {
            Monitor::Persistent(state) | Monitor::Transient(state) => state,
        }
    }

    fn state_mut(&mut self) -> &mut MonitorState {
        match self {
            Monitor::Persistent(state) | Monitor::Transient(state) => state,
        }
    }
}

impl PolicyMonitor for Monitor {
    fn on_sample(&mut self, sample: &MetricSample) -> bool {
        if self.is_stopped() || !self.state().condition.references(&sample.metric_name) {
            return false;
        }
        self.state_mut()
            .latest
            .insert(sample.metric_name.clone(), sample.value);

        let holds = self.evaluate_condition();
        let state = self.state_mut();
        match (holds, state.armed) {
            (true, true) => {
                state.armed = false;
                true
            }
            (false, false) => {
                state.armed = true;
                false
            }
            _ => false,
        }
    }

    fn evaluate_condition(&self) -> bool {
        let state = self.state();
        state.condition.evaluate(&state.latest)
    }

    fn on_fire(&mut self, dispatched: bool) -> FireVerdict {
        if !dispatched {
            self.state_mut().armed = true;
            return FireVerdict::Continue;
        }
        match self {
            Monitor::Persistent(_) => FireVerdict::Continue,
            Monitor::Transient(state) => {
                state.stopped = true;
                FireVerdict::Retire
            }
        }
    }

    fn stop(&mut self) {
        self.state_mut().stopped = true;
    }

    fn is_stopped(&self) -> bool {
        self.state().stopped
    }
}

/// What a monitor dispatches when it fires.
#[derive(Debug, Clone)]
pub struct MonitorBinding {
    pub target: ResolvedTarget,
    pub action: ActionInfo,
    pub object_filter: Option<ObjectFilter>,
}

/// Handle to a running monitor task. Samples are queued to the task so
/// delivery never waits on evaluation or dispatch.
pub struct MonitorHandle {
    policy_id: u64,
    kind: MonitorKind,
    target: ResolvedTarget,
    samples: mpsc::UnboundedSender<MetricSample>,
    stop_signal: Arc<Notify>,
    stopped: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MonitorHandle {
    pub fn policy_id(&self) -> u64 {
        self.policy_id
    }

    pub fn kind(&self) -> MonitorKind {
        self.kind
    }

    pub fn target(&self) -> &ResolvedTarget {
        &self.target
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Stops the task without waiting for queued samples. Safe to call repeatedly.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.stop_signal.notify_one();
            debug!(policy_id = self.policy_id, "monitor stop requested");
        }
    }

    /// Waits for the task to exit. An in-flight dispatch finishes first.
    pub async fn join(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(policy_id = self.policy_id, error = ?err, "monitor task ended abnormally");
            }
        }
    }
}

impl SampleObserver for MonitorHandle {
    fn policy_id(&self) -> u64 {
        self.policy_id
    }

    fn on_sample(&self, sample: &MetricSample) -> Result<(), String> {
        if self.is_stopped() {
            return Ok(());
        }
        self.samples
            .send(sample.clone())
            .map_err(|_| format!("monitor for policy {} is no longer running", self.policy_id))
    }
}

/// Starts the task driving `monitor` and returns its handle.
pub(crate) fn start(
    monitor: Monitor,
    binding: MonitorBinding,
    manager: MonitorManager,
) -> Arc<MonitorHandle> {
    let (sender, receiver) = mpsc::unbounded_channel();
    let stop_signal = Arc::new(Notify::new());
    let stopped = Arc::new(AtomicBool::new(false));

    let handle = Arc::new(MonitorHandle {
        policy_id: monitor.state().policy_id,
        kind: monitor.kind(),
        target: binding.target.clone(),
        samples: sender,
        stop_signal: stop_signal.clone(),
        stopped: stopped.clone(),
        task: Mutex::new(None),
    });

    let task = tokio::spawn(run(monitor, binding, receiver, stop_signal, stopped, manager));
    *handle.task.lock() = Some(task);
    handle
}

async fn run(
    mut monitor: Monitor,
    binding: MonitorBinding,
    mut samples: mpsc::UnboundedReceiver<MetricSample>,
    stop_signal: Arc<Notify>,
    stopped: Arc<AtomicBool>,
    manager: MonitorManager,
) {
    let policy_id = monitor.state().policy_id;
    info!(policy_id, kind = %monitor.kind(), target_id = %binding.target.target_id(), "monitor started");

    loop {
        let sample = tokio::select! {
            biased;
            _ = stop_signal.notified() => break,
            next = samples.recv() => match next {
                Some(sample) => sample,
                None => break,
            },
        };
        if stopped.load(Ordering::SeqCst) {
            break;
        }

        if !monitor.on_sample(&sample) {
            continue;
        }

        info!(policy_id, metric = %sample.metric_name, value = sample.value, "condition met, firing");
        let outcome = manager
            .dispatcher()
            .apply(&binding.target, &binding.action, binding.object_filter.as_ref())
            .await;
        if let Err(err) = &outcome {
            warn!(policy_id, error = %err, "policy action failed, monitor re-armed");
        }

        let dispatched = outcome.is_ok();
        match monitor.on_fire(dispatched) {
            FireVerdict::Retire => {
                if !stopped.load(Ordering::SeqCst) {
                    manager.retire(policy_id).await;
                }
                break;
            }
            FireVerdict::Continue if dispatched => manager.after_persistent_fire(policy_id).await,
            FireVerdict::Continue => {}
        }
    }

    monitor.stop();
    debug!(policy_id, "monitor task exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crystal_rules::Comparison;

    fn condition() -> Condition {
        Condition::compare("put_bw", Comparison::GreaterThan, 100.0)
    }

    fn sample(metric: &str, value: f64) -> MetricSample {
        MetricSample::new("t1", metric, value)
    }

    #[test]
    fn persistent_fires_on_rising_edge_and_rearms() {
        let mut monitor = Monitor::new(MonitorKind::Persistent, 1, condition());

        assert!(!monitor.on_sample(&sample("put_bw", 50.0)));
        assert!(monitor.on_sample(&sample("put_bw", 150.0)));
        assert_eq!(monitor.on_fire(true), FireVerdict::Continue);

        assert!(!monitor.on_sample(&sample("put_bw", 170.0)));
        assert!(!monitor.on_sample(&sample("put_bw", 20.0)));
        assert!(monitor.on_sample(&sample("put_bw", 120.0)));
    }

    #[test]
    fn transient_retires_after_successful_fire() {
        let mut monitor = Monitor::new(MonitorKind::Transient, 1, condition());
        assert!(monitor.on_sample(&sample("put_bw", 150.0)));
        assert_eq!(monitor.on_fire(true), FireVerdict::Retire);
        assert!(monitor.is_stopped());
        assert!(!monitor.on_sample(&sample("put_bw", 10.0)));
        assert!(!monitor.on_sample(&sample("put_bw", 150.0)));
    }

    #[test]
    fn failed_dispatch_rearms_both_variants() {
        for kind in [MonitorKind::Persistent, MonitorKind::Transient] {
            let mut monitor = Monitor::new(kind, 1, condition());
            assert!(monitor.on_sample(&sample("put_bw", 150.0)));
            assert_eq!(monitor.on_fire(false), FireVerdict::Continue);
            assert!(!monitor.is_stopped());
            assert!(monitor.on_sample(&sample("put_bw", 150.0)));
        }
    }

    #[test]
    fn unrelated_metrics_are_ignored() {
        let mut monitor = Monitor::new(MonitorKind::Persistent, 1, condition());
        assert!(!monitor.on_sample(&sample("get_ops", 1_000.0)));
        assert!(!monitor.evaluate_condition());
    }

    #[test]
    fn stop_is_idempotent() {
        let mut monitor = Monitor::new(MonitorKind::Persistent, 1, condition());
        monitor.stop();
        monitor.stop();
        assert!(monitor.is_stopped());
        assert!(!monitor.on_sample(&sample("put_bw", 150.0)));
    }
}
