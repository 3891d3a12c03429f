//! Output-variable bridging for Satellite devices.
//!
//! A Satellite client may declare *output* variables: values the hub computes
//! from a host expression and pushes to the device with `VARIABLE-VALUE`.
//! The expression engine lives outside this crate; it is reached through the
//! [`ExpressionEvaluator`] trait.
//!
//! # When is an expression re-evaluated? (for beginners)
//!
//! Every evaluation reports which host variables the expression read.  The
//! bridge remembers that set.  When the host says "variables X and Y
//! changed", only bindings whose last set contains X or Y are re-evaluated;
//! a change to an unrelated variable costs nothing.
//!
//! Re-evaluations go through the same [`CoalescingQueue`] the drivers use
//! for images, with a short settle delay, so a burst of variable changes
//! produces one evaluation.  A value is only sent when it differs from the
//! last value sent for that variable.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use surface_core::SatelliteMessage;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::application::coalescing_queue::{CoalescingQueue, QueueProcessor};
use crate::application::panel::SurfaceError;

/// Sent in place of a value whose expression failed to evaluate.
pub const NA_SENTINEL: &str = "$NA";

/// Delay that lets a burst of variable changes settle into one evaluation.
pub const DEFAULT_VARIABLE_SETTLE: Duration = Duration::from_millis(20);

/// Result of evaluating a host expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub value: serde_json::Value,
    /// Every host variable the expression read.
    pub referenced_variables: HashSet<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExpressionError {
    #[error("failed to evaluate `{expression}`: {reason}")]
    Failed { expression: String, reason: String },
}

/// The host expression engine.
#[cfg_attr(test, mockall::automock)]
pub trait ExpressionEvaluator: Send + Sync {
    /// Evaluates `expression` against the current host variables.
    ///
    /// # Errors
    ///
    /// Returns [`ExpressionError`] for syntax errors and failed lookups.
    fn evaluate(&self, expression: &str) -> Result<Evaluation, ExpressionError>;
}

/// Renders an evaluated value the way it is shown on the device.
pub fn value_to_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Default)]
struct OutputBinding {
    expression: String,
    dependencies: HashSet<String>,
    last_sent: Option<String>,
}

struct BridgeInner {
    device_id: String,
    evaluator: Arc<dyn ExpressionEvaluator>,
    outbound: mpsc::UnboundedSender<SatelliteMessage>,
    bindings: Mutex<HashMap<String, OutputBinding>>,
}

impl BridgeInner {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, OutputBinding>> {
        self.bindings.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl QueueProcessor<String, ()> for BridgeInner {
    async fn process(&self, variable: String, _payload: ()) -> Result<(), SurfaceError> {
        let Some(expression) = self.lock().get(&variable).map(|b| b.expression.clone()) else {
            return Ok(());
        };

        let (value, dependencies) = match self.evaluator.evaluate(&expression) {
            Ok(eval) => (value_to_text(&eval.value), Some(eval.referenced_variables)),
            Err(e) => {
                warn!("{}: output variable {variable}: {e}", self.device_id);
                (NA_SENTINEL.to_string(), None)
            }
        };

        let changed = {
            let mut bindings = self.lock();
            let Some(binding) = bindings.get_mut(&variable) else {
                return Ok(());
            };
            // A failed evaluation keeps the previous dependency set so the
            // binding still wakes up when its inputs change.
            if let Some(deps) = dependencies {
                binding.dependencies = deps;
            }
            if binding.last_sent.as_deref() == Some(value.as_str()) {
                false
            } else {
                binding.last_sent = Some(value.clone());
                true
            }
        };

        if changed {
            debug!("{}: {variable} -> {value:?}", self.device_id);
            let _ = self.outbound.send(SatelliteMessage::VariableValue {
                device_id: self.device_id.clone(),
                variable,
                value,
            });
        }
        Ok(())
    }
}

/// Keeps a Satellite device's output variables in sync with the host.
pub struct OutputVariableBridge {
    inner: Arc<BridgeInner>,
    queue: CoalescingQueue<String, ()>,
}

impl OutputVariableBridge {
    pub fn new(
        device_id: impl Into<String>,
        evaluator: Arc<dyn ExpressionEvaluator>,
        outbound: mpsc::UnboundedSender<SatelliteMessage>,
        settle: Duration,
    ) -> Self {
        let inner = Arc::new(BridgeInner {
            device_id: device_id.into(),
            evaluator,
            outbound,
            bindings: Mutex::new(HashMap::new()),
        });
        // The processor never fails, so the error channel is not needed.
        let (queue, _errors) = CoalescingQueue::with_settle(Arc::clone(&inner), settle);
        Self { inner, queue }
    }

    /// Replaces the set of bound output variables.
    ///
    /// New or changed expressions are evaluated.  With `force`, every binding
    /// is evaluated and re-sent even if its value did not change.  Bindings
    /// with an empty expression are dropped.
    pub fn set_bindings<I>(&self, bindings: I, force: bool)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let wanted: HashMap<String, String> = bindings
            .into_iter()
            .filter(|(_, expression)| !expression.trim().is_empty())
            .collect();

        let to_queue: Vec<String> = {
            let mut current = self.inner.lock();
            current.retain(|id, _| wanted.contains_key(id));

            let mut to_queue = Vec::new();
            for (id, expression) in wanted {
                let binding = current.entry(id.clone()).or_default();
                let changed = binding.expression != expression;
                if changed {
                    binding.expression = expression;
                    binding.dependencies.clear();
                }
                if force {
                    binding.last_sent = None;
                }
                if changed || force {
                    to_queue.push(id);
                }
            }
            to_queue
        };

        for id in to_queue {
            self.queue.queue(id, ());
        }
    }

    /// Queues every binding that read one of the `changed` variables.
    ///
    /// Returns how many bindings were queued.
    pub fn on_variables_changed(&self, changed: &HashSet<String>) -> usize {
        let affected: Vec<String> = self
            .inner
            .lock()
            .iter()
            .filter(|(_, b)| !b.dependencies.is_disjoint(changed))
            .map(|(id, _)| id.clone())
            .collect();
        let count = affected.len();
        for id in affected {
            self.queue.queue(id, ());
        }
        count
    }

    /// Ids of the currently bound output variables.
    pub fn bound_variables(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn close(&self) {
        self.queue.close();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;
    use serde_json::json;
    use tokio::time::timeout;

    fn eval(value: serde_json::Value, deps: &[&str]) -> Evaluation {
        Evaluation {
            value,
            referenced_variables: deps.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn changed(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    async fn next_value(rx: &mut mpsc::UnboundedReceiver<SatelliteMessage>) -> (String, String) {
        match timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap() {
            SatelliteMessage::VariableValue { variable, value, .. } => (variable, value),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_binding_is_evaluated_and_sent() {
        // Arrange
        let mut evaluator = MockExpressionEvaluator::new();
        evaluator
            .expect_evaluate()
            .with(eq("$(local:a) + 1"))
            .returning(|_| Ok(eval(json!(42), &["local:a"])));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let bridge = OutputVariableBridge::new("dev", Arc::new(evaluator), tx, Duration::ZERO);

        // Act
        bridge.set_bindings([("out1".to_string(), "$(local:a) + 1".to_string())], false);

        // Assert
        assert_eq!(next_value(&mut rx).await, ("out1".to_string(), "42".to_string()));
    }

    #[tokio::test]
    async fn test_only_referenced_variables_trigger_reevaluation() {
        // Arrange
        let mut evaluator = MockExpressionEvaluator::new();
        let mut n = 0;
        evaluator.expect_evaluate().times(2).returning(move |_| {
            n += 1;
            Ok(eval(json!(n), &["A", "B"]))
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let bridge = OutputVariableBridge::new("dev", Arc::new(evaluator), tx, Duration::ZERO);
        bridge.set_bindings([("out".to_string(), "expr".to_string())], false);
        assert_eq!(next_value(&mut rx).await.1, "1");

        // Act / Assert: C is unrelated
        assert_eq!(bridge.on_variables_changed(&changed(&["C"])), 0);

        // Act / Assert: A is referenced
        assert_eq!(bridge.on_variables_changed(&changed(&["A"])), 1);
        assert_eq!(next_value(&mut rx).await.1, "2");
    }

    #[tokio::test]
    async fn test_unchanged_value_is_not_resent() {
        let mut evaluator = MockExpressionEvaluator::new();
        evaluator
            .expect_evaluate()
            .returning(|_| Ok(eval(json!("same"), &["A"])));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let bridge = OutputVariableBridge::new("dev", Arc::new(evaluator), tx, Duration::ZERO);
        bridge.set_bindings([("out".to_string(), "expr".to_string())], false);
        assert_eq!(next_value(&mut rx).await.1, "same");

        bridge.on_variables_changed(&changed(&["A"]));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_force_resends_unchanged_value() {
        let mut evaluator = MockExpressionEvaluator::new();
        evaluator
            .expect_evaluate()
            .returning(|_| Ok(eval(json!("v"), &[])));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let bridge = OutputVariableBridge::new("dev", Arc::new(evaluator), tx, Duration::ZERO);
        let bindings = [("out".to_string(), "expr".to_string())];
        bridge.set_bindings(bindings.clone(), false);
        assert_eq!(next_value(&mut rx).await.1, "v");

        bridge.set_bindings(bindings, true);

        assert_eq!(next_value(&mut rx).await.1, "v");
    }

    #[tokio::test]
    async fn test_failed_evaluation_sends_sentinel_and_keeps_dependencies() {
        // Arrange: first call succeeds, second fails
        let mut evaluator = MockExpressionEvaluator::new();
        let mut seq = mockall::Sequence::new();
        evaluator
            .expect_evaluate()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(eval(json!(1), &["A"])));
        evaluator
            .expect_evaluate()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|e| {
                Err(ExpressionError::Failed {
                    expression: e.to_string(),
                    reason: "division by zero".to_string(),
                })
            });
        evaluator
            .expect_evaluate()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(eval(json!(3), &["A"])));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let bridge = OutputVariableBridge::new("dev", Arc::new(evaluator), tx, Duration::ZERO);
        bridge.set_bindings([("out".to_string(), "expr".to_string())], false);
        assert_eq!(next_value(&mut rx).await.1, "1");

        // Act
        bridge.on_variables_changed(&changed(&["A"]));
        let failed = next_value(&mut rx).await.1;
        let requeued = bridge.on_variables_changed(&changed(&["A"]));

        // Assert
        assert_eq!(failed, NA_SENTINEL);
        assert_eq!(requeued, 1);
        assert_eq!(next_value(&mut rx).await.1, "3");
    }

    #[tokio::test]
    async fn test_removed_binding_is_forgotten() {
        let mut evaluator = MockExpressionEvaluator::new();
        evaluator
            .expect_evaluate()
            .returning(|_| Ok(eval(json!(0), &["A"])));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let bridge = OutputVariableBridge::new("dev", Arc::new(evaluator), tx, Duration::ZERO);
        bridge.set_bindings([("out".to_string(), "expr".to_string())], false);
        next_value(&mut rx).await;

        bridge.set_bindings([("out".to_string(), "  ".to_string())], false);

        assert!(bridge.bound_variables().is_empty());
        assert_eq!(bridge.on_variables_changed(&changed(&["A"])), 0);
    }

    #[test]
    fn test_value_to_text() {
        assert_eq!(value_to_text(&json!(null)), "");
        assert_eq!(value_to_text(&json!("abc")), "abc");
        assert_eq!(value_to_text(&json!(1.5)), "1.5");
        assert_eq!(value_to_text(&json!(true)), "true");
    }
}
