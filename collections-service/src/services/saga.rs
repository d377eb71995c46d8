//! Compensating actions for multi-step payment flows.
//!
//! Each side effect registers the action that undoes it. Whatever is still
//! armed when the flow calls [`Saga::compensate`] runs in reverse order.

use std::future::Future;

use futures::future::BoxFuture;
use tracing::{error, info, warn};

use crate::error::PaymentError;
use crate::services::metrics::record_compensation;

type Compensation = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), PaymentError>> + Send>;

/// Handle to a registered compensation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepId(usize);

struct Step {
    label: &'static str,
    action: Option<Compensation>,
}

pub struct Saga {
    name: String,
    steps: Vec<Step>,
}

impl Saga {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    /// Register the action that undoes the step just taken.
    pub fn push<F, Fut>(&mut self, label: &'static str, compensation: F) -> StepId
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), PaymentError>> + Send + 'static,
    {
        self.steps.push(Step {
            label,
            action: Some(Box::new(move || Box::pin(compensation()))),
        });
        StepId(self.steps.len() - 1)
    }

    pub fn disarm(&mut self, step: StepId) {
        if let Some(step) = self.steps.get_mut(step.0) {
            step.action = None;
        }
    }

    /// Past the point of no return: nothing registered so far will be undone.
    pub fn disarm_all(&mut self) {
        for step in &mut self.steps {
            step.action = None;
        }
    }

    pub fn is_armed(&self, step: StepId) -> bool {
        self.steps
            .get(step.0)
            .is_some_and(|s| s.action.is_some())
    }

    pub fn armed(&self) -> usize {
        self.steps.iter().filter(|s| s.action.is_some()).count()
    }

    /// Run armed compensations newest first. A failing compensation is
    /// alerted on and does not stop the ones registered before it.
    ///
    /// Returns the number of compensations that failed.
    pub async fn compensate(mut self) -> usize {
        let steps = std::mem::take(&mut self.steps);
        let mut failed = 0;

        for step in steps.into_iter().rev() {
            let Some(action) = step.action else {
                continue;
            };

            match action().await {
                Ok(()) => {
                    record_compensation(step.label, "ok");
                    info!(saga = %self.name, step = step.label, "Compensation completed");
                }
                Err(err) => {
                    failed += 1;
                    record_compensation(step.label, "failed");
                    error!(
                        alert = true,
                        saga = %self.name,
                        step = step.label,
                        error = %err,
                        "Compensation failed, manual cleanup required"
                    );
                }
            }
        }

        failed
    }
}

impl Drop for Saga {
    fn drop(&mut self) {
        let armed = self.armed();
        if armed > 0 {
            warn!(
                saga = %self.name,
                armed,
                "Saga dropped with armed compensations"
            );
        }
    }
}
