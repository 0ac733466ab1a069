//! Repeating composite with a stop condition and a time budget

use super::{CompositionError, CompositionFailure, CompositionResult};
use agentflow_core::{Agent, RunContext, State};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Stop predicate evaluated before every iteration
pub type LoopCondition = Arc<dyn Fn(&State) -> bool + Send + Sync>;

/// Repeats one sub-agent on its own output
///
/// Each iteration first checks the context, then the stop condition, and
/// only then runs the agent. The loop ends after `max_iterations` runs.
pub struct LoopAgent {
    name: String,
    agent: Arc<dyn Agent>,
    max_iterations: u32,
    timeout: Option<Duration>,
    condition: Option<LoopCondition>,
}

impl LoopAgent {
    pub fn new(name: impl Into<String>, agent: Arc<dyn Agent>, max_iterations: u32) -> Self {
        Self {
            name: name.into(),
            agent,
            max_iterations,
            timeout: None,
            condition: None,
        }
    }

    /// Deadline for the whole loop; zero disables it
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    pub fn with_condition(mut self, condition: LoopCondition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    pub async fn execute(&self, ctx: &RunContext, input: State) -> CompositionResult {
        let run_ctx = match self.timeout {
            Some(timeout) => ctx.with_timeout(timeout),
            None => ctx.child(),
        };

        let mut state = input;
        for iteration in 0..self.max_iterations {
            if let Some(reason) = run_ctx.err() {
                let error = CompositionError::Cancelled {
                    name: self.name.clone(),
                    iterations: iteration,
                    reason,
                };
                return Err(CompositionFailure::new(error, state));
            }

            if self.condition.as_ref().is_some_and(|stop| stop(&state)) {
                info!(composition = %self.name, iteration, "Loop condition met");
                break;
            }

            debug!(composition = %self.name, agent = %self.agent.name(), iteration, "Running loop iteration");
            match self.agent.run(&run_ctx, state.clone()).await {
                Ok(output) => state = output,
                Err(source) => {
                    let error = CompositionError::Iteration {
                        name: self.name.clone(),
                        iteration,
                        source,
                    };
                    return Err(CompositionFailure::new(error, state));
                }
            }
        }
        Ok(state)
    }
}

#[async_trait]
impl Agent for LoopAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &RunContext, state: State) -> anyhow::Result<State> {
        Ok(self.execute(ctx, state).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentflow_core::agent_fn;
    use serde_json::json;

    fn counter() -> Arc<dyn Agent> {
        agent_fn("counter", |_ctx, mut state| async move {
            let n = state.get("n").and_then(|v| v.as_i64()).unwrap_or(0) + 1;
            state.set("n", n);
            Ok(state)
        })
    }

    fn count(state: &State) -> Option<i64> {
        state.get("n").and_then(|v| v.as_i64())
    }

    #[tokio::test]
    async fn test_runs_until_cap() {
        let agent = LoopAgent::new("capped", counter(), 4);
        let output = agent
            .execute(&RunContext::background(), State::new())
            .await
            .expect("loop runs");
        assert_eq!(count(&output), Some(4));
    }

    #[tokio::test]
    async fn test_condition_checked_before_running() {
        let condition: LoopCondition =
            Arc::new(|state: &State| state.get("n").and_then(|v| v.as_i64()) >= Some(2));
        let agent = LoopAgent::new("until-two", counter(), 10).with_condition(condition);

        let output = agent
            .execute(&RunContext::background(), State::new())
            .await
            .expect("loop runs");
        assert_eq!(count(&output), Some(2));

        let mut done = State::new();
        done.set("n", 7);
        let output = agent
            .execute(&RunContext::background(), done)
            .await
            .expect("already satisfied");
        assert_eq!(count(&output), Some(7));
    }

    #[tokio::test]
    async fn test_cancelled_context_stops_loop() {
        let ctx = RunContext::background();
        ctx.cancel();
        let agent = LoopAgent::new("cancelled", counter(), 3);

        let failure = agent.execute(&ctx, State::new()).await.expect_err("cancelled");
        assert_eq!(
            failure.to_string(),
            "loop agent cancelled: context cancelled after 0 iterations: context canceled"
        );
    }

    #[tokio::test]
    async fn test_iteration_failure_names_index() {
        let flaky = agent_fn("flaky", |_ctx, mut state| async move {
            let n = state.get("n").and_then(|v| v.as_i64()).unwrap_or(0) + 1;
            if n == 3 {
                anyhow::bail!("diverged");
            }
            state.set("n", n);
            Ok(state)
        });
        let agent = LoopAgent::new("refine", flaky, 5);

        let failure = agent
            .execute(&RunContext::background(), State::new())
            .await
            .expect_err("third run fails");
        assert_eq!(failure.to_string(), "loop agent refine iteration 2: diverged");
        assert_eq!(failure.partial_state.get("n"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_timeout_expires_between_iterations() {
        let slow = agent_fn("slow", |_ctx, state| async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            Ok(state)
        });
        let agent = LoopAgent::new("slow-loop", slow, 100).with_timeout(Duration::from_millis(50));

        let failure = agent
            .execute(&RunContext::background(), State::new())
            .await
            .expect_err("deadline");
        assert!(matches!(
            failure.error,
            CompositionError::Cancelled { iterations, .. } if iterations >= 1
        ));
    }
}
