//! Scripted tier executor for driving the pipeline without a model.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use autofix_governor::error::{GovernorError, Result};
use autofix_governor::retry::{AttemptContext, AttemptReport, TierExecutor};

#[derive(Debug, Clone)]
pub enum Step {
    Report(AttemptReport),
    Error(String),
    Sleep(Duration),
    Panic(String),
}

/// Plays back queued steps in order, then repeats the fallback.
pub struct ScriptedExecutor {
    steps: Mutex<VecDeque<Step>>,
    fallback: Step,
    calls: Mutex<Vec<AttemptContext>>,
}

impl ScriptedExecutor {
    pub fn new(fallback: Step) -> Self {
        Self {
            steps: Mutex::new(VecDeque::new()),
            fallback,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Always returns a passing report with `patch` at `cost`.
    pub fn passing(patch: &str, cost: f64) -> Self {
        Self::new(Step::Report(passed(patch, cost)))
    }

    /// Always fails the tests with the same error text.
    pub fn failing(error: &str, cost: f64) -> Self {
        Self::new(Step::Report(failed(error, cost)))
    }

    pub fn then(self, step: Step) -> Self {
        self.steps.lock().push_back(step);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn calls(&self) -> Vec<AttemptContext> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl TierExecutor for ScriptedExecutor {
    async fn execute(&self, context: &AttemptContext) -> Result<AttemptReport> {
        self.calls.lock().push(context.clone());
        let step = self
            .steps
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        match step {
            Step::Report(mut report) => {
                report.model = context.route.model.clone();
                Ok(report)
            }
            Step::Error(message) => Err(GovernorError::Executor(message)),
            Step::Sleep(duration) => {
                tokio::time::sleep(duration).await;
                Ok(AttemptReport::failed(&context.route.model, "slept"))
            }
            Step::Panic(message) => panic!("{message}"),
        }
    }
}

pub fn passed(patch: &str, cost: f64) -> AttemptReport {
    AttemptReport {
        success: true,
        tests_passed: Some(true),
        patch: Some(patch.to_string()),
        cost,
        ..Default::default()
    }
}

pub fn failed(error: &str, cost: f64) -> AttemptReport {
    AttemptReport {
        success: false,
        tests_passed: Some(false),
        test_output: Some(format!("FAIL src/a.test.ts\nError: {error}")),
        patch: Some(small_patch()),
        cost,
        ..Default::default()
    }
}

/// Unified diff touching `files`, each with `added` new lines.
pub fn patch(files: &[&str], added: usize) -> String {
    let mut out = String::new();
    for file in files {
        out.push_str(&format!("diff --git a/{file} b/{file}\n"));
        out.push_str(&format!("--- a/{file}\n+++ b/{file}\n@@ -1,1 +1,{} @@\n", added + 1));
        for i in 0..added {
            out.push_str(&format!("+const line{i} = {i};\n"));
        }
    }
    out
}

pub fn small_patch() -> String {
    patch(&["src/a.ts"], 1)
}
