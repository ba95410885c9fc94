mod fixtures;

use autofix_governor::cost::{ModelFamily, TokenUsage};
use autofix_governor::orchestrator::Disposition;
use autofix_governor::routing::Tier;

use fixtures::executor::{ScriptedExecutor, Step, passed, patch};
use fixtures::harness::Harness;
use fixtures::intake::shallow_body;

async fn rejection(h: &Harness) -> String {
    h.open_issue(1, &shallow_body());
    let mut run = h.orchestrator.start_run();
    let outcome = h.orchestrator.process_issue(1, &mut run).await.unwrap();
    assert_eq!(outcome.disposition, Disposition::Rejected);
    assert!(outcome.fix_generated);
    outcome.reason.unwrap()
}

#[tokio::test]
async fn test_diff_limit() {
    let h = Harness::with_config(ScriptedExecutor::passing(&patch(&["src/a.ts"], 3), 0.0), |c| {
        c.guardrails.max_diff_lines = 2;
    });
    assert_eq!(rejection(&h).await, "diff_limit_exceeded");
    assert!(h.has_label(1, "autofix:failed"));
    assert!(
        h.comment_bodies(1)
            .iter()
            .any(|c| c.contains("safety guardrail (diff_limit_exceeded)"))
    );
    assert!(h.tracker.pulls().is_empty());
}

#[tokio::test]
async fn test_guardrail_records_failed_attempt() {
    let h = Harness::with_config(ScriptedExecutor::passing(&patch(&["src/a.ts"], 3), 0.0), |c| {
        c.guardrails.max_diff_lines = 2;
    });
    h.open_issue(1, &shallow_body());
    let mut run = h.orchestrator.start_run();
    h.orchestrator.process_issue(1, &mut run).await.unwrap();

    let key = run.fingerprints[0].clone();
    let state = h.orchestrator.attempts().get_state(&key).await.unwrap();
    assert_eq!(state.attempts, 1);
    assert!(state.cooldown_until.is_some());
    assert_eq!(h.orchestrator.metrics().snapshot().fixes.failed, 1);
}

#[tokio::test]
async fn test_file_limit() {
    let files = ["src/a.ts", "src/b.ts", "src/c.ts"];
    let h = Harness::with_config(ScriptedExecutor::passing(&patch(&files, 1), 0.0), |c| {
        c.guardrails.max_files = 1;
    });
    assert_eq!(rejection(&h).await, "file_limit_exceeded");
}

#[tokio::test]
async fn test_secret_detected() {
    let leaked = "diff --git a/src/a.ts b/src/a.ts\n--- a/src/a.ts\n+++ b/src/a.ts\n@@ -1 +1,2 @@\n+const key = 'sk_live_abcdefghijklmnop1234';\n";
    let h = Harness::new(ScriptedExecutor::passing(leaked, 0.0));
    assert_eq!(rejection(&h).await, "secret_detected");
}

#[tokio::test]
async fn test_path_filter_violation() {
    let h = Harness::with_config(
        ScriptedExecutor::passing(&patch(&["docs/guide.md"], 1), 0.0),
        |c| {
            c.guardrails.path_filters.include = vec!["src/".into()];
            c.guardrails.path_filters.exclude = vec!["docs/".into()];
        },
    );
    assert_eq!(rejection(&h).await, "path_filter_violation");
}

#[tokio::test]
async fn test_run_budget_spans_issues() {
    let h = Harness::with_config(ScriptedExecutor::passing(&patch(&["src/a.ts"], 1), 0.6), |c| {
        c.guardrails.budget_limit = 1.0;
    });
    h.open_issue(1, &shallow_body());
    h.open_issue(2, &shallow_body());

    let mut run = h.orchestrator.start_run();
    let first = h.orchestrator.process_issue(1, &mut run).await.unwrap();
    assert!(first.is_success());

    let second = h.orchestrator.process_issue(2, &mut run).await.unwrap();
    assert_eq!(second.disposition, Disposition::Rejected);
    assert_eq!(second.reason.as_deref(), Some("budget_exceeded"));
    assert!((run.total_cost - 1.2).abs() < 1e-9);

    // Spend beyond the tier reservation is still charged to the ledger.
    let ledger = h.orchestrator.budget().status().await.unwrap();
    assert!((ledger.periods.daily.spent - 1.2).abs() < 1e-9);
    assert!(ledger.periods.daily.reserved.abs() < 1e-12);
    assert_eq!(h.orchestrator.budget().live_reservations().await, 0);
}

#[tokio::test]
async fn test_per_fix_cost_ceiling() {
    let mut report = passed(&patch(&["src/a.ts"], 1), 0.04);
    report.tokens = vec![TokenUsage {
        model: ModelFamily::Gpt5,
        input_tokens: 1000,
        output_tokens: 1000,
        issue_number: 1,
        tier: Tier::Three,
    }];
    let h = Harness::with_config(ScriptedExecutor::new(Step::Report(report)), |c| {
        c.routing.force_tier = Some(3);
    });

    assert_eq!(rejection(&h).await, "cost_limit_exceeded");
    assert_eq!(h.orchestrator.cost_tracker().total_cost(), 0.0);
}
