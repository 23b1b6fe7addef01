mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use tpe_executor::*;
use tpe_plan::{TestPlan, ValidationError};

fn plan(yaml: &str) -> TestPlan {
    TestPlan::from_yaml_str(yaml).unwrap()
}

const INTERLEAVED: &str = r#"
name: "interleaved"
test_cases:
  - name: "two-resources"
    resource_init:
      - { resource_id: a, virtual_machine: vm-a, checkpoint: base, timeout: 60 }
      - { resource_id: b, virtual_machine: vm-b, checkpoint: base, timeout: 60 }
    test_steps:
      - { type: step, description: a1, resource_id: a, directory: /work, executable: a1, timeout: 30 }
      - { type: step, description: b1, resource_id: b, directory: /work, executable: b1, timeout: 30 }
      - { type: step, description: a2, resource_id: a, directory: /work, executable: a2, timeout: 30 }
      - { type: step, description: b2, resource_id: b, directory: /work, executable: b2, timeout: 30 }
      - { type: step, description: a3, resource_id: a, directory: /work, executable: a3, timeout: 30 }
"#;

#[tokio::test(start_paused = true)]
async fn test_steps_keep_order_within_resource() {
    init_tracing();

    let driver = Arc::new(FakeDriver::new());
    let launcher = Arc::new(
        ScriptedLauncher::new()
            .script("a1", Script::new(300, 0))
            .script("a2", Script::new(50, 0))
            .script("a3", Script::new(10, 0))
            .script("b1", Script::new(100, 0))
            .script("b2", Script::new(400, 0)),
    );

    let report = runner(&driver, &launcher, test_config())
        .run(&plan(INTERLEAVED))
        .await
        .unwrap();
    assert!(report.is_success());

    assert_eq!(launcher.programs_on("vm-a"), vec!["a1", "a2", "a3"]);
    assert_eq!(launcher.programs_on("vm-b"), vec!["b1", "b2"]);

    // 上一步结束后下一步才开始
    for (prev, next) in [("a1", "a2"), ("a2", "a3"), ("b1", "b2")] {
        let prev = launcher.record_of(prev);
        let next = launcher.record_of(next);
        assert!(next.started >= prev.finished.unwrap());
    }

    let case = &report.test_cases[0];
    let a: Vec<&str> = case
        .outcomes_for("a")
        .into_iter()
        .filter(|o| o.kind == OutcomeKind::Step)
        .map(|o| o.description.as_str())
        .collect();
    assert_eq!(a, vec!["a1", "a2", "a3"]);
}

#[tokio::test(start_paused = true)]
async fn test_resources_run_concurrently() {
    let driver = Arc::new(FakeDriver::new());
    let launcher = Arc::new(
        ScriptedLauncher::new()
            .script("a1", Script::new(500, 0))
            .script("b1", Script::new(500, 0)),
    );

    let started = tokio::time::Instant::now();
    runner(&driver, &launcher, test_config())
        .run(&plan(INTERLEAVED))
        .await
        .unwrap();

    let a1 = launcher.record_of("a1");
    let b1 = launcher.record_of("b1");
    assert!(a1.started < b1.finished.unwrap());
    assert!(b1.started < a1.finished.unwrap());

    // 串行执行至少需要 1 秒
    assert!(started.elapsed() < Duration::from_millis(1000));
}

#[tokio::test(start_paused = true)]
async fn test_timeout_skips_remaining_items_of_resource() {
    let yaml = r#"
name: "timeout"
test_cases:
  - name: "hang"
    resource_init:
      - { resource_id: a, virtual_machine: vm-a, checkpoint: base, timeout: 60 }
      - { resource_id: b, virtual_machine: vm-b, checkpoint: base, timeout: 60 }
    test_steps:
      - { type: step, description: hang, resource_id: a, directory: /work, executable: hang, timeout: 1, restart_computer: true }
      - { type: refresh_resource, resource_id: a }
      - { type: step, description: a2, resource_id: a, directory: /work, executable: a2, timeout: 30 }
      - { type: step, description: b1, resource_id: b, directory: /work, executable: b1, timeout: 30 }
      - { type: step, description: b2, resource_id: b, directory: /work, executable: b2, timeout: 30 }
"#;

    let driver = Arc::new(FakeDriver::new());
    let launcher = Arc::new(ScriptedLauncher::new().script("hang", Script::new(10_000, 0)));

    let report = runner(&driver, &launcher, test_config())
        .run(&plan(yaml))
        .await
        .unwrap();
    let case = &report.test_cases[0];

    let a: Vec<StepStatus> = case.outcomes_for("a").iter().map(|o| o.status).collect();
    assert_eq!(
        a,
        vec![
            StepStatus::Pass,
            StepStatus::TimedOut,
            StepStatus::Skipped,
            StepStatus::Skipped
        ]
    );
    assert!(case.outcomes_for("b").iter().all(|o| o.is_pass()));

    // 超时的进程被终止，后续步骤未启动，也不会执行步骤后重启
    assert!(launcher.record_of("hang").killed);
    assert_eq!(launcher.programs_on("vm-a"), vec!["hang"]);
    assert!(driver.events_for("vm-a", "restart").is_empty());

    assert_eq!(case.verdict, Verdict::Fail);
    assert_eq!(case.first_failures.len(), 1);
    assert!(case.first_failures["a"].contains("hang"));
    assert_eq!(case.summary.timed_out, 1);
    assert_eq!(case.summary.skipped, 2);
}

#[tokio::test(start_paused = true)]
async fn test_refresh_completes_before_next_step() {
    let yaml = r#"
name: "refresh"
test_cases:
  - name: "barrier"
    resource_init:
      - { resource_id: a, virtual_machine: vm-a, checkpoint: base, timeout: 60 }
    test_steps:
      - { type: step, description: a1, resource_id: a, directory: /work, executable: a1, timeout: 30 }
      - { type: refresh_resource, resource_id: a }
      - { type: step, description: a2, resource_id: a, directory: /work, executable: a2, timeout: 30 }
"#;

    let driver = Arc::new(FakeDriver::new().with_restore_delay(Duration::from_millis(200)));
    let launcher = Arc::new(ScriptedLauncher::new());

    let report = runner(&driver, &launcher, test_config())
        .run(&plan(yaml))
        .await
        .unwrap();
    assert!(report.is_success());

    // 准备一次，刷新一次，恢复的是同一个检查点
    let restores = driver.events_for("vm-a", "restored");
    assert_eq!(restores.len(), 2);

    let a1 = launcher.record_of("a1");
    let a2 = launcher.record_of("a2");
    assert!(restores[1].at >= a1.finished.unwrap());
    assert!(a2.started >= restores[1].at);
}

#[tokio::test(start_paused = true)]
async fn test_sample_plan() {
    let plan = plan(include_str!("../../plan/fixtures/sample_plan.yaml"));

    let driver = Arc::new(FakeDriver::new());
    let launcher = Arc::new(ScriptedLauncher::new());

    let report = runner(&driver, &launcher, test_config())
        .run(&plan)
        .await
        .unwrap();
    assert!(report.is_success());
    assert!(!report.aborted);

    let case = report.test_case("cross-platform-copy").unwrap();
    assert_eq!(case.outcomes_of(OutcomeKind::Prepare).len(), 3);
    assert_eq!(case.outcomes_of(OutcomeKind::Step).len(), 3);

    let mut refreshed: Vec<&str> = case
        .outcomes_of(OutcomeKind::Refresh)
        .into_iter()
        .map(|o| o.resource_id.as_str())
        .collect();
    refreshed.sort();
    assert_eq!(refreshed, vec!["server", "win_client"]);

    let server = launcher.record_of("powershell");
    assert_eq!(server.vm, "ws2019-fileserver");
    assert_eq!(server.command.directory, r"C:\fileshare\tests");
    assert!(server.command.args.contains(&"new_share.ps1".to_string()));

    let linux = launcher.record_of("./verify_checksums.sh");
    assert_eq!(linux.command.args, vec!["--mount", "/mnt/regression"]);

    // 刷新默认不重新安装工具
    assert_eq!(driver.events_for("win10-x64-client", "tool:wireshark").len(), 1);
    // server：准备后重启，刷新后重启
    assert_eq!(driver.events_for("ws2019-fileserver", "restart").len(), 2);
    // win_client：步骤后重启
    assert_eq!(driver.events_for("win10-x64-client", "restart").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_rerun_produces_same_outcomes() {
    let yaml = r#"
name: "rerun"
test_cases:
  - name: "mixed"
    resource_init:
      - { resource_id: a, virtual_machine: vm-a, checkpoint: base, timeout: 60 }
      - { resource_id: b, virtual_machine: vm-b, checkpoint: base, timeout: 60 }
    test_steps:
      - { type: step, description: a1, resource_id: a, directory: /work, executable: broken, timeout: 30 }
      - { type: step, description: a2, resource_id: a, directory: /work, executable: a2, timeout: 30 }
      - { type: step, description: b1, resource_id: b, directory: /work, executable: b1, timeout: 30 }
"#;
    let plan = plan(yaml);

    let driver = Arc::new(FakeDriver::new());
    let launcher = Arc::new(ScriptedLauncher::new().script("broken", Script::new(20, 1)));
    let runner = runner(&driver, &launcher, test_config());

    let statuses = |report: &TestPlanReport| {
        let mut list: Vec<(String, Option<usize>, StepStatus)> = report.test_cases[0]
            .outcomes
            .iter()
            .map(|o| (o.resource_id.clone(), o.index, o.status))
            .collect();
        list.sort_by(|x, y| (&x.0, x.1).cmp(&(&y.0, y.1)));
        list
    };

    let first = runner.run(&plan).await.unwrap();
    let second = runner.run(&plan).await.unwrap();

    assert_ne!(first.run_id, second.run_id);
    assert_eq!(statuses(&first), statuses(&second));
    assert_eq!(first.verdict, Verdict::Fail);
}

#[tokio::test]
async fn test_validation_error_runs_nothing() {
    let yaml = r#"
name: "invalid"
test_cases:
  - name: "unknown-resource"
    resource_init:
      - { resource_id: a, virtual_machine: vm-a, checkpoint: base, timeout: 60 }
    test_steps:
      - { type: step, description: a1, resource_id: a, directory: /work, executable: a1, timeout: 30 }
      - { type: step, description: x1, resource_id: x, directory: /work, executable: x1, timeout: 30 }
"#;
    let plan = plan(yaml);

    let driver = Arc::new(FakeDriver::new());
    let launcher = Arc::new(ScriptedLauncher::new());
    let config = Arc::new(test_config());

    let resources = Arc::new(ResourceManager::new(driver.clone(), config));
    let supervisor = Arc::new(ExecutionSupervisor::new(
        launcher.clone(),
        Arc::new(InterpreterRegistry::with_defaults()),
        resources.clone(),
    ));
    let scheduler = StepScheduler::new(resources, supervisor);

    let result = scheduler
        .run_test_case(&plan.test_cases[0], &CancellationToken::new())
        .await;

    match result {
        Err(EngineError::Validation(ValidationError::UnknownResource {
            index, resource_id, ..
        })) => {
            assert_eq!(index, 1);
            assert_eq!(resource_id, "x");
        }
        other => panic!("期望校验错误, 实际: {:?}", other.map(|r| r.verdict)),
    }
    assert!(launcher.records().is_empty());
    assert!(driver.events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_missing_checkpoint_fails_only_that_resource() {
    let driver = Arc::new(FakeDriver::new().with_missing_checkpoint("vm-a"));
    let launcher = Arc::new(ScriptedLauncher::new());

    let report = runner(&driver, &launcher, test_config())
        .run(&plan(INTERLEAVED))
        .await
        .unwrap();
    let case = &report.test_cases[0];

    let a = case.outcomes_for("a");
    assert_eq!(a[0].kind, OutcomeKind::Prepare);
    assert_eq!(a[0].status, StepStatus::Fail);
    assert!(a[0].error.as_ref().unwrap().contains("base"));
    assert!(a[1..].iter().all(|o| o.status == StepStatus::Skipped));
    assert_eq!(a.len(), 4);

    assert!(case.outcomes_for("b").iter().all(|o| o.is_pass()));
    assert!(launcher.programs_on("vm-a").is_empty());
    assert_eq!(case.verdict, Verdict::Fail);
}

#[tokio::test(start_paused = true)]
async fn test_restart_without_response_is_restart_failure() {
    let yaml = r#"
name: "restart"
test_cases:
  - name: "no-response"
    resource_init:
      - { resource_id: a, virtual_machine: vm-a, checkpoint: base, timeout: 60 }
    test_steps:
      - type: step
        description: a1
        resource_id: a
        directory: /work
        executable: a1
        timeout: 30
        restart_computer: { value: true, wait: true }
      - { type: step, description: a2, resource_id: a, directory: /work, executable: a2, timeout: 30 }
"#;

    let driver = Arc::new(FakeDriver::new().with_unresponsive_after_restart("vm-a"));
    let launcher = Arc::new(ScriptedLauncher::new());

    let report = runner(&driver, &launcher, test_config())
        .run(&plan(yaml))
        .await
        .unwrap();
    let a = report.test_cases[0].outcomes_for("a");

    assert_eq!(a[1].status, StepStatus::RestartFailure);
    assert_eq!(a[1].exit_code, Some(0));
    assert_eq!(a[2].status, StepStatus::Skipped);
    assert_eq!(launcher.programs_on("vm-a"), vec!["a1"]);
}

#[tokio::test(start_paused = true)]
async fn test_post_wait_delays_next_step() {
    let yaml = r#"
name: "post-wait"
test_cases:
  - name: "wait"
    resource_init:
      - { resource_id: a, virtual_machine: vm-a, checkpoint: base, timeout: 60 }
    test_steps:
      - { type: step, description: a1, resource_id: a, directory: /work, executable: a1, timeout: 30, post_wait: 3 }
      - { type: step, description: a2, resource_id: a, directory: /work, executable: a2, timeout: 30, post_wait: 0 }
      - { type: step, description: a3, resource_id: a, directory: /work, executable: a3, timeout: 30 }
"#;

    let driver = Arc::new(FakeDriver::new());
    let launcher = Arc::new(ScriptedLauncher::new());

    runner(&driver, &launcher, test_config())
        .run(&plan(yaml))
        .await
        .unwrap();

    let a1 = launcher.record_of("a1");
    let a2 = launcher.record_of("a2");
    let a3 = launcher.record_of("a3");
    assert!(a2.started - a1.finished.unwrap() >= Duration::from_secs(3));
    assert!(a3.started - a2.finished.unwrap() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn test_worker_panic_reports_remaining_items() {
    let yaml = r#"
name: "panic"
test_cases:
  - name: "driver-panic"
    resource_init:
      - { resource_id: a, virtual_machine: vm-a, checkpoint: base, timeout: 60 }
      - { resource_id: b, virtual_machine: vm-b, checkpoint: base, timeout: 60 }
    test_steps:
      - type: step
        description: a1
        resource_id: a
        directory: /work
        executable: a1
        timeout: 30
        restart_computer: true
      - { type: refresh_resource, resource_id: a }
      - { type: step, description: a2, resource_id: a, directory: /work, executable: a2, timeout: 30 }
      - { type: step, description: b1, resource_id: b, directory: /work, executable: b1, timeout: 30 }
"#;

    let driver = Arc::new(FakeDriver::new().with_panic_on_restart("vm-a"));
    let launcher = Arc::new(ScriptedLauncher::new());

    let report = runner(&driver, &launcher, test_config())
        .run(&plan(yaml))
        .await
        .unwrap();
    let case = &report.test_cases[0];

    let a = case.outcomes_for("a");
    let a: Vec<(OutcomeKind, Option<usize>, StepStatus)> =
        a.iter().map(|o| (o.kind, o.index, o.status)).collect();
    assert_eq!(
        a,
        vec![
            (OutcomeKind::Prepare, None, StepStatus::Pass),
            (OutcomeKind::Step, Some(0), StepStatus::Fail),
            (OutcomeKind::Refresh, Some(1), StepStatus::Skipped),
            (OutcomeKind::Step, Some(2), StepStatus::Skipped),
        ]
    );
    assert!(case.outcomes_for("a")[1].error.is_some());
    assert!(case.outcomes_for("b").iter().all(|o| o.is_pass()));
    assert_eq!(case.summary.total, 6);
    assert_eq!(case.verdict, Verdict::Fail);
}

const STAGED: &str = r#"
name: "staged"
test_cases:
  - name: "artifacts"
    resource_init:
      - { resource_id: a, virtual_machine: vm-a, checkpoint: base, timeout: 60 }
    test_steps:
      - { type: step, description: a1, resource_id: a, directory: /work, source: smoke, executable: a1, timeout: 30 }
      - { type: step, description: a2, resource_id: a, directory: /work, executable: a2, timeout: 30 }
"#;

#[tokio::test(start_paused = true)]
async fn test_step_directory_staged_and_results_collected() {
    let driver = Arc::new(FakeDriver::new());
    let launcher = Arc::new(ScriptedLauncher::new());
    let config = EngineConfig {
        tests_root: Some("/srv/tests".into()),
        results_root: Some("/var/tpe/results".into()),
        ..test_config()
    };

    let report = runner(&driver, &launcher, config)
        .run(&plan(STAGED))
        .await
        .unwrap();
    assert!(report.is_success());

    let transfers = launcher.transfers();
    let actions: Vec<&str> = transfers.iter().map(|t| t.action).collect();
    assert_eq!(actions, vec!["stage", "mkdir", "collect", "mkdir", "collect"]);
    assert_eq!(transfers[0].from, "/srv/tests/smoke");
    assert_eq!(transfers[0].to, "/work");

    // 每个步骤使用独立的结果目录
    let remote = &transfers[1].to;
    assert!(remote.starts_with("/work/results/"));
    assert_ne!(remote, &transfers[3].to);
    assert_eq!(&transfers[2].from, remote);

    let a1 = launcher.record_of("a1");
    assert_eq!(a1.command.env.get(RESULTS_DIR_ENV), Some(remote));

    let steps = report.test_cases[0].outcomes_of(OutcomeKind::Step);
    let local = steps[0].results_path.as_deref().unwrap();
    assert_eq!(local, transfers[2].to);
    assert!(local.starts_with("/var/tpe/results/"));
    assert!(local.ends_with(remote.rsplit('/').next().unwrap()));
}

#[tokio::test(start_paused = true)]
async fn test_results_collection_failure_fails_step() {
    let driver = Arc::new(FakeDriver::new());
    let launcher = Arc::new(ScriptedLauncher::new().with_failing_collect());
    let config = EngineConfig {
        results_root: Some("/var/tpe/results".into()),
        ..test_config()
    };

    let report = runner(&driver, &launcher, config)
        .run(&plan(STAGED))
        .await
        .unwrap();
    let a = report.test_cases[0].outcomes_for("a");

    assert_eq!(a[1].status, StepStatus::Fail);
    assert_eq!(a[1].exit_code, Some(0));
    assert!(a[1].results_path.is_none());
    assert!(a[1].error.as_ref().unwrap().contains("文件传输失败"));
    assert_eq!(a[2].status, StepStatus::Skipped);
    assert_eq!(launcher.programs_on("vm-a"), vec!["a1"]);
}
