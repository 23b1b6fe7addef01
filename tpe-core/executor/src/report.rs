//! 执行结果与报告

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use tpe_plan::TestPlan;

use crate::{EngineError, Result};

/// 条目执行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pass,
    Fail,
    TimedOut,
    RestartFailure,
    Skipped,
    Cancelled,
}

impl StepStatus {
    pub fn is_pass(self) -> bool {
        self == StepStatus::Pass
    }

    /// 是否为失败（跳过不算）
    pub fn is_failure(self) -> bool {
        !matches!(self, StepStatus::Pass | StepStatus::Skipped)
    }
}

/// 结果来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    /// 资源准备
    Prepare,
    /// 命令行步骤
    Step,
    /// 资源刷新
    Refresh,
}

/// 结论
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail,
}

/// 单个条目的执行结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub resource_id: String,

    pub kind: OutcomeKind,

    /// 在 test_steps 中的位置，资源准备为 None
    pub index: Option<usize>,

    pub description: String,

    pub status: StepStatus,

    pub started_at: DateTime<Utc>,

    pub finished_at: DateTime<Utc>,

    /// 耗时（毫秒）
    pub duration_ms: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// 回收到本地的结果目录
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results_path: Option<String>,
}

impl StepOutcome {
    /// 开始记录一个条目，状态在 `finish` 时确定
    pub fn begin(
        resource_id: impl Into<String>,
        kind: OutcomeKind,
        index: Option<usize>,
        description: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            resource_id: resource_id.into(),
            kind,
            index,
            description: description.into(),
            status: StepStatus::Pass,
            started_at: now,
            finished_at: now,
            duration_ms: 0,
            command: None,
            exit_code: None,
            output: None,
            error: None,
            results_path: None,
        }
    }

    /// 未执行的条目
    pub fn skipped(
        resource_id: impl Into<String>,
        kind: OutcomeKind,
        index: Option<usize>,
        description: impl Into<String>,
    ) -> Self {
        let mut outcome = Self::begin(resource_id, kind, index, description);
        outcome.status = StepStatus::Skipped;
        outcome
    }

    pub fn finish(mut self, status: StepStatus) -> Self {
        self.status = status;
        self.finished_at = Utc::now();
        self.duration_ms = (self.finished_at - self.started_at)
            .num_milliseconds()
            .max(0) as u64;
        self
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn with_exit(mut self, exit_code: Option<i32>, output: impl Into<String>) -> Self {
        self.exit_code = exit_code;
        let output = output.into();
        if !output.is_empty() {
            self.output = Some(output);
        }
        self
    }

    pub fn with_error(mut self, error: impl ToString) -> Self {
        self.error = Some(error.to_string());
        self
    }

    pub fn with_results(mut self, path: impl Into<String>) -> Self {
        self.results_path = Some(path.into());
        self
    }

    pub fn is_pass(&self) -> bool {
        self.status.is_pass()
    }

    /// 用于报告的失败原因
    pub fn failure_reason(&self) -> String {
        match &self.error {
            Some(error) => format!("{}: {}", self.description, error),
            None => format!("{}: {:?}", self.description, self.status),
        }
    }
}

/// 各状态计数
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub restart_failures: usize,
    pub skipped: usize,
    pub cancelled: usize,
}

impl OutcomeSummary {
    fn count(&mut self, status: StepStatus) {
        self.total += 1;
        match status {
            StepStatus::Pass => self.passed += 1,
            StepStatus::Fail => self.failed += 1,
            StepStatus::TimedOut => self.timed_out += 1,
            StepStatus::RestartFailure => self.restart_failures += 1,
            StepStatus::Skipped => self.skipped += 1,
            StepStatus::Cancelled => self.cancelled += 1,
        }
    }
}

// ============================================
// 结果汇总
// ============================================

/// 结果汇总器
///
/// 只追加，保留记录顺序用于报告。
#[derive(Debug, Clone, Default)]
pub struct ResultAggregator {
    outcomes: Vec<StepOutcome>,
}

impl ResultAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, outcome: StepOutcome) {
        self.outcomes.push(outcome);
    }

    pub fn outcomes(&self) -> &[StepOutcome] {
        &self.outcomes
    }

    pub fn outcomes_for<'a>(
        &'a self,
        resource_id: &'a str,
    ) -> impl Iterator<Item = &'a StepOutcome> + 'a {
        self.outcomes
            .iter()
            .filter(move |outcome| outcome.resource_id == resource_id)
    }

    /// 当且仅当所有记录都是 Pass 时用例通过
    pub fn test_case_verdict(&self) -> Verdict {
        if self.outcomes.iter().all(StepOutcome::is_pass) {
            Verdict::Pass
        } else {
            Verdict::Fail
        }
    }

    /// 每个资源的第一个失败原因
    pub fn first_failures(&self) -> BTreeMap<String, String> {
        let mut failures = BTreeMap::new();
        for outcome in self.outcomes.iter().filter(|o| o.status.is_failure()) {
            failures
                .entry(outcome.resource_id.clone())
                .or_insert_with(|| outcome.failure_reason());
        }
        failures
    }

    pub fn summary(&self) -> OutcomeSummary {
        let mut summary = OutcomeSummary::default();
        for outcome in &self.outcomes {
            summary.count(outcome.status);
        }
        summary
    }

    /// 当且仅当所有用例通过时计划通过
    pub fn test_plan_verdict(cases: &[TestCaseReport]) -> Verdict {
        if cases.iter().all(|case| case.verdict == Verdict::Pass) {
            Verdict::Pass
        } else {
            Verdict::Fail
        }
    }

    /// 生成用例报告
    pub fn into_report(self, name: impl Into<String>, started_at: DateTime<Utc>) -> TestCaseReport {
        TestCaseReport {
            name: name.into(),
            verdict: self.test_case_verdict(),
            started_at,
            finished_at: Utc::now(),
            summary: self.summary(),
            first_failures: self.first_failures(),
            outcomes: self.outcomes,
        }
    }
}

// ============================================
// 报告
// ============================================

/// 测试用例报告
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCaseReport {
    pub name: String,
    pub verdict: Verdict,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub summary: OutcomeSummary,

    /// resource_id -> 第一个失败原因
    pub first_failures: BTreeMap<String, String>,

    pub outcomes: Vec<StepOutcome>,
}

impl TestCaseReport {
    pub fn is_success(&self) -> bool {
        self.verdict == Verdict::Pass
    }

    pub fn outcomes_for(&self, resource_id: &str) -> Vec<&StepOutcome> {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.resource_id == resource_id)
            .collect()
    }

    pub fn outcomes_of(&self, kind: OutcomeKind) -> Vec<&StepOutcome> {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.kind == kind)
            .collect()
    }
}

/// 测试计划报告
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestPlanReport {
    /// 本次运行 ID
    pub run_id: Uuid,

    pub name: String,

    pub version: u32,

    pub started_at: DateTime<Utc>,

    pub finished_at: Option<DateTime<Utc>>,

    pub verdict: Verdict,

    /// 是否被中止
    pub aborted: bool,

    /// 因中止而未开始的用例
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub not_started: Vec<String>,

    pub test_cases: Vec<TestCaseReport>,
}

impl TestPlanReport {
    pub fn new(plan: &TestPlan) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            name: plan.name.clone(),
            version: plan.version,
            started_at: Utc::now(),
            finished_at: None,
            verdict: Verdict::Fail,
            aborted: false,
            not_started: Vec::new(),
            test_cases: Vec::new(),
        }
    }

    pub fn add_test_case(&mut self, report: TestCaseReport) {
        self.test_cases.push(report);
    }

    pub fn mark_aborted(&mut self, not_started: impl IntoIterator<Item = String>) {
        self.aborted = true;
        self.not_started.extend(not_started);
    }

    /// 完成报告并计算结论
    pub fn finalize(&mut self) {
        self.finished_at = Some(Utc::now());
        self.verdict = if self.aborted {
            Verdict::Fail
        } else {
            ResultAggregator::test_plan_verdict(&self.test_cases)
        };
    }

    pub fn is_success(&self) -> bool {
        self.verdict == Verdict::Pass
    }

    pub fn test_case(&self, name: &str) -> Option<&TestCaseReport> {
        self.test_cases.iter().find(|case| case.name == name)
    }

    /// 导出为 JSON
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| EngineError::SerdeError(e.to_string()))
    }

    /// 导出为 YAML
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| EngineError::SerdeError(e.to_string()))
    }
}
