//! 测试计划执行器

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tpe_plan::TestPlan;

use crate::config::EngineConfig;
use crate::driver::VirtualizationDriver;
use crate::interpreter::InterpreterRegistry;
use crate::launcher::ProcessLauncher;
use crate::report::TestPlanReport;
use crate::resource::{ResourceLeases, ResourceManager};
use crate::scheduler::StepScheduler;
use crate::supervisor::ExecutionSupervisor;
use crate::{EngineError, Result};

/// 测试计划执行器
///
/// 先校验整个计划，再按文档顺序逐个执行测试用例。
/// 通过 [`PlanRunner::abort_handle`] 取得的令牌可以在任意时刻中止执行：
/// 正在运行的子进程被终止，正在进行的重启调用会完成，准备与刷新中的等待立即结束，
/// 排队条目记为 Skipped，后续测试用例不再开始。
pub struct PlanRunner {
    driver: Arc<dyn VirtualizationDriver>,
    launcher: Arc<dyn ProcessLauncher>,
    config: Arc<EngineConfig>,
    interpreters: Arc<InterpreterRegistry>,
    leases: ResourceLeases,
    cancel: CancellationToken,
}

impl PlanRunner {
    /// 创建执行器，配置无效时返回 `EngineError::ConfigError`
    pub fn new(
        driver: Arc<dyn VirtualizationDriver>,
        launcher: Arc<dyn ProcessLauncher>,
        config: EngineConfig,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| EngineError::ConfigError(e.to_string()))?;

        let interpreters = Arc::new(InterpreterRegistry::from_config(&config));

        Ok(Self {
            driver,
            launcher,
            config: Arc::new(config),
            interpreters,
            leases: ResourceLeases::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// 设置解释器注册表
    pub fn with_interpreters(mut self, interpreters: InterpreterRegistry) -> Self {
        self.interpreters = Arc::new(interpreters);
        self
    }

    /// 与其他执行器共享虚拟机租约
    pub fn with_leases(mut self, leases: ResourceLeases) -> Self {
        self.leases = leases;
        self
    }

    /// 使用外部的取消令牌
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn leases(&self) -> &ResourceLeases {
        &self.leases
    }

    /// 中止令牌
    pub fn abort_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// 中止执行
    pub fn abort(&self) {
        warn!("收到中止请求");
        self.cancel.cancel();
    }

    fn scheduler(&self) -> StepScheduler {
        let resources = Arc::new(
            ResourceManager::new(Arc::clone(&self.driver), Arc::clone(&self.config))
                .with_leases(self.leases.clone()),
        );
        let supervisor = Arc::new(ExecutionSupervisor::new(
            Arc::clone(&self.launcher),
            Arc::clone(&self.interpreters),
            Arc::clone(&resources),
        ));
        StepScheduler::new(resources, supervisor)
            .with_validation_rules(self.config.validation_rules())
    }

    /// 执行测试计划
    ///
    /// 校验失败时返回 `EngineError::Validation`，不执行任何用例。
    pub async fn run(&self, plan: &TestPlan) -> Result<TestPlanReport> {
        plan.validate_with(&self.config.validation_rules())?;

        let mut report = TestPlanReport::new(plan);
        info!(
            "开始执行测试计划: {} (版本 {}, {} 个测试用例, 运行 ID {})",
            plan.name,
            plan.version,
            plan.test_cases.len(),
            report.run_id
        );

        let scheduler = self.scheduler();
        let total = plan.test_cases.len();

        for (i, tc) in plan.test_cases.iter().enumerate() {
            if self.cancel.is_cancelled() {
                warn!("测试计划已中止, 剩余 {} 个测试用例不再执行", total - i);
                report.mark_aborted(plan.test_cases[i..].iter().map(|tc| tc.name.clone()));
                break;
            }

            info!("执行测试用例 {}/{}: {}", i + 1, total, tc.name);
            let case_report = scheduler.run_test_case(tc, &self.cancel).await?;
            report.add_test_case(case_report);
        }

        if self.cancel.is_cancelled() && !report.aborted {
            report.mark_aborted(std::iter::empty());
        }

        report.finalize();
        info!(
            "测试计划 {} 执行完成: {:?}{}",
            plan.name,
            report.verdict,
            if report.aborted { " (已中止)" } else { "" }
        );

        Ok(report)
    }
}
