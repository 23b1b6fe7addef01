//! 步骤调度
//!
//! 一个测试用例内：
//! - 每个声明的资源一个工作任务，各自独立准备资源
//! - 步骤按资源分队列，保持文档顺序，上一条目完成后才开始下一条
//! - 资源之间并发执行，不保证相互顺序
//! - 某个资源的条目失败后，该资源剩余条目记为 Skipped，其他资源不受影响

use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tpe_plan::{PrepareVirtualMachine, TestCase, TestStepItem, ValidationRules};

use crate::report::{OutcomeKind, ResultAggregator, StepOutcome, StepStatus, TestCaseReport};
use crate::resource::{ResourceManager, ResourceRuntimeState, ResourceState};
use crate::supervisor::ExecutionSupervisor;
use crate::{EngineError, Result};

/// 单个资源的执行队列
struct ResourceQueue {
    init: PrepareVirtualMachine,
    items: Vec<(usize, TestStepItem)>,
}

/// 按资源拆分条目，资源顺序与声明顺序一致
fn partition(tc: &TestCase) -> Vec<ResourceQueue> {
    tc.resource_init
        .iter()
        .map(|init| ResourceQueue {
            init: init.clone(),
            items: tc
                .items_for(&init.resource_id)
                .map(|(index, item)| (index, item.clone()))
                .collect(),
        })
        .collect()
}

fn kind_of(item: &TestStepItem) -> OutcomeKind {
    match item {
        TestStepItem::Step(_) => OutcomeKind::Step,
        TestStepItem::RefreshResource(_) => OutcomeKind::Refresh,
    }
}

/// 错误对应的条目状态
fn status_for(error: &EngineError) -> StepStatus {
    match error {
        EngineError::ResourceTimeout { .. } | EngineError::StepTimeout { .. } => {
            StepStatus::TimedOut
        }
        EngineError::RestartFailure { .. } => StepStatus::RestartFailure,
        EngineError::Cancelled => StepStatus::Cancelled,
        _ => StepStatus::Fail,
    }
}

/// 步骤调度器
pub struct StepScheduler {
    resources: Arc<ResourceManager>,
    supervisor: Arc<ExecutionSupervisor>,
    rules: ValidationRules,
}

impl StepScheduler {
    pub fn new(resources: Arc<ResourceManager>, supervisor: Arc<ExecutionSupervisor>) -> Self {
        Self {
            resources,
            supervisor,
            rules: ValidationRules::default(),
        }
    }

    /// 设置校验规则
    pub fn with_validation_rules(mut self, rules: ValidationRules) -> Self {
        self.rules = rules;
        self
    }

    /// 执行一个测试用例
    ///
    /// 校验失败时返回 `EngineError::Validation`，不执行任何条目。
    pub async fn run_test_case(
        &self,
        tc: &TestCase,
        cancel: &CancellationToken,
    ) -> Result<TestCaseReport> {
        tc.validate_with(&self.rules)?;

        let started_at = Utc::now();
        info!(
            "开始测试用例: {} ({} 个资源, {} 个条目)",
            tc.name,
            tc.resource_init.len(),
            tc.test_steps.len()
        );

        let (tx, rx) = async_channel::unbounded();
        let mut workers = Vec::with_capacity(tc.resource_init.len());

        for queue in partition(tc) {
            let resource_id = queue.init.resource_id.clone();
            let pending = queue.items.clone();
            let worker = ResourceWorker {
                resources: Arc::clone(&self.resources),
                supervisor: Arc::clone(&self.supervisor),
                outcomes: tx.clone(),
                cancel: cancel.clone(),
            };
            debug!("[{}] 启动资源工作任务 ({} 个条目)", resource_id, queue.items.len());
            workers.push((resource_id, pending, tokio::spawn(worker.run(queue))));
        }
        drop(tx);

        let mut aggregator = ResultAggregator::new();
        while let Ok(outcome) = rx.recv().await {
            aggregator.record(outcome);
        }

        for (resource_id, pending, handle) in workers {
            if let Err(e) = handle.await {
                error!("[{}] 资源工作任务异常退出: {}", resource_id, e);
                record_abandoned(&mut aggregator, &resource_id, pending, &e.to_string());
            }
        }

        let report = aggregator.into_report(&tc.name, started_at);
        info!(
            "测试用例 {} 完成: {:?} (通过 {}/{})",
            tc.name, report.verdict, report.summary.passed, report.summary.total
        );
        Ok(report)
    }
}

/// 为异常退出的工作任务补齐结果
///
/// 准备未上报时记一条失败的准备结果；否则第一条未上报的条目记为失败。
/// 其余未上报的条目记为 Skipped。
fn record_abandoned(
    aggregator: &mut ResultAggregator,
    resource_id: &str,
    items: Vec<(usize, TestStepItem)>,
    reason: &str,
) {
    let reported: Vec<(OutcomeKind, Option<usize>)> = aggregator
        .outcomes_for(resource_id)
        .map(|outcome| (outcome.kind, outcome.index))
        .collect();

    let mut blamed = false;
    if !reported.iter().any(|(kind, _)| *kind == OutcomeKind::Prepare) {
        aggregator.record(
            StepOutcome::begin(
                resource_id,
                OutcomeKind::Prepare,
                None,
                format!("准备资源 {}", resource_id),
            )
            .finish(StepStatus::Fail)
            .with_error(reason),
        );
        blamed = true;
    }

    for (index, item) in items {
        if reported.iter().any(|(_, i)| *i == Some(index)) {
            continue;
        }
        let outcome = if blamed {
            StepOutcome::skipped(resource_id, kind_of(&item), Some(index), item.description())
        } else {
            blamed = true;
            StepOutcome::begin(resource_id, kind_of(&item), Some(index), item.description())
                .finish(StepStatus::Fail)
                .with_error(reason)
        };
        aggregator.record(outcome);
    }
}

/// 资源工作任务
struct ResourceWorker {
    resources: Arc<ResourceManager>,
    supervisor: Arc<ExecutionSupervisor>,
    outcomes: async_channel::Sender<StepOutcome>,
    cancel: CancellationToken,
}

impl ResourceWorker {
    async fn run(self, queue: ResourceQueue) {
        let ResourceQueue { init, items } = queue;
        let resource_id = init.resource_id.clone();
        let label = format!("准备资源 {}", resource_id);
        let mut state = ResourceRuntimeState::new(init);

        if self.cancel.is_cancelled() {
            self.emit(StepOutcome::skipped(&resource_id, OutcomeKind::Prepare, None, label))
                .await;
            self.skip_all(&resource_id, items).await;
            return;
        }

        let prepare = StepOutcome::begin(&resource_id, OutcomeKind::Prepare, None, label);

        // 租约在任务结束时释放
        let _lease = match self.resources.prepare_resource(&mut state, &self.cancel).await {
            Ok(lease) => lease,
            Err(e) => {
                self.emit(prepare.finish(status_for(&e)).with_error(e)).await;
                self.skip_all(&resource_id, items).await;
                return;
            }
        };
        self.emit(prepare.finish(StepStatus::Pass)).await;

        let mut queue = items.into_iter();
        while let Some((index, item)) = queue.next() {
            if self.cancel.is_cancelled() {
                warn!("[{}] 收到取消信号, 跳过剩余条目", resource_id);
                self.emit(StepOutcome::skipped(
                    &resource_id,
                    kind_of(&item),
                    Some(index),
                    item.description(),
                ))
                .await;
                self.skip_all(&resource_id, queue).await;
                break;
            }

            let outcome = self.run_item(&mut state, index, &item).await;
            let passed = outcome.is_pass();
            self.emit(outcome).await;

            if !passed {
                warn!("[{}] 条目 {} 未通过, 跳过该资源的剩余条目", resource_id, index);
                self.skip_all(&resource_id, queue).await;
                break;
            }
        }

        if state.state() == ResourceState::Ready {
            if let Err(e) = state.transition(ResourceState::Done) {
                error!("[{}] {}", resource_id, e);
            }
        }
        debug!("[{}] 资源工作任务结束: {:?}", resource_id, state.state());
    }

    async fn run_item(
        &self,
        state: &mut ResourceRuntimeState,
        index: usize,
        item: &TestStepItem,
    ) -> StepOutcome {
        match item {
            TestStepItem::Step(step) => {
                self.supervisor
                    .run_step(state, index, step, &self.cancel)
                    .await
            }
            TestStepItem::RefreshResource(refresh) => {
                let outcome = StepOutcome::begin(
                    state.resource_id(),
                    OutcomeKind::Refresh,
                    Some(index),
                    item.description(),
                );
                match self
                    .resources
                    .refresh_resource(state, refresh.restart_computer, &self.cancel)
                    .await
                {
                    Ok(()) => outcome.finish(StepStatus::Pass),
                    Err(e) => outcome.finish(status_for(&e)).with_error(e),
                }
            }
        }
    }

    async fn skip_all<I>(&self, resource_id: &str, items: I)
    where
        I: IntoIterator<Item = (usize, TestStepItem)>,
    {
        for (index, item) in items {
            self.emit(StepOutcome::skipped(
                resource_id,
                kind_of(&item),
                Some(index),
                item.description(),
            ))
            .await;
        }
    }

    async fn emit(&self, outcome: StepOutcome) {
        if self.outcomes.send(outcome).await.is_err() {
            debug!("结果通道已关闭");
        }
    }
}
