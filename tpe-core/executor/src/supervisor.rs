//! 步骤执行监督

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use tpe_plan::Step;

use crate::config::RestartBudget;
use crate::interpreter::InterpreterRegistry;
use crate::launcher::{CommandSpec, ExitInfo, ProcessLauncher, WaitStatus};
use crate::report::{OutcomeKind, StepOutcome, StepStatus};
use crate::resource::{ResourceManager, ResourceRuntimeState, ResourceState};
use crate::EngineError;

/// 步骤进程通过该环境变量得知结果目录
pub const RESULTS_DIR_ENV: &str = "TPE_RESULTS_DIR";

/// 单个步骤的结果目录
struct ResultsDir {
    remote: String,
    local: PathBuf,
}

/// 子进程执行结果
enum Execution {
    Exited(ExitInfo),
    TimedOut,
    Cancelled,
    Failed(EngineError),
}

/// 步骤执行监督器
///
/// 启动前下发测试目录，启动子进程并在超时时强制终止，
/// 正常结束后执行 PostWait、回收结果与重启。
pub struct ExecutionSupervisor {
    launcher: Arc<dyn ProcessLauncher>,
    interpreters: Arc<InterpreterRegistry>,
    resources: Arc<ResourceManager>,
}

impl ExecutionSupervisor {
    pub fn new(
        launcher: Arc<dyn ProcessLauncher>,
        interpreters: Arc<InterpreterRegistry>,
        resources: Arc<ResourceManager>,
    ) -> Self {
        Self {
            launcher,
            interpreters,
            resources,
        }
    }

    pub fn build_command(&self, step: &Step) -> CommandSpec {
        self.interpreters.build_command(step)
    }

    /// 执行一个步骤
    ///
    /// - 退出码 0 为 Pass，其他为 Fail
    /// - 下发测试目录或创建结果目录失败时不启动进程，记为 Fail
    /// - 超过 `timeout` 终止进程，记为 TimedOut，不再执行 PostWait、结果回收与重启
    /// - 结果回收失败时 Pass 改记为 Fail
    /// - 重启未能在时限内恢复响应时记为 RestartFailure，覆盖 Pass
    /// - 收到取消信号时终止进程，记为 Cancelled
    pub async fn run_step(
        &self,
        state: &mut ResourceRuntimeState,
        index: usize,
        step: &Step,
        cancel: &CancellationToken,
    ) -> StepOutcome {
        let mut outcome = StepOutcome::begin(
            state.resource_id(),
            OutcomeKind::Step,
            Some(index),
            &step.description,
        );
        let step_timeout = Duration::from_secs(step.timeout);
        let started = Instant::now();

        if let Err(e) = state.begin(ResourceState::Executing, step_timeout) {
            return outcome.finish(StepStatus::Fail).with_error(e);
        }

        let mut command = self.build_command(step);
        info!("[{}] 执行步骤 {}: {}", state.resource_id(), index, step.description);
        debug!(
            "[{}] 命令: {} (目录 {})",
            state.resource_id(),
            command.command_line(),
            command.directory
        );
        outcome = outcome.with_command(command.command_line());

        let results = match self.prepare_artifacts(state, step).await {
            Ok(results) => results,
            Err(e) => {
                error!("[{}] 步骤 {} 准备文件失败: {}", state.resource_id(), index, e);
                if let Err(e) = state.finish(false) {
                    error!("[{}] {}", state.resource_id(), e);
                }
                return outcome.finish(StepStatus::Fail).with_error(e);
            }
        };
        if let Some(results) = &results {
            command = command.env(RESULTS_DIR_ENV, &results.remote);
        }

        let execution = self
            .execute(state.virtual_machine(), &command, step_timeout, cancel)
            .await;

        let mut completed = false;
        let mut status = match execution {
            Execution::Exited(info) => {
                completed = true;
                let exit_code = info.exit_code;
                let success = info.is_success();
                outcome = outcome.with_exit(exit_code, info.output);
                if success {
                    StepStatus::Pass
                } else {
                    outcome = outcome.with_error(EngineError::StepFailure { exit_code });
                    StepStatus::Fail
                }
            }
            Execution::TimedOut => {
                warn!(
                    "[{}] 步骤 {} 超时 ({} 秒), 已终止",
                    state.resource_id(),
                    index,
                    step.timeout
                );
                outcome = outcome.with_error(EngineError::StepTimeout {
                    seconds: step.timeout,
                });
                StepStatus::TimedOut
            }
            Execution::Cancelled => {
                outcome = outcome.with_error(EngineError::Cancelled);
                StepStatus::Cancelled
            }
            Execution::Failed(e) => {
                error!("[{}] 步骤 {} 执行失败: {}", state.resource_id(), index, e);
                outcome = outcome.with_error(e);
                StepStatus::Fail
            }
        };

        if completed {
            if step.post_wait > 0 {
                debug!("[{}] 步骤后等待 {} 秒", state.resource_id(), step.post_wait);
                tokio::select! {
                    _ = sleep(Duration::from_secs(step.post_wait)) => {}
                    _ = cancel.cancelled() => {
                        warn!("[{}] 等待期间收到取消信号", state.resource_id());
                    }
                }
            }

            if let Some(results) = &results {
                match self.collect_results(state, results).await {
                    Ok(()) => outcome = outcome.with_results(results.local.display().to_string()),
                    Err(e) if status == StepStatus::Pass => {
                        status = StepStatus::Fail;
                        outcome = outcome.with_error(e);
                    }
                    Err(e) => warn!("[{}] {}", state.resource_id(), e),
                }
            }

            if step.restart_computer.value && !cancel.is_cancelled() {
                let bound = self.restart_bound(step_timeout, started.elapsed());
                if let Err(e) = self
                    .resources
                    .restart(state, step.restart_computer.wait, bound)
                    .await
                {
                    if status == StepStatus::Pass {
                        status = StepStatus::RestartFailure;
                        outcome = outcome.with_error(e);
                    } else {
                        warn!("[{}] 步骤失败后重启也失败: {}", state.resource_id(), e);
                    }
                }
            }
        }

        if let Err(e) = state.finish(status.is_pass()) {
            error!("[{}] {}", state.resource_id(), e);
        }

        info!(
            "[{}] 步骤 {} 结束: {:?}",
            state.resource_id(),
            index,
            status
        );
        outcome.finish(status)
    }

    /// 下发测试目录，按配置创建结果目录
    async fn prepare_artifacts(
        &self,
        state: &ResourceRuntimeState,
        step: &Step,
    ) -> Result<Option<ResultsDir>, EngineError> {
        let config = self.resources.config();
        let vm = state.virtual_machine();

        if let Some(source) = &step.source {
            let local = config.resolve_source(source);
            info!(
                "[{}] 下发测试目录 {} -> {}",
                state.resource_id(),
                local.display(),
                step.directory
            );
            self.launcher
                .stage_directory(vm, &local, &step.directory)
                .await
                .map_err(|e| artifact_error(state, e))?;
        }

        let Some(root) = &config.results_root else {
            return Ok(None);
        };
        let id = Uuid::new_v4().to_string();
        let results = ResultsDir {
            remote: config.remote_results_dir(&step.directory, &id),
            local: root.join(&id),
        };
        debug!("[{}] 结果目录: {}", state.resource_id(), results.remote);
        self.launcher
            .create_directory(vm, &results.remote)
            .await
            .map_err(|e| artifact_error(state, e))?;
        Ok(Some(results))
    }

    async fn collect_results(
        &self,
        state: &ResourceRuntimeState,
        results: &ResultsDir,
    ) -> Result<(), EngineError> {
        debug!(
            "[{}] 回收结果 {} -> {}",
            state.resource_id(),
            results.remote,
            results.local.display()
        );
        self.launcher
            .collect_results(state.virtual_machine(), &results.remote, &results.local)
            .await
            .map_err(|e| artifact_error(state, e))
    }

    /// 步骤后重启等待的时限
    fn restart_bound(&self, step_timeout: Duration, elapsed: Duration) -> Duration {
        let config = self.resources.config();
        match config.restart_budget {
            RestartBudget::Separate => config.restart_timeout(),
            RestartBudget::WithinStepTimeout => step_timeout.saturating_sub(elapsed),
        }
    }

    async fn execute(
        &self,
        vm: &str,
        command: &CommandSpec,
        limit: Duration,
        cancel: &CancellationToken,
    ) -> Execution {
        let mut handle = match self.launcher.launch(vm, command).await {
            Ok(handle) => handle,
            Err(e) => return Execution::Failed(e.into()),
        };

        let waited = tokio::select! {
            result = handle.wait(limit) => Some(result),
            _ = cancel.cancelled() => None,
        };

        let execution = match waited {
            Some(Ok(WaitStatus::Exited(info))) => return Execution::Exited(info),
            Some(Ok(WaitStatus::TimedOut)) => Execution::TimedOut,
            Some(Err(e)) => Execution::Failed(e.into()),
            None => {
                warn!("[{}] 收到取消信号, 终止进程", vm);
                Execution::Cancelled
            }
        };

        if let Err(e) = handle.kill().await {
            warn!("[{}] 终止进程失败: {}", vm, e);
        }
        execution
    }
}

fn artifact_error(state: &ResourceRuntimeState, err: impl ToString) -> EngineError {
    EngineError::ArtifactTransfer {
        resource_id: state.resource_id().to_string(),
        reason: err.to_string(),
    }
}
