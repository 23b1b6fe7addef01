//! 资源管理
//!
//! 每个资源（虚拟机）的生命周期：
//!
//! ```text
//! Uninitialized -> Preparing -> Ready <-> Refreshing
//!                                 Ready <-> Executing
//! Preparing | Refreshing | Executing -> Failed
//! Ready -> Done
//! ```
//!
//! 运行时状态由执行该资源队列的工作任务独占，不与其他任务共享。
//! 虚拟机级别的互斥通过 [`ResourceLeases`] 保证。

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::{sleep, timeout, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tpe_plan::{PrepareVirtualMachine, RestartComputer};

use crate::config::EngineConfig;
use crate::driver::{DriverError, VirtualizationDriver};
use crate::{EngineError, Result};

// ============================================
// 生命周期状态
// ============================================

/// 资源生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    Uninitialized,
    Preparing,
    Ready,
    Refreshing,
    Executing,
    Failed,
    Done,
}

impl ResourceState {
    pub fn can_transition_to(self, next: ResourceState) -> bool {
        use ResourceState::*;
        matches!(
            (self, next),
            (Uninitialized, Preparing)
                | (Preparing, Ready)
                | (Preparing, Failed)
                | (Ready, Refreshing)
                | (Ready, Executing)
                | (Ready, Done)
                | (Refreshing, Ready)
                | (Refreshing, Failed)
                | (Executing, Ready)
                | (Executing, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ResourceState::Failed | ResourceState::Done)
    }
}

/// 资源运行时状态
#[derive(Debug, Clone)]
pub struct ResourceRuntimeState {
    init: PrepareVirtualMachine,
    state: ResourceState,
    deadline: Option<Instant>,
}

impl ResourceRuntimeState {
    pub fn new(init: PrepareVirtualMachine) -> Self {
        Self {
            init,
            state: ResourceState::Uninitialized,
            deadline: None,
        }
    }

    pub fn resource_id(&self) -> &str {
        &self.init.resource_id
    }

    pub fn virtual_machine(&self) -> &str {
        &self.init.virtual_machine
    }

    /// 准备阶段确立的检查点，刷新时恢复到这里
    pub fn checkpoint(&self) -> &str {
        &self.init.checkpoint
    }

    pub fn init(&self) -> &PrepareVirtualMachine {
        &self.init
    }

    pub fn state(&self) -> ResourceState {
        self.state
    }

    /// 当前操作的截止时间
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn prepare_timeout(&self) -> Duration {
        Duration::from_secs(self.init.timeout)
    }

    pub fn transition(&mut self, next: ResourceState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                resource_id: self.init.resource_id.clone(),
                from: self.state,
                to: next,
            });
        }
        debug!("[{}] 状态 {:?} -> {:?}", self.init.resource_id, self.state, next);
        self.state = next;
        Ok(())
    }

    /// 进入一个有时限的操作状态
    pub(crate) fn begin(&mut self, next: ResourceState, bound: Duration) -> Result<()> {
        self.transition(next)?;
        self.deadline = Some(Instant::now() + bound);
        Ok(())
    }

    /// 结束当前操作，成功回到 Ready，否则进入 Failed
    pub(crate) fn finish(&mut self, success: bool) -> Result<()> {
        self.deadline = None;
        self.transition(if success {
            ResourceState::Ready
        } else {
            ResourceState::Failed
        })
    }
}

// ============================================
// 资源租约
// ============================================

/// 按虚拟机名称的互斥租约
///
/// 克隆后共享同一组锁，可以在多个执行器之间共用。
#[derive(Debug, Clone, Default)]
pub struct ResourceLeases {
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl ResourceLeases {
    pub fn new() -> Self {
        Self::default()
    }

    /// 签出虚拟机，已被占用时等待
    pub async fn checkout(&self, vm: &str) -> ResourceLease {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.entry(vm.to_string()).or_default().clone()
        };
        let guard = lock.lock_owned().await;
        debug!("签出虚拟机: {}", vm);
        ResourceLease {
            vm: vm.to_string(),
            _guard: guard,
        }
    }

    /// 虚拟机当前是否已被签出
    pub async fn is_checked_out(&self, vm: &str) -> bool {
        let locks = self.locks.lock().await;
        locks
            .get(vm)
            .map(|lock| lock.try_lock().is_err())
            .unwrap_or(false)
    }
}

/// 虚拟机租约，释放时自动归还
#[derive(Debug)]
pub struct ResourceLease {
    vm: String,
    _guard: OwnedMutexGuard<()>,
}

impl ResourceLease {
    pub fn virtual_machine(&self) -> &str {
        &self.vm
    }
}

impl Drop for ResourceLease {
    fn drop(&mut self) {
        debug!("归还虚拟机: {}", self.vm);
    }
}

// ============================================
// 资源管理器
// ============================================

/// 资源管理器
///
/// 通过虚拟化驱动执行检查点恢复、工具/构建安装和重启。
pub struct ResourceManager {
    driver: Arc<dyn VirtualizationDriver>,
    config: Arc<EngineConfig>,
    leases: ResourceLeases,
}

impl ResourceManager {
    pub fn new(driver: Arc<dyn VirtualizationDriver>, config: Arc<EngineConfig>) -> Self {
        Self {
            driver,
            config,
            leases: ResourceLeases::new(),
        }
    }

    /// 使用共享的租约表
    pub fn with_leases(mut self, leases: ResourceLeases) -> Self {
        self.leases = leases;
        self
    }

    pub fn leases(&self) -> &ResourceLeases {
        &self.leases
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// 签出资源对应的虚拟机，等待不超过 `deadline`
    async fn checkout(
        &self,
        state: &ResourceRuntimeState,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<ResourceLease> {
        tokio::select! {
            acquired = timeout_at(deadline, self.leases.checkout(state.virtual_machine())) => {
                acquired.map_err(|_| EngineError::ResourceUnavailable {
                    resource_id: state.resource_id().to_string(),
                    reason: format!(
                        "虚拟机 {} 在 {} 秒内未能签出",
                        state.virtual_machine(),
                        state.prepare_timeout().as_secs()
                    ),
                })
            }
            _ = cancel.cancelled() => {
                warn!("[{}] 等待签出期间收到取消信号", state.resource_id());
                Err(EngineError::Cancelled)
            }
        }
    }

    /// 准备资源
    ///
    /// 签出虚拟机后恢复检查点、安装工具、部署构建、PostWait、按需重启。
    /// 签出等待与准备共用资源的 `timeout`。
    /// 收到取消信号时停止等待并返回 `EngineError::Cancelled`，进行中的重启不会被打断。
    pub async fn prepare_resource(
        &self,
        state: &mut ResourceRuntimeState,
        cancel: &CancellationToken,
    ) -> Result<ResourceLease> {
        let bound = state.prepare_timeout();
        state.begin(ResourceState::Preparing, bound)?;
        let deadline = Instant::now() + bound;

        info!(
            "[{}] 准备资源: 虚拟机 {}, 检查点 {}",
            state.resource_id(),
            state.virtual_machine(),
            state.checkpoint()
        );

        let result = match self.checkout(state, deadline, cancel).await {
            Ok(lease) => match timeout_at(deadline, self.prepare_inner(state.init(), cancel)).await {
                Ok(Ok(())) => Ok(lease),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(EngineError::ResourceTimeout {
                    resource_id: state.resource_id().to_string(),
                    seconds: bound.as_secs(),
                }),
            },
            Err(e) => Err(e),
        };

        self.settle(state, "准备", result)
    }

    /// 刷新资源：恢复到准备时的检查点
    ///
    /// 时限为 `refresh_timeout_secs`，未配置时沿用资源准备超时。
    pub async fn refresh_resource(
        &self,
        state: &mut ResourceRuntimeState,
        restart: RestartComputer,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let bound = self.config.refresh_timeout(state.prepare_timeout());
        state.begin(ResourceState::Refreshing, bound)?;

        info!(
            "[{}] 刷新资源: 恢复检查点 {}",
            state.resource_id(),
            state.checkpoint()
        );

        let result = match timeout(bound, self.refresh_inner(state.init(), restart, cancel)).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::ResourceTimeout {
                resource_id: state.resource_id().to_string(),
                seconds: bound.as_secs(),
            }),
        };

        self.settle(state, "刷新", result)
    }

    /// 重启资源，`wait` 时等待恢复响应，总时长不超过 `bound`
    pub async fn restart(
        &self,
        state: &ResourceRuntimeState,
        wait: bool,
        bound: Duration,
    ) -> Result<()> {
        self.restart_vm(state.resource_id(), state.virtual_machine(), wait, bound)
            .await
    }

    fn settle<T>(
        &self,
        state: &mut ResourceRuntimeState,
        operation: &str,
        result: Result<T>,
    ) -> Result<T> {
        state.finish(result.is_ok())?;
        match &result {
            Ok(_) => info!("[{}] 资源{}完成", state.resource_id(), operation),
            Err(EngineError::Cancelled) => {
                warn!("[{}] 资源{}已取消", state.resource_id(), operation)
            }
            Err(e) => error!("[{}] 资源{}失败: {}", state.resource_id(), operation, e),
        }
        result
    }

    async fn prepare_inner(
        &self,
        init: &PrepareVirtualMachine,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.restore(init, cancel).await?;
        self.install(init, cancel).await?;
        self.post_wait(init, cancel).await?;

        if init.restart_computer.value {
            self.restart_vm(
                &init.resource_id,
                &init.virtual_machine,
                init.restart_computer.wait,
                self.config.restart_timeout(),
            )
            .await?;
        }

        Ok(())
    }

    async fn refresh_inner(
        &self,
        init: &PrepareVirtualMachine,
        restart: RestartComputer,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.restore(init, cancel).await?;
        if self.config.reinstall_on_refresh {
            self.install(init, cancel).await?;
        }
        self.post_wait(init, cancel).await?;

        if restart.value {
            self.restart_vm(
                &init.resource_id,
                &init.virtual_machine,
                restart.wait,
                self.config.restart_timeout(),
            )
            .await?;
        }

        Ok(())
    }

    async fn restore(&self, init: &PrepareVirtualMachine, cancel: &CancellationToken) -> Result<()> {
        ensure_active(cancel)?;
        debug!(
            "[{}] 恢复检查点: {}/{}",
            init.resource_id, init.virtual_machine, init.checkpoint
        );
        self.driver
            .restore_checkpoint(&init.virtual_machine, &init.checkpoint)
            .await
            .map_err(|e| driver_error(&init.resource_id, e))?;

        if self.config.verify_after_restore {
            let bound = self.config.boot_wait();
            tokio::select! {
                responsive = timeout(bound, self.until_responsive(&init.virtual_machine)) => {
                    if responsive.is_err() {
                        return Err(EngineError::ResourceUnavailable {
                            resource_id: init.resource_id.clone(),
                            reason: format!("恢复检查点后 {} 秒内未响应", bound.as_secs()),
                        });
                    }
                }
                _ = cancel.cancelled() => {
                    warn!("[{}] 等待虚拟机响应期间收到取消信号", init.resource_id);
                    return Err(EngineError::Cancelled);
                }
            }
        }

        Ok(())
    }

    async fn install(&self, init: &PrepareVirtualMachine, cancel: &CancellationToken) -> Result<()> {
        for tool in &init.tools {
            ensure_active(cancel)?;
            debug!("[{}] 安装工具: {}", init.resource_id, tool);
            self.driver
                .install_tool(&init.virtual_machine, tool)
                .await
                .map_err(|e| driver_error(&init.resource_id, e))?;
        }
        for build in &init.builds {
            ensure_active(cancel)?;
            debug!("[{}] 部署构建: {}", init.resource_id, build);
            self.driver
                .deploy_build(&init.virtual_machine, build)
                .await
                .map_err(|e| driver_error(&init.resource_id, e))?;
        }
        Ok(())
    }

    async fn post_wait(&self, init: &PrepareVirtualMachine, cancel: &CancellationToken) -> Result<()> {
        if init.post_wait == 0 {
            return Ok(());
        }
        debug!("[{}] 等待 {} 秒", init.resource_id, init.post_wait);
        tokio::select! {
            _ = sleep(Duration::from_secs(init.post_wait)) => Ok(()),
            _ = cancel.cancelled() => {
                warn!("[{}] 等待期间收到取消信号", init.resource_id);
                Err(EngineError::Cancelled)
            }
        }
    }

    async fn restart_vm(
        &self,
        resource_id: &str,
        vm: &str,
        wait: bool,
        bound: Duration,
    ) -> Result<()> {
        info!("[{}] 重启虚拟机 {} (等待响应: {})", resource_id, vm, wait);

        let restart = async {
            self.driver.restart(vm, wait).await?;
            if wait {
                self.until_responsive(vm).await;
            }
            Ok::<(), DriverError>(())
        };

        match timeout(bound, restart).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(EngineError::RestartFailure {
                resource_id: resource_id.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => {
                warn!("[{}] 虚拟机 {} 重启后未恢复响应", resource_id, vm);
                Err(EngineError::RestartFailure {
                    resource_id: resource_id.to_string(),
                    reason: format!("{} 秒内未恢复响应", bound.as_secs()),
                })
            }
        }
    }

    async fn until_responsive(&self, vm: &str) {
        let interval = self.config.poll_interval();
        while !self.driver.is_responsive(vm).await {
            sleep(interval).await;
        }
    }
}

fn ensure_active(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(EngineError::Cancelled);
    }
    Ok(())
}

fn driver_error(resource_id: &str, err: DriverError) -> EngineError {
    match err {
        DriverError::CheckpointNotFound { checkpoint, .. } => EngineError::CheckpointNotFound {
            resource_id: resource_id.to_string(),
            checkpoint,
        },
        other => EngineError::ResourceUnavailable {
            resource_id: resource_id.to_string(),
            reason: other.to_string(),
        },
    }
}
