//! 集成测试共用的驱动与启动器替身
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, Instant};

use tpe_executor::{
    CommandSpec, DriverError, EngineConfig, ExitInfo, LaunchError, PlanRunner, ProcessHandle,
    ProcessLauncher, VirtualizationDriver, WaitStatus,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("tpe_executor=debug")
        .with_test_writer()
        .try_init();
}

// ============================================
// 虚拟化驱动替身
// ============================================

/// 驱动调用记录
#[derive(Debug, Clone)]
pub struct DriverEvent {
    pub vm: String,
    pub action: String,
    pub at: Instant,
}

/// 内存中的虚拟化驱动
#[derive(Default)]
pub struct FakeDriver {
    restore_delay: Duration,
    missing_checkpoints: HashSet<String>,
    unresponsive_after_restart: HashSet<String>,
    panic_on_restart: HashSet<String>,
    down: Mutex<HashSet<String>>,
    events: Mutex<Vec<DriverEvent>>,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_restore_delay(mut self, delay: Duration) -> Self {
        self.restore_delay = delay;
        self
    }

    /// 该虚拟机上找不到任何检查点
    pub fn with_missing_checkpoint(mut self, vm: &str) -> Self {
        self.missing_checkpoints.insert(vm.to_string());
        self
    }

    /// 该虚拟机重启后不再响应
    pub fn with_unresponsive_after_restart(mut self, vm: &str) -> Self {
        self.unresponsive_after_restart.insert(vm.to_string());
        self
    }

    /// 该虚拟机的重启调用直接 panic
    pub fn with_panic_on_restart(mut self, vm: &str) -> Self {
        self.panic_on_restart.insert(vm.to_string());
        self
    }

    pub fn events(&self) -> Vec<DriverEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn events_for(&self, vm: &str, action: &str) -> Vec<DriverEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.vm == vm && e.action == action)
            .collect()
    }

    fn record(&self, vm: &str, action: impl Into<String>) {
        self.events.lock().unwrap().push(DriverEvent {
            vm: vm.to_string(),
            action: action.into(),
            at: Instant::now(),
        });
    }
}

#[async_trait]
impl VirtualizationDriver for FakeDriver {
    async fn restore_checkpoint(&self, vm: &str, checkpoint: &str) -> Result<(), DriverError> {
        sleep(self.restore_delay).await;
        if self.missing_checkpoints.contains(vm) {
            return Err(DriverError::CheckpointNotFound {
                vm: vm.to_string(),
                checkpoint: checkpoint.to_string(),
            });
        }
        self.down.lock().unwrap().remove(vm);
        self.record(vm, "restored");
        Ok(())
    }

    async fn install_tool(&self, vm: &str, tool: &str) -> Result<(), DriverError> {
        self.record(vm, format!("tool:{}", tool));
        Ok(())
    }

    async fn deploy_build(&self, vm: &str, build: &str) -> Result<(), DriverError> {
        self.record(vm, format!("build:{}", build));
        Ok(())
    }

    async fn restart(&self, vm: &str, _wait: bool) -> Result<(), DriverError> {
        if self.panic_on_restart.contains(vm) {
            panic!("{} 电源控制异常", vm);
        }
        if self.unresponsive_after_restart.contains(vm) {
            self.down.lock().unwrap().insert(vm.to_string());
        }
        self.record(vm, "restart");
        Ok(())
    }

    async fn is_responsive(&self, vm: &str) -> bool {
        !self.down.lock().unwrap().contains(vm)
    }
}

// ============================================
// 进程启动器替身
// ============================================

/// 脚本化的进程行为
#[derive(Debug, Clone)]
pub struct Script {
    pub delay: Duration,
    pub exit_code: i32,
}

impl Script {
    pub fn new(delay_ms: u64, exit_code: i32) -> Self {
        Self {
            delay: Duration::from_millis(delay_ms),
            exit_code,
        }
    }
}

/// 启动记录
#[derive(Debug, Clone)]
pub struct LaunchRecord {
    pub vm: String,
    pub command: CommandSpec,
    pub started: Instant,
    pub finished: Option<Instant>,
    pub killed: bool,
}

/// 文件传输记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRecord {
    pub vm: String,
    pub action: &'static str,
    pub from: String,
    pub to: String,
}

/// 按程序名返回预设行为的启动器，未配置的程序立即以 0 退出
#[derive(Default)]
pub struct ScriptedLauncher {
    scripts: HashMap<String, Script>,
    records: Arc<Mutex<Vec<LaunchRecord>>>,
    transfers: Mutex<Vec<TransferRecord>>,
    failing_collect: bool,
}

impl ScriptedLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(mut self, program: &str, script: Script) -> Self {
        self.scripts.insert(program.to_string(), script);
        self
    }

    /// 结果回收总是失败
    pub fn with_failing_collect(mut self) -> Self {
        self.failing_collect = true;
        self
    }

    pub fn transfers(&self) -> Vec<TransferRecord> {
        self.transfers.lock().unwrap().clone()
    }

    fn transfer(&self, vm: &str, action: &'static str, from: impl Into<String>, to: impl Into<String>) {
        self.transfers.lock().unwrap().push(TransferRecord {
            vm: vm.to_string(),
            action,
            from: from.into(),
            to: to.into(),
        });
    }

    pub fn records(&self) -> Vec<LaunchRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn record_of(&self, program: &str) -> LaunchRecord {
        self.records()
            .into_iter()
            .find(|r| r.command.program == program)
            .unwrap_or_else(|| panic!("{} 未被启动", program))
    }

    pub fn programs_on(&self, vm: &str) -> Vec<String> {
        self.records()
            .into_iter()
            .filter(|r| r.vm == vm)
            .map(|r| r.command.program)
            .collect()
    }
}

#[async_trait]
impl ProcessLauncher for ScriptedLauncher {
    async fn launch(
        &self,
        vm: &str,
        command: &CommandSpec,
    ) -> Result<Box<dyn ProcessHandle>, LaunchError> {
        let script = self
            .scripts
            .get(&command.program)
            .cloned()
            .unwrap_or_else(|| Script::new(0, 0));

        let started = Instant::now();
        let mut records = self.records.lock().unwrap();
        records.push(LaunchRecord {
            vm: vm.to_string(),
            command: command.clone(),
            started,
            finished: None,
            killed: false,
        });

        Ok(Box::new(ScriptedHandle {
            script,
            started,
            slot: records.len() - 1,
            records: Arc::clone(&self.records),
        }))
    }

    async fn stage_directory(&self, vm: &str, local: &Path, remote: &str) -> Result<(), LaunchError> {
        self.transfer(vm, "stage", local.display().to_string(), remote);
        Ok(())
    }

    async fn create_directory(&self, vm: &str, remote: &str) -> Result<(), LaunchError> {
        self.transfer(vm, "mkdir", "", remote);
        Ok(())
    }

    async fn collect_results(&self, vm: &str, remote: &str, local: &Path) -> Result<(), LaunchError> {
        if self.failing_collect {
            return Err(LaunchError::TransferFailed(format!("{} 不存在", remote)));
        }
        self.transfer(vm, "collect", remote, local.display().to_string());
        Ok(())
    }
}

struct ScriptedHandle {
    script: Script,
    started: Instant,
    slot: usize,
    records: Arc<Mutex<Vec<LaunchRecord>>>,
}

#[async_trait]
impl ProcessHandle for ScriptedHandle {
    async fn wait(&mut self, timeout: Duration) -> Result<WaitStatus, LaunchError> {
        let remaining = self.script.delay.saturating_sub(self.started.elapsed());
        if remaining > timeout {
            sleep(timeout).await;
            return Ok(WaitStatus::TimedOut);
        }

        sleep(remaining).await;
        self.records.lock().unwrap()[self.slot].finished = Some(Instant::now());
        Ok(WaitStatus::Exited(ExitInfo {
            exit_code: Some(self.script.exit_code),
            output: format!("exit {}", self.script.exit_code),
        }))
    }

    async fn kill(&mut self) -> Result<(), LaunchError> {
        let mut records = self.records.lock().unwrap();
        records[self.slot].killed = true;
        records[self.slot].finished = Some(Instant::now());
        Ok(())
    }
}

// ============================================
// 构造辅助
// ============================================

/// 测试用配置：轮询快，重启等待短
pub fn test_config() -> EngineConfig {
    EngineConfig {
        responsive_poll_interval_ms: 50,
        restart_timeout_secs: 5,
        ..EngineConfig::default()
    }
}

pub fn runner(
    driver: &Arc<FakeDriver>,
    launcher: &Arc<ScriptedLauncher>,
    config: EngineConfig,
) -> PlanRunner {
    PlanRunner::new(driver.clone(), launcher.clone(), config).unwrap()
}
