//! 进程启动接口

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// 待执行的命令
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// 工作目录
    pub directory: String,

    /// 程序（解释器或可执行文件）
    pub program: String,

    /// 参数（保持声明顺序）
    pub args: Vec<String>,

    /// 额外的环境变量
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl CommandSpec {
    pub fn new(directory: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// 用于日志的命令行
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            if arg.contains(' ') {
                line.push('"');
                line.push_str(arg);
                line.push('"');
            } else {
                line.push_str(arg);
            }
        }
        line
    }
}

/// 进程退出信息
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitInfo {
    /// 退出码（被信号终止时为 None）
    pub exit_code: Option<i32>,

    /// 合并后的输出（stdout + stderr）
    pub output: String,
}

impl ExitInfo {
    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// 等待结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitStatus {
    Exited(ExitInfo),
    TimedOut,
}

/// 启动错误
#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("启动进程失败: {0}")]
    SpawnFailed(String),

    #[error("等待进程失败: {0}")]
    WaitFailed(String),

    #[error("终止进程失败: {0}")]
    KillFailed(String),

    #[error("文件传输失败: {0}")]
    TransferFailed(String),

    #[error("未配置的目标: {0}")]
    UnknownTarget(String),

    #[error("IO 错误: {0}")]
    IoError(#[from] std::io::Error),
}

/// 已启动的进程
#[async_trait]
pub trait ProcessHandle: Send {
    /// 等待进程退出，超过 `timeout` 返回 `TimedOut`（进程仍在运行）
    async fn wait(&mut self, timeout: Duration) -> Result<WaitStatus, LaunchError>;

    /// 强制终止进程
    async fn kill(&mut self) -> Result<(), LaunchError>;
}

/// 进程启动器
///
/// 除启动命令外还负责测试目录的下发与结果目录的回收，
/// 不支持文件传输的启动器保留默认实现。
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// 在虚拟机 `vm` 上启动命令
    async fn launch(
        &self,
        vm: &str,
        command: &CommandSpec,
    ) -> Result<Box<dyn ProcessHandle>, LaunchError>;

    /// 把本地目录 `local` 的内容复制到虚拟机的 `remote` 目录
    async fn stage_directory(
        &self,
        vm: &str,
        local: &Path,
        remote: &str,
    ) -> Result<(), LaunchError> {
        let _ = (local, remote);
        Err(LaunchError::TransferFailed(format!(
            "启动器不支持向 {} 下发目录",
            vm
        )))
    }

    /// 在虚拟机上创建目录（含父目录）
    async fn create_directory(&self, vm: &str, remote: &str) -> Result<(), LaunchError> {
        let _ = remote;
        Err(LaunchError::TransferFailed(format!(
            "启动器不支持在 {} 上创建目录",
            vm
        )))
    }

    /// 把虚拟机的 `remote` 目录复制回本地 `local`
    async fn collect_results(
        &self,
        vm: &str,
        remote: &str,
        local: &Path,
    ) -> Result<(), LaunchError> {
        let _ = (remote, local);
        Err(LaunchError::TransferFailed(format!(
            "启动器不支持从 {} 回收结果",
            vm
        )))
    }
}
