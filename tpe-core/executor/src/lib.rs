//! TPE 执行器
//!
//! 测试计划执行引擎：
//! - 资源管理（检查点恢复、工具/构建安装、重启）
//! - 步骤监督（子进程启动、超时终止、PostWait、重启）
//! - 步骤调度（按资源分队列，资源间并发，资源内有序）
//! - 结果汇总（步骤结果、用例与计划结论）

pub mod config;
pub mod driver;
pub mod interpreter;
pub mod launcher;
pub mod local;
pub mod report;
pub mod resource;
pub mod runner;
pub mod scheduler;
pub mod supervisor;

pub use config::{EngineConfig, InterpreterConfig, RestartBudget};
pub use driver::{DriverError, VirtualizationDriver};
pub use interpreter::{InterpreterRegistry, InterpreterSpec};
pub use launcher::{CommandSpec, ExitInfo, LaunchError, ProcessHandle, ProcessLauncher, WaitStatus};
pub use local::{LocalProcessHandle, LocalProcessLauncher};
pub use report::{
    OutcomeKind, OutcomeSummary, ResultAggregator, StepOutcome, StepStatus, TestCaseReport,
    TestPlanReport, Verdict,
};
pub use resource::{
    ResourceLease, ResourceLeases, ResourceManager, ResourceRuntimeState, ResourceState,
};
pub use runner::PlanRunner;
pub use scheduler::StepScheduler;
pub use supervisor::{ExecutionSupervisor, RESULTS_DIR_ENV};

pub use tokio_util::sync::CancellationToken;

use thiserror::Error;
use tpe_plan::ValidationError;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("测试计划校验失败: {0}")]
    Validation(#[from] ValidationError),

    #[error("资源 {resource_id} 操作超时 ({seconds} 秒)")]
    ResourceTimeout { resource_id: String, seconds: u64 },

    #[error("资源 {resource_id} 不可用: {reason}")]
    ResourceUnavailable { resource_id: String, reason: String },

    #[error("资源 {resource_id} 的检查点不存在: {checkpoint}")]
    CheckpointNotFound {
        resource_id: String,
        checkpoint: String,
    },

    #[error("步骤执行失败, 退出码 {exit_code:?}")]
    StepFailure { exit_code: Option<i32> },

    #[error("步骤执行超时 ({seconds} 秒)")]
    StepTimeout { seconds: u64 },

    #[error("资源 {resource_id} 重启失败: {reason}")]
    RestartFailure { resource_id: String, reason: String },

    #[error("资源 {resource_id} 文件传输失败: {reason}")]
    ArtifactTransfer { resource_id: String, reason: String },

    #[error("执行已取消")]
    Cancelled,

    #[error("进程启动错误: {0}")]
    Launch(#[from] LaunchError),

    #[error("资源 {resource_id} 状态转换非法: {from:?} -> {to:?}")]
    InvalidTransition {
        resource_id: String,
        from: ResourceState,
        to: ResourceState,
    },

    #[error("配置错误: {0}")]
    ConfigError(String),

    #[error("序列化错误: {0}")]
    SerdeError(String),

    #[error("IO 错误: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
