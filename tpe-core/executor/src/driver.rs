//! 虚拟化驱动接口
//!
//! 具体的虚拟化后端（libvirt、Hyper-V 等）由外部实现。

use async_trait::async_trait;
use thiserror::Error;

/// 驱动错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("检查点不存在: {vm}/{checkpoint}")]
    CheckpointNotFound { vm: String, checkpoint: String },

    #[error("虚拟机不可达: {0}")]
    Unreachable(String),

    #[error("驱动操作失败: {0}")]
    OperationFailed(String),
}

/// 虚拟化驱动
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VirtualizationDriver: Send + Sync {
    /// 将虚拟机恢复到检查点
    async fn restore_checkpoint(&self, vm: &str, checkpoint: &str) -> Result<(), DriverError>;

    /// 安装工具
    async fn install_tool(&self, vm: &str, tool: &str) -> Result<(), DriverError>;

    /// 部署构建
    async fn deploy_build(&self, vm: &str, build: &str) -> Result<(), DriverError>;

    /// 重启虚拟机
    async fn restart(&self, vm: &str, wait: bool) -> Result<(), DriverError>;

    /// 虚拟机是否可响应
    async fn is_responsive(&self, vm: &str) -> bool;
}
