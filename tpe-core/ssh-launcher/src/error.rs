//! SSH 启动器错误定义

use thiserror::Error;
use tpe_executor::LaunchError;

pub type Result<T> = std::result::Result<T, SshError>;

#[derive(Error, Debug)]
pub enum SshError {
    /// 虚拟机没有对应的 SSH 目标
    #[error("虚拟机 {0} 未配置 SSH 目标")]
    UnknownTarget(String),

    #[error("SSH 密钥加载失败: {0}")]
    KeyLoadError(String),

    #[error("配置错误: {0}")]
    ConfigError(String),

    #[error("IO 错误: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<SshError> for LaunchError {
    fn from(err: SshError) -> Self {
        match err {
            SshError::UnknownTarget(vm) => LaunchError::UnknownTarget(vm),
            SshError::IoError(e) => LaunchError::IoError(e),
            other => LaunchError::SpawnFailed(other.to_string()),
        }
    }
}
