//! SSH 目标配置

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// SSH 认证方式
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    /// 密码认证，需要本机安装 sshpass
    Password(String),
    /// 密钥认证
    Key {
        /// 私钥路径，支持 `~` 开头
        key_path: PathBuf,
    },
    /// 使用 ssh 默认密钥（~/.ssh/id_rsa, ~/.ssh/id_ed25519 等）
    #[default]
    DefaultKey,
}

/// 远端 shell 类型，决定命令行的拼接与转义方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RemoteShell {
    /// sh/bash
    #[default]
    Posix,
    /// Windows OpenSSH 默认的 cmd.exe
    Cmd,
}

/// 单个虚拟机的 SSH 目标
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshTarget {
    /// 主机地址
    pub host: String,

    /// 端口（默认 22）
    #[serde(default = "default_port")]
    pub port: u16,

    pub username: String,

    #[serde(default)]
    pub auth: AuthMethod,

    #[serde(default)]
    pub shell: RemoteShell,

    /// 连接超时
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,
}

fn default_port() -> u16 {
    22
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(30)
}

impl SshTarget {
    fn new(host: impl Into<String>, username: impl Into<String>, auth: AuthMethod) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            username: username.into(),
            auth,
            shell: RemoteShell::default(),
            connect_timeout: default_connect_timeout(),
        }
    }

    /// 使用密码认证
    pub fn with_password(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self::new(host, username, AuthMethod::Password(password.into()))
    }

    /// 使用密钥认证
    pub fn with_key(
        host: impl Into<String>,
        username: impl Into<String>,
        key_path: impl Into<PathBuf>,
    ) -> Self {
        Self::new(
            host,
            username,
            AuthMethod::Key {
                key_path: key_path.into(),
            },
        )
    }

    /// 使用默认密钥认证
    pub fn with_default_key(host: impl Into<String>, username: impl Into<String>) -> Self {
        Self::new(host, username, AuthMethod::DefaultKey)
    }

    /// 设置端口
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// 设置连接超时
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// 远端为 Windows cmd
    pub fn windows(mut self) -> Self {
        self.shell = RemoteShell::Cmd;
        self
    }

    /// user@host
    pub fn destination(&self) -> String {
        format!("{}@{}", self.username, self.host)
    }
}
