//! TPE SSH 启动器
//!
//! 通过系统 ssh/sshpass 在虚拟机内执行步骤命令，支持：
//! - 密码认证（sshpass）
//! - SSH 密钥认证
//! - POSIX shell 与 Windows cmd 两种远端命令格式
//!
//! # 示例
//!
//! ```ignore
//! use tpe_ssh_launcher::{SshProcessLauncher, SshTarget};
//!
//! let launcher = SshProcessLauncher::new()
//!     .with_target("ubuntu2204-client", SshTarget::with_default_key("192.168.1.20", "tester"))
//!     .with_target("ws2019-fileserver", SshTarget::with_password("192.168.1.10", "admin", "secret").windows());
//!
//! let runner = PlanRunner::new(driver, Arc::new(launcher), config)?;
//! ```

mod config;
mod error;
mod launcher;

pub use config::{AuthMethod, RemoteShell, SshTarget};
pub use error::{Result, SshError};
pub use launcher::{remote_command_line, SshProcessLauncher};
