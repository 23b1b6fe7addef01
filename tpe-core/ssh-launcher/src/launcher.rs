//! SSH 进程启动器
//!
//! 每个步骤启动一个本地 ssh 进程，远端命令先切换到步骤目录再执行。
//! 使用 `-tt` 分配终端，本地 ssh 进程被终止时远端进程随会话挂断一起结束。
//! 测试目录与结果目录通过 scp 传输。

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

use tpe_executor::{
    CommandSpec, LaunchError, LocalProcessHandle, ProcessHandle, ProcessLauncher, WaitStatus,
};

use crate::config::{AuthMethod, RemoteShell, SshTarget};
use crate::error::{Result, SshError};

/// 单次文件传输或目录创建的默认时限
const DEFAULT_TRANSFER_TIMEOUT: Duration = Duration::from_secs(600);

/// SSH 进程启动器
///
/// 按虚拟机名称查找 SSH 目标。
#[derive(Debug, Clone)]
pub struct SshProcessLauncher {
    targets: HashMap<String, SshTarget>,
    ssh_program: String,
    scp_program: String,
    sshpass_program: String,
    transfer_timeout: Duration,
}

impl Default for SshProcessLauncher {
    fn default() -> Self {
        Self {
            targets: HashMap::new(),
            ssh_program: "ssh".to_string(),
            scp_program: "scp".to_string(),
            sshpass_program: "sshpass".to_string(),
            transfer_timeout: DEFAULT_TRANSFER_TIMEOUT,
        }
    }
}

impl SshProcessLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_targets<I, S>(targets: I) -> Self
    where
        I: IntoIterator<Item = (S, SshTarget)>,
        S: Into<String>,
    {
        let mut launcher = Self::new();
        launcher
            .targets
            .extend(targets.into_iter().map(|(vm, target)| (vm.into(), target)));
        launcher
    }

    /// 从 YAML 文件加载 `虚拟机名称 -> SSH 目标` 映射
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let targets: HashMap<String, SshTarget> = serde_yaml::from_str(&content).map_err(|e| {
            SshError::ConfigError(format!("{}: {}", path.as_ref().display(), e))
        })?;
        info!("加载 {} 个 SSH 目标", targets.len());
        Ok(Self::from_targets(targets))
    }

    /// 添加或替换虚拟机的 SSH 目标
    pub fn with_target(mut self, vm: impl Into<String>, target: SshTarget) -> Self {
        self.targets.insert(vm.into(), target);
        self
    }

    /// 指定 ssh 可执行文件
    pub fn with_ssh_program(mut self, program: impl Into<String>) -> Self {
        self.ssh_program = program.into();
        self
    }

    /// 指定 scp 可执行文件
    pub fn with_scp_program(mut self, program: impl Into<String>) -> Self {
        self.scp_program = program.into();
        self
    }

    /// 设置文件传输时限
    pub fn with_transfer_timeout(mut self, timeout: Duration) -> Self {
        self.transfer_timeout = timeout;
        self
    }

    pub fn target(&self, vm: &str) -> Option<&SshTarget> {
        self.targets.get(vm)
    }

    fn target_for(&self, vm: &str) -> Result<&SshTarget> {
        self.target(vm)
            .ok_or_else(|| SshError::UnknownTarget(vm.to_string()))
    }

    /// 认证方式与连接选项，`tool` 为 ssh 或 scp
    fn base_command(&self, target: &SshTarget, tool: &str) -> Result<(String, Vec<String>)> {
        let mut args = Vec::new();

        let program = match &target.auth {
            AuthMethod::Password(_) => {
                // 密码通过 SSHPASS 环境变量传递
                args.push("-e".to_string());
                args.push(tool.to_string());
                self.sshpass_program.clone()
            }
            AuthMethod::Key { key_path } => {
                args.push("-i".to_string());
                args.push(expand_path(key_path)?.to_string_lossy().into_owned());
                tool.to_string()
            }
            AuthMethod::DefaultKey => tool.to_string(),
        };

        for option in [
            "StrictHostKeyChecking=no".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "LogLevel=ERROR".to_string(),
            format!("ConnectTimeout={}", target.connect_timeout.as_secs().max(1)),
        ] {
            args.push("-o".to_string());
            args.push(option);
        }
        if !matches!(target.auth, AuthMethod::Password(_)) {
            args.push("-o".to_string());
            args.push("BatchMode=yes".to_string());
        }

        Ok((program, args))
    }

    /// 构造本地 ssh 命令的程序与参数
    fn invocation(&self, target: &SshTarget, command: &CommandSpec) -> Result<(String, Vec<String>)> {
        let (program, mut args) = self.base_command(target, &self.ssh_program)?;
        args.push("-tt".to_string());
        args.push("-p".to_string());
        args.push(target.port.to_string());
        args.push(target.destination());
        args.push(remote_command_line(target.shell, command));

        Ok((program, args))
    }

    /// 在远端执行一条不需要终端的命令
    fn remote_invocation(&self, target: &SshTarget, line: String) -> Result<(String, Vec<String>)> {
        let (program, mut args) = self.base_command(target, &self.ssh_program)?;
        args.push("-p".to_string());
        args.push(target.port.to_string());
        args.push(target.destination());
        args.push(line);
        Ok((program, args))
    }

    /// 递归复制，`from`/`to` 中的远端路径写成 `user@host:path`
    fn copy_invocation(
        &self,
        target: &SshTarget,
        from: String,
        to: String,
    ) -> Result<(String, Vec<String>)> {
        let (program, mut args) = self.base_command(target, &self.scp_program)?;
        args.push("-r".to_string());
        args.push("-P".to_string());
        args.push(target.port.to_string());
        args.push(from);
        args.push(to);
        Ok((program, args))
    }

    /// 运行本地命令直到结束，非零退出视为失败
    async fn run(
        &self,
        vm: &str,
        target: &SshTarget,
        (program, args): (String, Vec<String>),
    ) -> std::result::Result<(), LaunchError> {
        let mut cmd = Command::new(&program);
        cmd.args(&args);
        if let AuthMethod::Password(password) = &target.auth {
            cmd.env("SSHPASS", password);
        }

        let mut handle = LocalProcessHandle::spawn(cmd)?;
        match handle.wait(self.transfer_timeout).await? {
            WaitStatus::Exited(info) if info.is_success() => Ok(()),
            WaitStatus::Exited(info) => Err(LaunchError::TransferFailed(format!(
                "[{}] {} 退出码 {:?}: {}",
                vm, program, info.exit_code, info.output
            ))),
            WaitStatus::TimedOut => {
                handle.kill().await?;
                Err(LaunchError::TransferFailed(format!(
                    "[{}] {} 在 {} 秒内未完成",
                    vm,
                    program,
                    self.transfer_timeout.as_secs()
                )))
            }
        }
    }
}

#[async_trait]
impl ProcessLauncher for SshProcessLauncher {
    async fn launch(
        &self,
        vm: &str,
        command: &CommandSpec,
    ) -> std::result::Result<Box<dyn ProcessHandle>, LaunchError> {
        let target = self
            .target(vm)
            .ok_or_else(|| SshError::UnknownTarget(vm.to_string()))?;

        let (program, args) = self.invocation(target, command)?;
        debug!(
            "[{}] SSH 执行: {} ({}:{})",
            vm,
            command.command_line(),
            target.host,
            target.port
        );

        let mut cmd = Command::new(program);
        cmd.args(&args);
        if let AuthMethod::Password(password) = &target.auth {
            cmd.env("SSHPASS", password);
        }

        let handle = LocalProcessHandle::spawn(cmd)?;
        Ok(Box::new(handle))
    }

    async fn stage_directory(
        &self,
        vm: &str,
        local: &Path,
        remote: &str,
    ) -> std::result::Result<(), LaunchError> {
        if !local.is_dir() {
            return Err(LaunchError::TransferFailed(format!(
                "{} 不是目录",
                local.display()
            )));
        }
        self.create_directory(vm, remote).await?;

        let target = self.target_for(vm)?;
        info!("[{}] scp {} -> {}", vm, local.display(), remote);
        let invocation = self.copy_invocation(
            target,
            format!("{}/.", local.display()),
            format!("{}:{}", target.destination(), remote),
        )?;
        self.run(vm, target, invocation).await
    }

    async fn create_directory(&self, vm: &str, remote: &str) -> std::result::Result<(), LaunchError> {
        let target = self.target_for(vm)?;
        debug!("[{}] 创建远端目录: {}", vm, remote);
        let invocation = self.remote_invocation(target, mkdir_line(target.shell, remote))?;
        self.run(vm, target, invocation).await
    }

    async fn collect_results(
        &self,
        vm: &str,
        remote: &str,
        local: &Path,
    ) -> std::result::Result<(), LaunchError> {
        let target = self.target_for(vm)?;
        tokio::fs::create_dir_all(local).await?;

        info!("[{}] scp {} -> {}", vm, remote, local.display());
        let invocation = self.copy_invocation(
            target,
            format!("{}:{}/.", target.destination(), remote),
            local.to_string_lossy().into_owned(),
        )?;
        self.run(vm, target, invocation).await
    }
}

/// 远端执行的命令行：切换目录，设置环境变量后执行程序
pub fn remote_command_line(shell: RemoteShell, command: &CommandSpec) -> String {
    let quote = match shell {
        RemoteShell::Posix => posix_quote,
        RemoteShell::Cmd => cmd_quote,
    };

    let mut line = match shell {
        RemoteShell::Posix => format!("cd {} && ", quote(&command.directory)),
        RemoteShell::Cmd => format!("cd /d {} && ", quote(&command.directory)),
    };
    for (key, value) in &command.env {
        match shell {
            RemoteShell::Posix => line.push_str(&format!("{}={} ", key, posix_quote(value))),
            RemoteShell::Cmd => line.push_str(&format!("set \"{}={}\" && ", key, value)),
        }
    }
    line.push_str(&quote(&command.program));
    for arg in &command.args {
        line.push(' ');
        line.push_str(&quote(arg));
    }
    line
}

/// 远端创建目录（含父目录）的命令行
fn mkdir_line(shell: RemoteShell, path: &str) -> String {
    match shell {
        RemoteShell::Posix => format!("mkdir -p {}", posix_quote(path)),
        RemoteShell::Cmd => {
            let path = cmd_quote(path);
            format!("if not exist {} mkdir {}", path, path)
        }
    }
}

fn is_plain(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c))
}

fn posix_quote(s: &str) -> String {
    if is_plain(s) {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn cmd_quote(s: &str) -> String {
    if is_plain(s) || (!s.is_empty() && !s.contains([' ', '\t', '"', '&', '|', '<', '>', '^'])) {
        return s.to_string();
    }
    format!("\"{}\"", s.replace('"', "\"\""))
}

/// 展开 `~` 开头的路径
fn expand_path(path: &Path) -> Result<PathBuf> {
    let path_str = path.to_string_lossy();
    if let Some(rest) = path_str.strip_prefix('~') {
        let home = dirs::home_dir()
            .ok_or_else(|| SshError::KeyLoadError(format!("无法确定用户目录: {}", path_str)))?;
        return Ok(home.join(rest.trim_start_matches('/')));
    }
    Ok(path.to_path_buf())
}
