//! 本地进程启动器
//!
//! 使用 tokio::process 在本机执行命令，适用于在虚拟机内部运行的执行代理，
//! 或者虚拟机文件系统已映射到本机的场景。
//! Unix 上每个子进程独占一个进程组，终止时连同其后代一起终止。

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::launcher::{
    CommandSpec, ExitInfo, LaunchError, ProcessHandle, ProcessLauncher, WaitStatus,
};

/// 进程退出后收集剩余输出的最长时间
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// 本地进程启动器
#[derive(Debug, Clone, Default)]
pub struct LocalProcessLauncher;

impl LocalProcessLauncher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessLauncher for LocalProcessLauncher {
    async fn launch(
        &self,
        vm: &str,
        command: &CommandSpec,
    ) -> Result<Box<dyn ProcessHandle>, LaunchError> {
        debug!("[{}] 本地执行: {}", vm, command.command_line());

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .envs(&command.env)
            .current_dir(&command.directory);

        let handle = LocalProcessHandle::spawn(cmd)?;
        Ok(Box::new(handle))
    }

    async fn stage_directory(
        &self,
        vm: &str,
        local: &Path,
        remote: &str,
    ) -> Result<(), LaunchError> {
        let copied = copy_tree(local, Path::new(remote))
            .await
            .map_err(|e| LaunchError::TransferFailed(format!("{}: {}", local.display(), e)))?;
        debug!("[{}] 下发 {} 个文件到 {}", vm, copied, remote);
        Ok(())
    }

    async fn create_directory(&self, _vm: &str, remote: &str) -> Result<(), LaunchError> {
        fs::create_dir_all(remote)
            .await
            .map_err(|e| LaunchError::TransferFailed(format!("{}: {}", remote, e)))
    }

    async fn collect_results(
        &self,
        vm: &str,
        remote: &str,
        local: &Path,
    ) -> Result<(), LaunchError> {
        let copied = copy_tree(Path::new(remote), local)
            .await
            .map_err(|e| LaunchError::TransferFailed(format!("{}: {}", remote, e)))?;
        debug!("[{}] 回收 {} 个结果文件到 {}", vm, copied, local.display());
        Ok(())
    }
}

/// 本地子进程句柄
pub struct LocalProcessHandle {
    child: Child,
    stdout: Option<JoinHandle<String>>,
    stderr: Option<JoinHandle<String>>,
}

impl LocalProcessHandle {
    /// 启动命令，捕获 stdout/stderr
    ///
    /// 句柄被丢弃时子进程会被终止。
    pub fn spawn(mut cmd: Command) -> Result<Self, LaunchError> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| LaunchError::SpawnFailed(e.to_string()))?;

        let stdout = child.stdout.take().map(|out| tokio::spawn(read_all(out)));
        let stderr = child.stderr.take().map(|err| tokio::spawn(read_all(err)));

        Ok(Self {
            child,
            stdout,
            stderr,
        })
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn collect_output(&mut self) -> String {
        let stdout = drain(self.stdout.take()).await;
        let stderr = drain(self.stderr.take()).await;

        if stderr.is_empty() {
            stdout
        } else if stdout.is_empty() {
            stderr
        } else {
            format!("{}\n{}", stdout, stderr)
        }
    }

    fn abort_readers(&mut self) {
        for reader in [self.stdout.take(), self.stderr.take()].into_iter().flatten() {
            reader.abort();
        }
    }
}

#[async_trait]
impl ProcessHandle for LocalProcessHandle {
    async fn wait(&mut self, timeout: Duration) -> Result<WaitStatus, LaunchError> {
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(status) => {
                let status = status.map_err(|e| LaunchError::WaitFailed(e.to_string()))?;
                let output = self.collect_output().await;
                Ok(WaitStatus::Exited(ExitInfo {
                    exit_code: status.code(),
                    output,
                }))
            }
            Err(_) => Ok(WaitStatus::TimedOut),
        }
    }

    async fn kill(&mut self) -> Result<(), LaunchError> {
        self.abort_readers();
        #[cfg(unix)]
        {
            if let Some(pid) = self.child.id() {
                if let Err(e) = kill_process_group(pid) {
                    debug!("终止进程组 {} 失败: {}", pid, e);
                }
            }
        }
        self.child
            .kill()
            .await
            .map_err(|e| LaunchError::KillFailed(e.to_string()))
    }
}

async fn read_all<R: AsyncRead + Unpin>(mut reader: R) -> String {
    let mut buf = Vec::new();
    if let Err(e) = reader.read_to_end(&mut buf).await {
        warn!("读取进程输出失败: {}", e);
    }
    String::from_utf8_lossy(&buf).trim().to_string()
}

/// 向整个进程组发送 SIGKILL
#[cfg(unix)]
fn kill_process_group(pgid: u32) -> std::io::Result<()> {
    // SAFETY: pgid 来自本进程启动的子进程，spawn 时已设为组长
    let ret = unsafe { libc::kill(-(pgid as libc::pid_t), libc::SIGKILL) };
    if ret == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

async fn drain(reader: Option<JoinHandle<String>>) -> String {
    let Some(mut reader) = reader else {
        return String::new();
    };
    match tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, &mut reader).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            warn!("输出读取任务异常: {}", e);
            String::new()
        }
        Err(_) => {
            // 子进程的后代仍持有管道
            warn!("收集进程输出超时");
            reader.abort();
            String::new()
        }
    }
}

/// 递归复制目录，返回复制的文件数
async fn copy_tree(from: &Path, to: &Path) -> std::io::Result<u64> {
    if !fs::metadata(from).await?.is_dir() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{} 不是目录", from.display()),
        ));
    }

    let mut pending: Vec<(PathBuf, PathBuf)> = vec![(from.to_path_buf(), to.to_path_buf())];
    let mut copied = 0;
    while let Some((src, dst)) = pending.pop() {
        fs::create_dir_all(&dst).await?;
        let mut entries = fs::read_dir(&src).await?;
        while let Some(entry) = entries.next_entry().await? {
            let target = dst.join(entry.file_name());
            if entry.file_type().await?.is_dir() {
                pending.push((entry.path(), target));
            } else {
                fs::copy(entry.path(), &target).await?;
                copied += 1;
            }
        }
    }
    Ok(copied)
}
