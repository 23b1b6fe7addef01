//! 执行引擎配置
//!
//! 支持从多个源加载：
//! - 环境变量（优先级最高）
//! - 配置文件（TOML/YAML/JSON）
//! - 默认值（优先级最低）
//!
//! 配置文件搜索路径（按优先级）：
//! 1. `TPE_ENGINE_CONFIG` 环境变量指定的路径
//! 2. `./engine.toml` / `./engine.yaml` / `./engine.json`（当前目录）
//! 3. `~/.config/tpe/engine.toml`（用户配置目录）
//! 4. `/etc/tpe/engine.toml`（系统配置目录）

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tpe_plan::{ValidationRules, DEFAULT_MAX_TIMEOUT_SECS};

// ============================================
// 核心配置结构
// ============================================

/// 执行引擎配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// 检查点恢复后是否等待虚拟机恢复响应
    #[serde(default = "default_verify_after_restore")]
    pub verify_after_restore: bool,

    /// 检查点恢复后等待虚拟机响应的最长时间（秒）
    #[serde(default = "default_boot_wait_secs")]
    pub boot_wait_secs: u64,

    /// 轮询虚拟机响应状态的间隔（毫秒）
    #[serde(default = "default_poll_interval_ms")]
    pub responsive_poll_interval_ms: u64,

    /// 重启后等待响应的最长时间（秒）
    #[serde(default = "default_restart_timeout_secs")]
    pub restart_timeout_secs: u64,

    /// 步骤重启等待的计时方式
    #[serde(default)]
    pub restart_budget: RestartBudget,

    /// 资源刷新超时（秒），未设置时沿用资源准备的超时
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_timeout_secs: Option<u64>,

    /// 刷新后是否重新安装工具和构建
    #[serde(default)]
    pub reinstall_on_refresh: bool,

    /// 计划中允许的最大超时（秒）
    #[serde(default = "default_max_timeout_secs")]
    pub max_timeout_secs: u64,

    /// 本地测试目录的根路径，步骤 `source` 为相对路径时基于此解析
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tests_root: Option<PathBuf>,

    /// 本地结果目录的根路径，设置后每个步骤的结果回收到 `<results_root>/<uuid>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results_root: Option<PathBuf>,

    /// 虚拟机上结果目录的根路径，未设置时使用 `<步骤工作目录>/results`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_results_root: Option<String>,

    /// 额外的解释器定义
    #[serde(default)]
    pub interpreters: BTreeMap<String, InterpreterConfig>,
}

/// 步骤重启等待的计时方式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartBudget {
    /// 独立计时，上限为 `restart_timeout_secs`
    #[default]
    Separate,

    /// 计入步骤超时，上限为步骤剩余时间
    WithinStepTimeout,
}

/// 解释器定义
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterpreterConfig {
    /// 解释器程序
    pub program: String,

    /// 位于可执行文件之前的参数
    #[serde(default)]
    pub args: Vec<String>,
}

// ============================================
// 默认值函数
// ============================================

fn default_verify_after_restore() -> bool {
    true
}
fn default_boot_wait_secs() -> u64 {
    30
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_restart_timeout_secs() -> u64 {
    120
}
fn default_max_timeout_secs() -> u64 {
    DEFAULT_MAX_TIMEOUT_SECS
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            verify_after_restore: default_verify_after_restore(),
            boot_wait_secs: default_boot_wait_secs(),
            responsive_poll_interval_ms: default_poll_interval_ms(),
            restart_timeout_secs: default_restart_timeout_secs(),
            restart_budget: RestartBudget::default(),
            refresh_timeout_secs: None,
            reinstall_on_refresh: false,
            max_timeout_secs: default_max_timeout_secs(),
            tests_root: None,
            results_root: None,
            remote_results_root: None,
            interpreters: BTreeMap::new(),
        }
    }
}

// ============================================
// 访问器
// ============================================

impl EngineConfig {
    pub fn boot_wait(&self) -> Duration {
        Duration::from_secs(self.boot_wait_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.responsive_poll_interval_ms)
    }

    pub fn restart_timeout(&self) -> Duration {
        Duration::from_secs(self.restart_timeout_secs)
    }

    /// 刷新超时，未配置时使用 `prepare_timeout`
    pub fn refresh_timeout(&self, prepare_timeout: Duration) -> Duration {
        self.refresh_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(prepare_timeout)
    }

    /// 解析步骤的本地测试目录
    pub fn resolve_source(&self, source: &str) -> PathBuf {
        let path = Path::new(source);
        match &self.tests_root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path.to_path_buf(),
        }
    }

    /// 步骤在虚拟机上的结果目录
    pub fn remote_results_dir(&self, directory: &str, run_id: &str) -> String {
        let root = match &self.remote_results_root {
            Some(root) => root.trim_end_matches(['/', '\\']).to_string(),
            None => format!("{}/results", directory.trim_end_matches(['/', '\\'])),
        };
        format!("{}/{}", root, run_id)
    }

    /// 测试计划校验规则
    pub fn validation_rules(&self) -> ValidationRules {
        ValidationRules::with_max_timeout(self.max_timeout_secs)
    }
}

// ============================================
// 配置加载实现
// ============================================

impl EngineConfig {
    /// 从多个源加载配置（优先级：环境变量 > 配置文件 > 默认值）
    pub fn load() -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = Self::find_config_file() {
            tracing::debug!("加载引擎配置: {:?}", path);
            config = Self::load_from_file(&path)?;
        } else {
            tracing::debug!("未找到引擎配置文件, 使用默认值");
        }

        config.apply_env_vars()?;
        config.validate()?;

        Ok(config)
    }

    /// 从指定文件加载配置
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = match path.extension().and_then(|s| s.to_str()) {
            Some("toml") => toml::from_str(&content)
                .with_context(|| format!("Failed to parse TOML config: {:?}", path))?,
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse YAML config: {:?}", path))?,
            Some("json") => serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON config: {:?}", path))?,
            _ => anyhow::bail!("Unsupported config file format: {:?}", path),
        };

        Ok(config)
    }

    /// 查找配置文件（按优先级搜索）
    fn find_config_file() -> Option<PathBuf> {
        if let Ok(path) = env::var("TPE_ENGINE_CONFIG") {
            let p = PathBuf::from(path);
            if p.exists() {
                return Some(p);
            }
        }

        let mut candidates = vec![
            PathBuf::from("./engine.toml"),
            PathBuf::from("./engine.yaml"),
            PathBuf::from("./engine.json"),
        ];

        if let Some(config_dir) = dirs::home_dir().map(|home| home.join(".config/tpe")) {
            candidates.push(config_dir.join("engine.toml"));
            candidates.push(config_dir.join("engine.yaml"));
        }

        #[cfg(target_os = "linux")]
        {
            candidates.push(PathBuf::from("/etc/tpe/engine.toml"));
            candidates.push(PathBuf::from("/etc/tpe/engine.yaml"));
        }

        candidates.into_iter().find(|path| path.exists())
    }

    /// 从环境变量覆盖配置
    fn apply_env_vars(&mut self) -> Result<()> {
        if let Ok(path) = env::var("TPE_TESTS_ROOT") {
            self.tests_root = Some(PathBuf::from(path));
        }
        if let Ok(path) = env::var("TPE_RESULTS_ROOT") {
            self.results_root = Some(PathBuf::from(path));
        }
        if let Ok(value) = env::var("TPE_VERIFY_AFTER_RESTORE") {
            self.verify_after_restore = parse_flag(&value)
                .with_context(|| format!("Invalid TPE_VERIFY_AFTER_RESTORE value: {}", value))?;
        }
        if let Ok(value) = env::var("TPE_BOOT_WAIT_SECS") {
            self.boot_wait_secs = value.parse().context("Invalid TPE_BOOT_WAIT_SECS value")?;
        }
        if let Ok(value) = env::var("TPE_POLL_INTERVAL_MS") {
            self.responsive_poll_interval_ms =
                value.parse().context("Invalid TPE_POLL_INTERVAL_MS value")?;
        }
        if let Ok(value) = env::var("TPE_RESTART_TIMEOUT_SECS") {
            self.restart_timeout_secs =
                value.parse().context("Invalid TPE_RESTART_TIMEOUT_SECS value")?;
        }
        if let Ok(value) = env::var("TPE_RESTART_BUDGET") {
            self.restart_budget = match value.as_str() {
                "separate" => RestartBudget::Separate,
                "within_step_timeout" => RestartBudget::WithinStepTimeout,
                other => anyhow::bail!("Invalid TPE_RESTART_BUDGET value: {}", other),
            };
        }
        if let Ok(value) = env::var("TPE_REFRESH_TIMEOUT_SECS") {
            self.refresh_timeout_secs = Some(
                value
                    .parse()
                    .context("Invalid TPE_REFRESH_TIMEOUT_SECS value")?,
            );
        }
        if let Ok(value) = env::var("TPE_REINSTALL_ON_REFRESH") {
            self.reinstall_on_refresh = parse_flag(&value)
                .with_context(|| format!("Invalid TPE_REINSTALL_ON_REFRESH value: {}", value))?;
        }
        if let Ok(value) = env::var("TPE_MAX_TIMEOUT_SECS") {
            self.max_timeout_secs = value.parse().context("Invalid TPE_MAX_TIMEOUT_SECS value")?;
        }

        Ok(())
    }

    /// 验证配置
    pub fn validate(&self) -> Result<()> {
        if self.responsive_poll_interval_ms == 0 {
            anyhow::bail!("responsive_poll_interval_ms must be greater than 0");
        }
        if self.restart_timeout_secs == 0 {
            anyhow::bail!("restart_timeout_secs must be greater than 0");
        }
        if self.verify_after_restore && self.boot_wait_secs == 0 {
            anyhow::bail!("boot_wait_secs must be greater than 0 when verify_after_restore is set");
        }
        if self.refresh_timeout_secs == Some(0) {
            anyhow::bail!("refresh_timeout_secs must be greater than 0");
        }
        if self.max_timeout_secs == 0 {
            anyhow::bail!("max_timeout_secs must be greater than 0");
        }
        for (name, interpreter) in &self.interpreters {
            if interpreter.program.trim().is_empty() {
                anyhow::bail!("Interpreter {} has an empty program", name);
            }
        }

        Ok(())
    }
}

/// 解析 "true"/"1"/"false"/"0"
fn parse_flag(value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => anyhow::bail!("not a boolean: {}", other),
    }
}
