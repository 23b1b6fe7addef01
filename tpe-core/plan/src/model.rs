//! 测试计划数据结构

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::debug;

use crate::PlanError;

/// 测试计划（顶层）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestPlan {
    /// 计划名称
    pub name: String,

    /// 计划版本（正整数）
    #[serde(default = "default_version")]
    pub version: u32,

    /// 测试用例（按文档顺序执行）
    #[serde(default)]
    pub test_cases: Vec<TestCase>,
}

/// 测试用例
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    /// 用例名称（计划内唯一）
    pub name: String,

    /// 资源初始化
    ///
    /// 以列表保存，resource_id 的唯一性由校验阶段保证，
    /// 重复声明不会在加载时被静默合并。
    #[serde(default)]
    pub resource_init: Vec<PrepareVirtualMachine>,

    /// 测试步骤（文档顺序）
    #[serde(default)]
    pub test_steps: Vec<TestStepItem>,
}

/// 虚拟机资源准备
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareVirtualMachine {
    /// 资源 ID（用例内唯一）
    pub resource_id: String,

    /// 虚拟机名称
    pub virtual_machine: String,

    /// 检查点名称
    pub checkpoint: String,

    /// 需要安装的工具
    #[serde(default, deserialize_with = "unique_names")]
    pub tools: BTreeSet<String>,

    /// 需要部署的构建
    #[serde(default, deserialize_with = "unique_names")]
    pub builds: BTreeSet<String>,

    /// 准备完成后的等待时间（秒）
    #[serde(default)]
    pub post_wait: u64,

    /// 整个准备过程的超时（秒）
    pub timeout: u64,

    /// 准备完成后是否重启
    #[serde(default)]
    pub restart_computer: RestartComputer,
}

/// 测试步骤条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TestStepItem {
    /// 在资源上执行命令
    Step(Step),

    /// 将资源恢复到准备时的检查点
    RefreshResource(RefreshResource),
}

/// 命令行测试步骤
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    /// 步骤描述
    pub description: String,

    /// 目标资源
    pub resource_id: String,

    /// 工作目录
    pub directory: String,

    /// 执行前复制到工作目录的本地测试目录
    ///
    /// 相对路径基于引擎配置的 `tests_root`。
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    /// 解释器（为空时直接执行可执行文件）
    #[serde(default)]
    pub interpreter: String,

    /// 可执行文件
    pub executable: String,

    /// 参数（保持声明顺序）
    #[serde(default)]
    pub exec_params: ExecParams,

    /// 执行完成后的等待时间（秒）
    #[serde(default)]
    pub post_wait: u64,

    /// 执行超时（秒）
    pub timeout: u64,

    /// 执行完成后是否重启
    #[serde(default)]
    pub restart_computer: RestartComputer,
}

/// 资源刷新
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshResource {
    /// 目标资源
    pub resource_id: String,

    /// 刷新后是否重启
    #[serde(default)]
    pub restart_computer: RestartComputer,
}

/// 重启指令
///
/// 既可以写成 `restart_computer: true`,
/// 也可以写成 `restart_computer: { value: true, wait: true }`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RestartComputerRepr")]
pub struct RestartComputer {
    /// 是否重启
    pub value: bool,

    /// 是否等待虚拟机恢复响应
    pub wait: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RestartComputerRepr {
    Flag(bool),
    Full {
        value: bool,
        #[serde(default)]
        wait: bool,
    },
}

impl From<RestartComputerRepr> for RestartComputer {
    fn from(repr: RestartComputerRepr) -> Self {
        match repr {
            RestartComputerRepr::Flag(value) => Self { value, wait: false },
            RestartComputerRepr::Full { value, wait } => Self { value, wait },
        }
    }
}

impl RestartComputer {
    /// 不重启
    pub fn none() -> Self {
        Self::default()
    }

    /// 重启但不等待
    pub fn restart() -> Self {
        Self {
            value: true,
            wait: false,
        }
    }

    /// 重启并等待恢复响应
    pub fn restart_and_wait() -> Self {
        Self {
            value: true,
            wait: true,
        }
    }
}

/// 单个命令行参数
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecParam {
    /// 参数名 (如 `--suite`)
    pub name: String,

    /// 参数值，为空时只传参数名
    #[serde(default)]
    pub value: String,
}

/// 有序参数表
///
/// 同名参数会原样保留，不做合并。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecParams(Vec<ExecParam>);

impl ExecParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从（名称，值）列表构造
    pub fn from_pairs<I, N, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (N, V)>,
        N: Into<String>,
        V: Into<String>,
    {
        Self(
            pairs
                .into_iter()
                .map(|(name, value)| ExecParam {
                    name: name.into(),
                    value: value.into(),
                })
                .collect(),
        )
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push(ExecParam {
            name: name.into(),
            value: value.into(),
        });
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExecParam> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// 展开为命令行参数：每个参数依次贡献名称，值非空时再贡献值
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(self.0.len() * 2);
        for param in &self.0 {
            args.push(param.name.clone());
            if !param.value.is_empty() {
                args.push(param.value.clone());
            }
        }
        args
    }
}

fn default_version() -> u32 {
    1
}

/// 反序列化名称集合，同一列表内出现重复名称时报错
fn unique_names<'de, D>(deserializer: D) -> std::result::Result<BTreeSet<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let names = Vec::<String>::deserialize(deserializer)?;
    let mut set = BTreeSet::new();
    for name in names {
        if set.contains(&name) {
            return Err(de::Error::custom(format!("名称重复: {}", name)));
        }
        set.insert(name);
    }
    Ok(set)
}

// ============================================
// 加载与导出
// ============================================

impl TestPlan {
    /// 从文件加载（根据扩展名选择 YAML 或 JSON）
    pub fn from_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let path = path.as_ref();
        match path.extension().and_then(|s| s.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml_file(path),
            Some("json") => Self::from_json_file(path),
            _ => Err(PlanError::LoadFailed(format!(
                "不支持的测试计划格式: {:?}",
                path
            ))),
        }
    }

    /// 从 YAML 文件加载
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        debug!("加载测试计划: {:?}", path.as_ref());
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// 从 YAML 字符串加载
    pub fn from_yaml_str(yaml: &str) -> crate::Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| PlanError::SerdeError(e.to_string()))
    }

    /// 从 JSON 文件加载
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        debug!("加载测试计划: {:?}", path.as_ref());
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// 从 JSON 字符串加载
    pub fn from_json_str(json: &str) -> crate::Result<Self> {
        serde_json::from_str(json).map_err(|e| PlanError::SerdeError(e.to_string()))
    }

    /// 导出为 YAML
    pub fn to_yaml(&self) -> crate::Result<String> {
        serde_yaml::to_string(self).map_err(|e| PlanError::SerdeError(e.to_string()))
    }

    /// 导出为 JSON
    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| PlanError::SerdeError(e.to_string()))
    }

    /// 按名称查找测试用例
    pub fn test_case(&self, name: &str) -> Option<&TestCase> {
        self.test_cases.iter().find(|tc| tc.name == name)
    }
}

impl TestCase {
    /// 按 resource_id 查找资源声明
    pub fn resource(&self, resource_id: &str) -> Option<&PrepareVirtualMachine> {
        self.resource_init
            .iter()
            .find(|init| init.resource_id == resource_id)
    }

    /// 指定资源的步骤，附带其在 test_steps 中的位置
    pub fn items_for<'a>(
        &'a self,
        resource_id: &'a str,
    ) -> impl Iterator<Item = (usize, &'a TestStepItem)> + 'a {
        self.test_steps
            .iter()
            .enumerate()
            .filter(move |(_, item)| item.resource_id() == resource_id)
    }

    pub fn step_count(&self) -> usize {
        self.test_steps
            .iter()
            .filter(|item| matches!(item, TestStepItem::Step(_)))
            .count()
    }

    pub fn refresh_count(&self) -> usize {
        self.test_steps.len() - self.step_count()
    }
}

impl TestStepItem {
    pub fn resource_id(&self) -> &str {
        match self {
            TestStepItem::Step(step) => &step.resource_id,
            TestStepItem::RefreshResource(refresh) => &refresh.resource_id,
        }
    }

    pub fn restart_computer(&self) -> RestartComputer {
        match self {
            TestStepItem::Step(step) => step.restart_computer,
            TestStepItem::RefreshResource(refresh) => refresh.restart_computer,
        }
    }

    /// 用于日志与报告的描述
    pub fn description(&self) -> String {
        match self {
            TestStepItem::Step(step) => step.description.clone(),
            TestStepItem::RefreshResource(refresh) => {
                format!("刷新资源 {}", refresh.resource_id)
            }
        }
    }
}
