//! 解释器注册表
//!
//! 步骤的 `interpreter` 字段是一个字符串标识：
//! - 为空：直接执行可执行文件
//! - 已注册：使用注册的程序与前置参数，可执行文件作为其后的参数
//! - 未注册：以标识本身作为程序，可执行文件作为其参数

use std::collections::HashMap;
use tracing::{debug, info};

use tpe_plan::Step;

use crate::config::EngineConfig;
use crate::launcher::CommandSpec;

/// 解释器调用方式
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterpreterSpec {
    /// 解释器程序
    pub program: String,

    /// 位于可执行文件之前的参数
    pub leading_args: Vec<String>,
}

impl InterpreterSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.leading_args = args.into_iter().map(Into::into).collect();
        self
    }
}

/// 解释器注册表
///
/// 标识不区分大小写。
#[derive(Debug, Clone, Default)]
pub struct InterpreterRegistry {
    interpreters: HashMap<String, InterpreterSpec>,
}

impl InterpreterRegistry {
    /// 创建空注册表
    pub fn new() -> Self {
        Self::default()
    }

    /// 带常用解释器的注册表
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(
            "powershell",
            InterpreterSpec::new("powershell").with_args([
                "-NoProfile",
                "-ExecutionPolicy",
                "Bypass",
                "-File",
            ]),
        );
        registry.register("cmd", InterpreterSpec::new("cmd").with_args(["/c"]));
        registry.register("bash", InterpreterSpec::new("bash"));
        registry.register("python", InterpreterSpec::new("python"));
        registry
    }

    /// 默认解释器加上配置文件中的定义（同名时配置优先）
    pub fn from_config(config: &EngineConfig) -> Self {
        let mut registry = Self::with_defaults();
        for (name, interpreter) in &config.interpreters {
            registry.register(
                name,
                InterpreterSpec::new(&interpreter.program).with_args(interpreter.args.clone()),
            );
        }
        registry
    }

    /// 注册解释器，返回被覆盖的旧定义
    pub fn register(&mut self, name: &str, spec: InterpreterSpec) -> Option<InterpreterSpec> {
        info!("注册解释器: {} -> {}", name, spec.program);
        self.interpreters.insert(name.to_lowercase(), spec)
    }

    pub fn with_interpreter(mut self, name: &str, spec: InterpreterSpec) -> Self {
        self.register(name, spec);
        self
    }

    pub fn get(&self, name: &str) -> Option<&InterpreterSpec> {
        self.interpreters.get(&name.to_lowercase())
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// 列出所有已注册的解释器
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.interpreters.keys().cloned().collect();
        names.sort();
        names
    }

    /// 根据步骤构造命令
    pub fn build_command(&self, step: &Step) -> CommandSpec {
        let interpreter = step.interpreter.trim();

        let command = if interpreter.is_empty() {
            CommandSpec::new(&step.directory, &step.executable)
        } else if let Some(spec) = self.get(interpreter) {
            CommandSpec::new(&step.directory, &spec.program)
                .args(spec.leading_args.iter().cloned())
                .arg(&step.executable)
        } else {
            debug!("解释器 {} 未注册, 直接调用", interpreter);
            CommandSpec::new(&step.directory, interpreter).arg(&step.executable)
        };

        command.args(step.exec_params.to_args())
    }
}
