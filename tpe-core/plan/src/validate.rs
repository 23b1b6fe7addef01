//! 执行前结构校验
//!
//! 加载器只保证格式正确，以下约束在执行开始前由这里检查：
//! - 计划至少包含一个测试用例，用例名称唯一
//! - 用例内 resource_id 唯一，同一虚拟机只能对应一个资源
//! - 步骤引用的资源必须已声明
//! - 字段非空，目录长度 1-260，超时为正且不超过上限

use std::collections::{HashMap, HashSet};
use thiserror::Error;

use crate::model::{PrepareVirtualMachine, Step, TestCase, TestPlan, TestStepItem};

/// 目录字段最大长度（字符）
pub const MAX_DIRECTORY_LEN: usize = 260;

/// 默认超时上限（秒）
pub const DEFAULT_MAX_TIMEOUT_SECS: u64 = 7200;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("测试计划名称不能为空")]
    EmptyPlanName,

    #[error("测试计划版本必须为正整数")]
    InvalidVersion,

    #[error("测试计划至少需要一个测试用例")]
    NoTestCases,

    #[error("测试用例名称重复: {0}")]
    DuplicateTestCase(String),

    #[error("测试用例 {case}: resource_id 重复: {resource_id}")]
    DuplicateResource { case: String, resource_id: String },

    #[error("测试用例 {case}: 虚拟机 {virtual_machine} 同时被 {first} 和 {second} 使用")]
    SharedVirtualMachine {
        case: String,
        virtual_machine: String,
        first: String,
        second: String,
    },

    #[error("测试用例 {case}: 第 {index} 个步骤引用了未声明的资源 {resource_id}")]
    UnknownResource {
        case: String,
        index: usize,
        resource_id: String,
    },

    #[error("{location}: 字段 {field} 不能为空")]
    EmptyField {
        location: String,
        field: &'static str,
    },

    #[error("{location}: 目录长度必须在 1-260 个字符之间 (实际 {len})")]
    InvalidDirectory { location: String, len: usize },

    #[error("{location}: 超时必须在 1-{max} 秒之间 (实际 {value})")]
    InvalidTimeout {
        location: String,
        value: u64,
        max: u64,
    },
}

/// 校验规则
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationRules {
    /// 单个操作允许的最大超时（秒）
    pub max_timeout_secs: u64,
}

impl Default for ValidationRules {
    fn default() -> Self {
        Self {
            max_timeout_secs: DEFAULT_MAX_TIMEOUT_SECS,
        }
    }
}

impl ValidationRules {
    pub fn with_max_timeout(max_timeout_secs: u64) -> Self {
        Self { max_timeout_secs }
    }

    fn check_timeout(&self, location: &str, value: u64) -> Result<(), ValidationError> {
        if value == 0 || value > self.max_timeout_secs {
            return Err(ValidationError::InvalidTimeout {
                location: location.to_string(),
                value,
                max: self.max_timeout_secs,
            });
        }
        Ok(())
    }
}

fn require(location: &str, field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::EmptyField {
            location: location.to_string(),
            field,
        });
    }
    Ok(())
}

impl TestPlan {
    /// 使用默认规则校验
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.validate_with(&ValidationRules::default())
    }

    pub fn validate_with(&self, rules: &ValidationRules) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyPlanName);
        }
        if self.version == 0 {
            return Err(ValidationError::InvalidVersion);
        }
        if self.test_cases.is_empty() {
            return Err(ValidationError::NoTestCases);
        }

        let mut names = HashSet::new();
        for case in &self.test_cases {
            if !names.insert(case.name.as_str()) {
                return Err(ValidationError::DuplicateTestCase(case.name.clone()));
            }
            case.validate_with(rules)?;
        }

        Ok(())
    }
}

impl TestCase {
    /// 使用默认规则校验
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.validate_with(&ValidationRules::default())
    }

    pub fn validate_with(&self, rules: &ValidationRules) -> Result<(), ValidationError> {
        require("测试用例", "name", &self.name)?;

        let mut resources = HashSet::new();
        let mut machines: HashMap<&str, &str> = HashMap::new();
        for init in &self.resource_init {
            self.validate_resource(init, rules)?;

            if !resources.insert(init.resource_id.as_str()) {
                return Err(ValidationError::DuplicateResource {
                    case: self.name.clone(),
                    resource_id: init.resource_id.clone(),
                });
            }
            let vm = init.virtual_machine.as_str();
            if let Some(first) = machines.insert(vm, init.resource_id.as_str()) {
                return Err(ValidationError::SharedVirtualMachine {
                    case: self.name.clone(),
                    virtual_machine: init.virtual_machine.clone(),
                    first: first.to_string(),
                    second: init.resource_id.clone(),
                });
            }
        }

        for (index, item) in self.test_steps.iter().enumerate() {
            if !resources.contains(item.resource_id()) {
                return Err(ValidationError::UnknownResource {
                    case: self.name.clone(),
                    index,
                    resource_id: item.resource_id().to_string(),
                });
            }
            if let TestStepItem::Step(step) = item {
                self.validate_step(index, step, rules)?;
            }
        }

        Ok(())
    }

    fn validate_resource(
        &self,
        init: &PrepareVirtualMachine,
        rules: &ValidationRules,
    ) -> Result<(), ValidationError> {
        let location = format!("测试用例 {} 资源 {}", self.name, init.resource_id);
        require(&location, "resource_id", &init.resource_id)?;
        require(&location, "virtual_machine", &init.virtual_machine)?;
        require(&location, "checkpoint", &init.checkpoint)?;
        rules.check_timeout(&location, init.timeout)
    }

    fn validate_step(
        &self,
        index: usize,
        step: &Step,
        rules: &ValidationRules,
    ) -> Result<(), ValidationError> {
        let location = format!("测试用例 {} 步骤 {}", self.name, index);
        require(&location, "description", &step.description)?;
        require(&location, "executable", &step.executable)?;
        if let Some(source) = &step.source {
            require(&location, "source", source)?;
        }

        let len = step.directory.chars().count();
        if len == 0 || len > MAX_DIRECTORY_LEN {
            return Err(ValidationError::InvalidDirectory { location, len });
        }

        rules.check_timeout(&location, step.timeout)
    }
}
