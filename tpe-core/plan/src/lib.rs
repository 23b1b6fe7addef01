//! TPE 测试计划模型
//!
//! 测试计划（TestPlan）的内存表示：
//! - 测试用例与资源初始化（PrepareVirtualMachine）
//! - 有序测试步骤（Step / RefreshResource）
//! - YAML/JSON 加载与导出
//! - 执行前的结构校验（引用、唯一性、字段约束）
//!
//! # 示例
//!
//! ```ignore
//! use tpe_plan::TestPlan;
//!
//! let plan = TestPlan::from_yaml_file("plans/smoke.yaml")?;
//! plan.validate()?;
//! for case in &plan.test_cases {
//!     println!("{}: {} 个资源", case.name, case.resource_init.len());
//! }
//! ```

pub mod model;
pub mod validate;

pub use model::{
    ExecParam, ExecParams, PrepareVirtualMachine, RefreshResource, RestartComputer, Step, TestCase,
    TestPlan, TestStepItem,
};
pub use validate::{ValidationError, ValidationRules, DEFAULT_MAX_TIMEOUT_SECS, MAX_DIRECTORY_LEN};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlanError {
    #[error("测试计划加载失败: {0}")]
    LoadFailed(String),

    #[error("序列化错误: {0}")]
    SerdeError(String),

    #[error("IO 错误: {0}")]
    IoError(#[from] std::io::Error),

    #[error("测试计划校验失败: {0}")]
    Validation(#[from] ValidationError),
}

pub type Result<T> = std::result::Result<T, PlanError>;
