// 内置检查模块
pub mod system_checks;

use crate::{error::AppResult, services::CheckRegistry};

/// 注册全部内置检查和动作
pub fn build_registry() -> AppResult<CheckRegistry> {
    let mut registry = CheckRegistry::new();
    system_checks::register(&mut registry)?;
    Ok(registry)
}
