use super::Kwargs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 检查组/调度中的一项
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckEntry {
    /// `module/name`
    pub check_string: String,
    #[serde(default)]
    pub kwargs: Kwargs,
    /// 运行前必须已完成的同组条目ID
    #[serde(default)]
    pub dependency_ids: Vec<String>,
    /// 本条目在运行中的ID，其他条目依赖它时使用
    #[serde(default)]
    pub id: Option<String>,
}

impl CheckEntry {
    pub fn new(check_string: impl Into<String>) -> Self {
        Self {
            check_string: check_string.into(),
            kwargs: Kwargs::new(),
            dependency_ids: Vec::new(),
            id: None,
        }
    }

    pub fn with_kwargs(mut self, kwargs: Kwargs) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn with_dependencies<I, S>(mut self, dependency_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependency_ids = dependency_ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// `module/name` 中的 name 部分
    pub fn short_name(&self) -> &str {
        short_name(&self.check_string)
    }

    /// 条目ID，默认为检查名
    pub fn entry_id(&self) -> &str {
        self.id.as_deref().unwrap_or_else(|| self.short_name())
    }
}

pub fn short_name(check_string: &str) -> &str {
    check_string
        .rsplit_once('/')
        .map(|(_, name)| name)
        .unwrap_or(check_string)
}

/// 调度中某个环境下的一项配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    #[serde(default)]
    pub kwargs: Kwargs,
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub id: String,
}

/// 检查配置中单个检查的定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckSetupEntry {
    pub title: String,
    pub group: String,
    /// schedule 名 -> 环境名（或 "all"）-> 配置
    #[serde(default)]
    pub schedule: BTreeMap<String, BTreeMap<String, ScheduleEntry>>,
    #[serde(default)]
    pub display: Vec<String>,
}

/// 检查名 -> 定义
pub type CheckSetup = BTreeMap<String, CheckSetupEntry>;
