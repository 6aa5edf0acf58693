use crate::{
    error::{AppError, AppResult},
    models::{CheckEntry, CheckSetup, CheckSetupEntry, Kwargs, RunKind, RunRecord, ScheduleEntry},
    repositories::RunResult,
    services::connection::Connection,
};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

pub type CheckFuture = Pin<Box<dyn Future<Output = anyhow::Result<RunResult>> + Send>>;

/// 已注册的检查/动作函数
pub type CheckFn = Arc<dyn Fn(Connection, Kwargs) -> CheckFuture + Send + Sync>;

/// 检查字符串、参数等校验失败；作为值返回，批量运行时不会中断
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("ERROR. Check string must be of form module/check_name. Info: CHECK: {check_string} KWARGS: {kwargs}")]
    MalformedCheckString { check_string: String, kwargs: String },

    #[error("ERROR. Check kwargs must be a dict. Info: CHECK: {check_string} KWARGS: {kwargs}")]
    KwargsNotMapping { check_string: String, kwargs: String },

    #[error("ERROR. Check module is not valid. Info: CHECK: {check_string} KWARGS: {kwargs}")]
    UnknownModule { check_string: String, kwargs: String },

    #[error("ERROR. Check name is not valid. Info: CHECK: {check_string} KWARGS: {kwargs}")]
    UnknownCheck { check_string: String, kwargs: String },

    #[error("ERROR. {check_string} is not registered as a {expected}. Info: CHECK: {check_string} KWARGS: {kwargs}")]
    WrongCapability {
        check_string: String,
        kwargs: String,
        expected: RunKind,
    },
}

/// 注册表中的一项
#[derive(Clone)]
pub struct Registration {
    pub module: String,
    pub name: String,
    pub kind: RunKind,
    pub default_kwargs: Kwargs,
    pub func: CheckFn,
}

impl Registration {
    pub fn check_string(&self) -> String {
        format!("{}/{}", self.module, self.name)
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("module", &self.module)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("default_kwargs", &self.default_kwargs)
            .finish()
    }
}

/// 把异步函数包装为 [`CheckFn`]
pub fn check_fn<F, Fut>(f: F) -> CheckFn
where
    F: Fn(Connection, Kwargs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<RunResult>> + Send + 'static,
{
    Arc::new(move |connection, kwargs| Box::pin(f(connection, kwargs)))
}

/// 检查/动作注册表，启动时构建，之后只读
#[derive(Debug, Default, Clone)]
pub struct CheckRegistry {
    entries: BTreeMap<String, Registration>,
    modules: BTreeSet<String>,
    groups: BTreeMap<String, Vec<CheckEntry>>,
    setup: CheckSetup,
}

impl CheckRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_check<F, Fut>(
        &mut self,
        module: &str,
        name: &str,
        default_kwargs: Kwargs,
        f: F,
    ) -> AppResult<()>
    where
        F: Fn(Connection, Kwargs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<RunResult>> + Send + 'static,
    {
        self.register(module, name, RunKind::Check, default_kwargs, check_fn(f))
    }

    pub fn register_action<F, Fut>(
        &mut self,
        module: &str,
        name: &str,
        default_kwargs: Kwargs,
        f: F,
    ) -> AppResult<()>
    where
        F: Fn(Connection, Kwargs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<RunResult>> + Send + 'static,
    {
        self.register(module, name, RunKind::Action, default_kwargs, check_fn(f))
    }

    pub fn register(
        &mut self,
        module: &str,
        name: &str,
        kind: RunKind,
        default_kwargs: Kwargs,
        func: CheckFn,
    ) -> AppResult<()> {
        if module.is_empty() || name.is_empty() || module.contains('/') || name.contains('/') {
            return Err(AppError::bad_check_setup(format!(
                "注册名非法: {}/{}",
                module, name
            )));
        }
        // 检查名在所有模块中必须唯一，按名称查找时才不会有歧义
        if let Some(existing) = self.entries.values().find(|r| r.name == name) {
            return Err(AppError::bad_check_setup(format!(
                "重复注册: {} 已注册为 {}",
                name,
                existing.check_string()
            )));
        }

        let registration = Registration {
            module: module.to_string(),
            name: name.to_string(),
            kind,
            default_kwargs,
            func,
        };
        tracing::debug!("注册{}: {}", kind, registration.check_string());
        self.modules.insert(module.to_string());
        self.entries.insert(registration.check_string(), registration);
        Ok(())
    }

    /// 注册一个命名检查组
    pub fn register_group(&mut self, name: &str, entries: Vec<CheckEntry>) {
        self.groups.insert(name.to_string(), entries);
    }

    fn strings_of_kind(&self, kind: RunKind) -> Vec<String> {
        self.entries
            .values()
            .filter(|r| r.kind == kind)
            .map(Registration::check_string)
            .collect()
    }

    fn string_of_kind(&self, kind: RunKind, name: &str) -> Option<String> {
        self.entries
            .values()
            .find(|r| r.kind == kind && r.name == name)
            .map(Registration::check_string)
    }

    /// 全部检查的 `module/name`
    pub fn get_check_strings(&self) -> Vec<String> {
        self.strings_of_kind(RunKind::Check)
    }

    /// 指定检查名对应的 `module/name`
    pub fn get_check_string(&self, name: &str) -> Option<String> {
        self.string_of_kind(RunKind::Check, name)
    }

    pub fn get_action_strings(&self) -> Vec<String> {
        self.strings_of_kind(RunKind::Action)
    }

    pub fn get_action_string(&self, name: &str) -> Option<String> {
        self.string_of_kind(RunKind::Action, name)
    }

    /// 已注册项的类型；未注册时返回 `None`
    pub fn kind_of(&self, check_string: &str) -> Option<RunKind> {
        self.entries.get(check_string.trim()).map(|r| r.kind)
    }

    /// 解析并校验 `module/name`，返回对应的注册项
    pub fn resolve(
        &self,
        check_string: &str,
        kwargs: &Value,
        expected: RunKind,
    ) -> Result<&Registration, ValidationError> {
        let info = || (check_string.to_string(), kwargs.to_string());

        let parts: Vec<&str> = check_string.trim().split('/').collect();
        let [module, name] = parts.as_slice() else {
            let (check_string, kwargs) = info();
            return Err(ValidationError::MalformedCheckString {
                check_string,
                kwargs,
            });
        };
        if !kwargs.is_object() {
            let (check_string, kwargs) = info();
            return Err(ValidationError::KwargsNotMapping {
                check_string,
                kwargs,
            });
        }
        if !self.modules.contains(*module) {
            let (check_string, kwargs) = info();
            return Err(ValidationError::UnknownModule {
                check_string,
                kwargs,
            });
        }
        let Some(registration) = self.entries.get(&format!("{}/{}", module, name)) else {
            let (check_string, kwargs) = info();
            return Err(ValidationError::UnknownCheck {
                check_string,
                kwargs,
            });
        };
        if registration.kind != expected {
            let (check_string, kwargs) = info();
            return Err(ValidationError::WrongCapability {
                check_string,
                kwargs,
                expected,
            });
        }
        Ok(registration)
    }

    /// 按名称获取检查组；"all" 包含全部检查。返回副本，未知或为空时返回 `None`
    pub fn fetch_check_group(&self, name: &str) -> Option<Vec<CheckEntry>> {
        if name == "all" {
            let all: Vec<CheckEntry> = self
                .get_check_strings()
                .into_iter()
                .map(CheckEntry::new)
                .collect();
            return (!all.is_empty()).then_some(all);
        }
        self.groups
            .get(name)
            .filter(|group| !group.is_empty())
            .cloned()
    }

    /// 收集检查的主结果（或最新结果），按名称排序
    pub async fn get_check_results(
        &self,
        connection: &Connection,
        checks: Option<&[String]>,
        use_latest: bool,
    ) -> Vec<RunRecord> {
        let names: Vec<String> = self
            .entries
            .values()
            .filter(|r| r.kind == RunKind::Check)
            .filter(|r| checks.is_none_or(|wanted| wanted.contains(&r.name)))
            .map(|r| r.name.clone())
            .collect();

        let mut results = Vec::new();
        for name in names {
            let check = connection.check_result(&name);
            let found = if use_latest {
                check.get_latest_result().await
            } else {
                check.get_primary_result().await
            };
            if let Some(record) = found {
                results.push(record);
            }
        }
        results.sort_by_key(|record| record.name.to_lowercase());
        results
    }

    /// 加载检查配置，校验失败时返回错误且不修改当前配置
    pub fn load_check_setup(&mut self, raw: Value, environments: &[String]) -> AppResult<()> {
        self.setup = self.validate_check_setup(raw, environments)?;
        tracing::info!("已加载 {} 个检查的配置", self.setup.len());
        Ok(())
    }

    pub fn setup(&self) -> &CheckSetup {
        &self.setup
    }

    /// 校验检查配置并补全默认值
    pub fn validate_check_setup(&self, raw: Value, environments: &[String]) -> AppResult<CheckSetup> {
        let Value::Object(checks) = raw else {
            return Err(AppError::bad_check_setup("检查配置必须是 JSON 对象"));
        };

        let mut setup = CheckSetup::new();
        for (check_name, entry) in checks {
            if self.get_check_string(&check_name).is_none() {
                return Err(AppError::bad_check_setup(format!(
                    "{} 不是已注册的检查",
                    check_name
                )));
            }
            let Value::Object(mut entry) = entry else {
                return Err(AppError::bad_check_setup(format!(
                    "{} 的配置必须是对象",
                    check_name
                )));
            };
            for key in ["title", "group", "schedule"] {
                if !entry.contains_key(key) {
                    return Err(AppError::bad_check_setup(format!(
                        "{} 的配置缺少字段: {}",
                        check_name, key
                    )));
                }
            }
            let title = take_string(&mut entry, "title", &check_name)?;
            let group = take_string(&mut entry, "group", &check_name)?;

            let Some(Value::Object(schedules)) = entry.remove("schedule") else {
                return Err(AppError::bad_check_setup(format!(
                    "{} 的 schedule 必须是对象",
                    check_name
                )));
            };

            let display: Vec<String> = match entry.remove("display") {
                None => Vec::new(),
                Some(Value::Array(items)) => items
                    .into_iter()
                    .map(|item| match item {
                        Value::String(env) => Ok(env),
                        other => Err(AppError::bad_check_setup(format!(
                            "{} 的 display 只能包含环境名，发现: {}",
                            check_name, other
                        ))),
                    })
                    .collect::<AppResult<_>>()?,
                Some(other) => {
                    return Err(AppError::bad_check_setup(format!(
                        "{} 的 display 必须是列表，发现: {}",
                        check_name, other
                    )));
                }
            };
            if schedules.is_empty() && display.is_empty() {
                return Err(AppError::bad_check_setup(format!(
                    "{} 没有 schedule，必须提供 display",
                    check_name
                )));
            }

            let mut schedule = BTreeMap::new();
            for (schedule_name, by_env) in schedules {
                let Value::Object(by_env) = by_env else {
                    return Err(AppError::bad_check_setup(format!(
                        "{} 的 schedule {} 必须是对象",
                        check_name, schedule_name
                    )));
                };
                let mut env_entries = BTreeMap::new();
                for (env, env_entry) in by_env {
                    if env != "all" && !environments.contains(&env) {
                        return Err(AppError::bad_check_setup(format!(
                            "{} 的 schedule {} 引用了未知环境: {}",
                            check_name, schedule_name, env
                        )));
                    }
                    let parsed = parse_schedule_entry(&check_name, &schedule_name, env_entry)?;
                    env_entries.insert(env, parsed);
                }
                schedule.insert(schedule_name, env_entries);
            }

            setup.insert(
                check_name,
                CheckSetupEntry {
                    title,
                    group,
                    schedule,
                    display,
                },
            );
        }

        // 依赖必须指向同一调度中的其他检查
        for (check_name, entry) in &setup {
            for (schedule_name, by_env) in &entry.schedule {
                let ids_in_schedule: BTreeSet<&str> = setup
                    .values()
                    .filter_map(|other| other.schedule.get(schedule_name))
                    .flat_map(|envs| envs.values().map(|e| e.id.as_str()))
                    .collect();
                for schedule_entry in by_env.values() {
                    for dep in &schedule_entry.dependencies {
                        if !ids_in_schedule.contains(dep.as_str()) {
                            return Err(AppError::bad_check_setup(format!(
                                "{} 在 schedule {} 中的依赖 {} 不是同一调度中的检查",
                                check_name, schedule_name, dep
                            )));
                        }
                    }
                }
            }
        }

        Ok(setup)
    }

    /// 调度中的条目，按环境分组（含 "all"）
    pub fn get_check_schedule(&self, schedule: &str) -> BTreeMap<String, Vec<CheckEntry>> {
        let mut by_env: BTreeMap<String, Vec<CheckEntry>> = BTreeMap::new();
        for (check_name, entry) in &self.setup {
            let Some(envs) = entry.schedule.get(schedule) else {
                continue;
            };
            let Some(check_string) = self.get_check_string(check_name) else {
                continue;
            };
            for (env, schedule_entry) in envs {
                by_env.entry(env.clone()).or_default().push(
                    CheckEntry::new(check_string.clone())
                        .with_kwargs(schedule_entry.kwargs.clone())
                        .with_dependencies(schedule_entry.dependencies.iter().cloned())
                        .with_id(schedule_entry.id.clone()),
                );
            }
        }
        by_env
    }

    pub fn get_schedule_names(&self) -> Vec<String> {
        let names: BTreeSet<&String> = self
            .setup
            .values()
            .flat_map(|entry| entry.schedule.keys())
            .collect();
        names.into_iter().cloned().collect()
    }

    /// 属于某个调度的检查名
    pub fn get_checks_within_schedule(&self, schedule: &str) -> Vec<String> {
        self.setup
            .iter()
            .filter(|(_, entry)| entry.schedule.contains_key(schedule))
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn get_check_title(&self, name: &str) -> Option<String> {
        self.setup.get(name).map(|entry| entry.title.clone())
    }
}

fn take_string(
    entry: &mut serde_json::Map<String, Value>,
    key: &str,
    check_name: &str,
) -> AppResult<String> {
    match entry.remove(key) {
        Some(Value::String(value)) => Ok(value),
        other => Err(AppError::bad_check_setup(format!(
            "{} 的 {} 必须是字符串，发现: {}",
            check_name,
            key,
            other.unwrap_or(Value::Null)
        ))),
    }
}

fn parse_schedule_entry(
    check_name: &str,
    schedule_name: &str,
    raw: Value,
) -> AppResult<ScheduleEntry> {
    let Value::Object(mut raw) = raw else {
        return Err(AppError::bad_check_setup(format!(
            "{} 在 schedule {} 中的配置必须是对象",
            check_name, schedule_name
        )));
    };

    let kwargs = match raw.remove("kwargs") {
        None => Kwargs::new(),
        Some(Value::Object(kwargs)) => kwargs,
        Some(other) => {
            return Err(AppError::bad_check_setup(format!(
                "{} 在 schedule {} 中的 kwargs 必须是对象，发现: {}",
                check_name, schedule_name, other
            )));
        }
    };

    let dependencies = match raw.remove("dependencies") {
        None => Vec::new(),
        Some(Value::Array(items)) => {
            let mut dependencies = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::String(dep) => dependencies.push(dep),
                    other => {
                        return Err(AppError::bad_check_setup(format!(
                            "{} 在 schedule {} 中的依赖必须是字符串，发现: {}",
                            check_name, schedule_name, other
                        )));
                    }
                }
            }
            dependencies
        }
        Some(other) => {
            return Err(AppError::bad_check_setup(format!(
                "{} 在 schedule {} 中的 dependencies 必须是列表，发现: {}",
                check_name, schedule_name, other
            )));
        }
    };

    let id = match raw.remove("id") {
        Some(Value::String(id)) => id,
        _ => check_name.to_string(),
    };

    Ok(ScheduleEntry {
        kwargs,
        dependencies,
        id,
    })
}
