use crate::{
    error::{AppError, AppResult},
    models::{
        HistoryEntry, Kwargs, RunKind, RunRecord, filename_to_datetime, format_uuid, merge_output,
        new_uuid, parse_uuid, primary_key, result_key,
    },
    storage::{SharedStorage, Storage},
};
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

/// 一次检查或动作运行的结果
///
/// 由检查函数创建并填充，调用 [`RunResult::store_result`] 后持久化；
/// 同时提供对同名历史结果的查询。
#[derive(Debug, Clone)]
pub struct RunResult {
    storage: SharedStorage,
    pub name: String,
    pub kind: RunKind,
    pub status: String,
    pub summary: String,
    pub description: String,
    pub brief_output: Value,
    pub full_output: Value,
    pub admin_output: Value,
    /// 动作输出
    pub output: Value,
    pub kwargs: Kwargs,
    pub allow_action: bool,
    /// 关联的动作名
    pub action: Option<String>,
    pub action_message: String,
}

impl RunResult {
    pub fn new(storage: SharedStorage, name: impl Into<String>, kind: RunKind) -> Self {
        Self {
            storage,
            name: name.into(),
            kind,
            status: kind.default_status().to_string(),
            summary: String::new(),
            description: String::new(),
            brief_output: Value::Null,
            full_output: Value::Null,
            admin_output: Value::Null,
            output: Value::Null,
            kwargs: Kwargs::new(),
            allow_action: false,
            action: None,
            action_message: String::new(),
        }
    }

    pub fn check(storage: SharedStorage, name: impl Into<String>) -> Self {
        Self::new(storage, name, RunKind::Check)
    }

    pub fn action(storage: SharedStorage, name: impl Into<String>) -> Self {
        Self::new(storage, name, RunKind::Action)
    }

    /// 从已存储的记录恢复，便于在同一 uuid 下继续修改
    pub fn from_record(storage: SharedStorage, record: RunRecord) -> Self {
        Self {
            storage,
            name: record.name,
            kind: record.kind,
            status: record.status,
            summary: record.summary,
            description: record.description,
            brief_output: record.brief_output,
            full_output: record.full_output,
            admin_output: record.admin_output,
            output: record.output,
            kwargs: record.kwargs,
            allow_action: record.allow_action,
            action: record.action,
            action_message: record.action_message,
        }
    }

    /// 加载指定 uuid 的结果；不存在时返回 `None`
    pub async fn load(
        storage: SharedStorage,
        name: &str,
        kind: RunKind,
        uuid: &str,
    ) -> Option<Self> {
        let record = read_record(storage.as_ref(), &result_key(name, uuid)).await?;
        if record.kind != kind {
            return None;
        }
        Some(Self::from_record(storage, record))
    }

    pub fn storage(&self) -> &SharedStorage {
        &self.storage
    }

    /// 本结果的 uuid（尚未设置时为 `None`）
    pub fn uuid(&self) -> Option<&str> {
        self.kwargs.get("uuid").and_then(Value::as_str)
    }

    /// 按当前字段生成记录，不做校验
    pub fn format_result(&self, uuid: &str) -> RunRecord {
        RunRecord {
            name: self.name.clone(),
            uuid: uuid.to_string(),
            kind: self.kind,
            status: self.status.clone(),
            summary: self.summary.clone(),
            description: self.description.clone(),
            brief_output: self.brief_output.clone(),
            full_output: self.full_output.clone(),
            admin_output: self.admin_output.clone(),
            output: self.output.clone(),
            kwargs: self.kwargs.clone(),
            allow_action: self.allow_action,
            action: self.action.clone(),
            action_message: self.action_message.clone(),
        }
    }

    /// 非法状态强制改为错误状态
    fn validate_status(&mut self) {
        let status = self.status.to_uppercase();
        if self.kind.is_valid_status(&status) {
            self.status = status;
        } else {
            tracing::warn!(
                name = %self.name,
                status = %self.status,
                "结果状态非法，已改为 {}",
                self.kind.error_status()
            );
            self.status = self.kind.error_status().to_string();
            self.description = self.kind.malformed_status_description().to_string();
        }
    }

    /// 持久化结果并返回写入的记录
    ///
    /// 总是写入 `<name>/<uuid>.json`；`kwargs.primary` 为 true 时同时覆盖主结果指针。
    /// `kwargs.do_not_store` 为 true 时只返回记录，不写入存储。
    pub async fn store_result(&mut self) -> AppResult<RunRecord> {
        self.validate_status();

        let uuid = match self.uuid() {
            Some(uuid) => uuid.to_string(),
            None => {
                let uuid = new_uuid();
                self.kwargs
                    .insert("uuid".to_string(), Value::String(uuid.clone()));
                uuid
            }
        };
        self.kwargs
            .entry("primary")
            .or_insert(Value::Bool(false));

        if self.summary.is_empty() && !self.description.is_empty() {
            self.summary = self.description.clone();
        } else if self.description.is_empty() && !self.summary.is_empty() {
            self.description = self.summary.clone();
        }

        let record = self.format_result(&uuid);
        let do_not_store = self
            .kwargs
            .get("do_not_store")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if do_not_store {
            return Ok(record);
        }

        let body = Bytes::from(serde_json::to_vec(&record)?);
        if self
            .storage
            .put_object(&record.storage_key(), body.clone())
            .await
            .is_none()
        {
            tracing::error!(key = %record.storage_key(), "结果写入失败");
        }
        if record.is_primary() {
            self.storage.put_object(&primary_key(&self.name), body).await;
        }

        Ok(record)
    }

    /// uuid 最大（最新）的结果
    pub async fn get_latest_result(&self) -> Option<RunRecord> {
        let (key, _) = self.timestamped_keys().await.pop()?;
        read_record(self.storage.as_ref(), &key).await
    }

    pub async fn get_primary_result(&self) -> Option<RunRecord> {
        read_record(self.storage.as_ref(), &primary_key(&self.name)).await
    }

    pub async fn get_result_by_uuid(&self, uuid: &str) -> Option<RunRecord> {
        read_record(self.storage.as_ref(), &result_key(&self.name, uuid)).await
    }

    /// 不晚于 `now（或 override_date）- diff` 的最近一个非错误结果
    ///
    /// 从未产生过结果时返回 [`AppError::NoResults`]；结果都晚于目标时间时返回
    /// [`AppError::NoResultsBefore`]；存在结果但全部为错误状态时返回 [`AppError::NoNonErrorResult`]。
    pub async fn get_closest_result(
        &self,
        diff_hours: i64,
        diff_mins: i64,
        override_date: Option<DateTime<Utc>>,
    ) -> AppResult<RunRecord> {
        let target = override_date.unwrap_or_else(Utc::now)
            - Duration::hours(diff_hours)
            - Duration::minutes(diff_mins);

        let keys = self.timestamped_keys().await;
        if keys.is_empty() {
            return Err(AppError::NoResults {
                name: self.name.clone(),
            });
        }

        let candidates: Vec<String> = keys
            .into_iter()
            .rev()
            .filter(|(_, time)| *time <= target)
            .map(|(key, _)| key)
            .collect();

        if candidates.is_empty() {
            return Err(AppError::NoResultsBefore {
                name: self.name.clone(),
                target: format_uuid(target),
            });
        }

        for key in candidates {
            match read_record(self.storage.as_ref(), &key).await {
                Some(record) if !record.is_error() => return Ok(record),
                _ => continue,
            }
        }

        Err(AppError::NoNonErrorResult {
            name: self.name.clone(),
            error_status: self.kind.error_status().to_string(),
        })
    }

    /// 按时间倒序分页返回历史记录，可选只保留 `after_date` 之后的结果
    pub async fn get_result_history(
        &self,
        start: usize,
        limit: usize,
        after_date: Option<DateTime<Utc>>,
    ) -> Vec<HistoryEntry> {
        let keys: Vec<String> = self
            .timestamped_keys()
            .await
            .into_iter()
            .rev()
            .filter(|(_, time)| after_date.is_none_or(|after| *time >= after))
            .skip(start)
            .take(limit)
            .map(|(key, _)| key)
            .collect();

        let mut history = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(record) = read_record(self.storage.as_ref(), &key).await {
                history.push(HistoryEntry::from(record));
            }
        }
        history
    }

    /// 全部历史结果，按时间正序
    pub async fn get_all_results(&self) -> Vec<RunRecord> {
        let mut results = Vec::new();
        for (key, _) in self.timestamped_keys().await {
            if let Some(record) = read_record(self.storage.as_ref(), &key).await {
                results.push(record);
            }
        }
        results
    }

    /// 动作对应的检查结果（由 kwargs 中的 check_name 和 called_by 确定）
    pub async fn get_associated_check_result(&self, kwargs: &Kwargs) -> Option<RunRecord> {
        let check_name = kwargs.get("check_name").and_then(Value::as_str)?;
        let called_by = kwargs.get("called_by").and_then(Value::as_str)?;
        let record = read_record(self.storage.as_ref(), &result_key(check_name, called_by)).await?;
        (record.kind == RunKind::Check).then_some(record)
    }

    /// `<name>/<uuid>.json` 形式的 key，按时间正序；主结果指针和动作记录被忽略
    async fn timestamped_keys(&self) -> Vec<(String, DateTime<Utc>)> {
        let prefix = format!("{}/", self.name);
        let mut keys: Vec<(String, DateTime<Utc>)> = self
            .storage
            .list_keys_with_prefix(&prefix)
            .await
            .into_iter()
            .filter(|key| {
                key.strip_prefix(&prefix)
                    .is_some_and(|rest| !rest.contains('/'))
            })
            .filter_map(|key| filename_to_datetime(&key).map(|time| (key, time)))
            .collect();
        keys.sort();
        keys
    }
}

/// 读取并解析结果记录
pub async fn read_record(storage: &dyn Storage, key: &str) -> Option<RunRecord> {
    let body = storage.get_object(key).await?;
    match serde_json::from_slice(&body) {
        Ok(record) => Some(record),
        Err(e) => {
            tracing::warn!(key, error = %e, "结果记录无法解析");
            None
        }
    }
}

/// 动作记录的 key：检查某次运行已经触发过的动作
pub fn action_record_key(check_name: &str, check_uuid: &str) -> String {
    format!("{}/action_records/{}", check_name, check_uuid)
}

/// 查询检查某次运行关联的动作结果 key
pub async fn get_action_record(
    storage: &dyn Storage,
    check_name: &str,
    check_uuid: &str,
) -> Option<String> {
    let body = storage
        .get_object(&action_record_key(check_name, check_uuid))
        .await?;
    String::from_utf8(body.to_vec()).ok()
}

/// 记录检查某次运行已由哪个动作结果处理
pub async fn put_action_record(
    storage: &dyn Storage,
    check_name: &str,
    check_uuid: &str,
    action_key: &str,
) {
    let key = action_record_key(check_name, check_uuid);
    if storage
        .put_object(&key, Bytes::from(action_key.to_string()))
        .await
        .is_none()
    {
        tracing::warn!(key = %key, "动作记录写入失败");
    }
}

/// 合并外部提交的检查结果
///
/// 请求体中带 `uuid` 且该结果已存在时，输出字段按 [`merge_output`] 合并，其余字段覆盖。
/// 合并后的结果总是作为主结果存储。
pub async fn put_check_result(
    storage: SharedStorage,
    name: &str,
    body: Value,
) -> AppResult<RunRecord> {
    let mut fields = match body {
        Value::Object(fields) => fields,
        other => {
            return Err(AppError::bad_request(format!(
                "PUT request is malformed: {}",
                other
            )));
        }
    };

    let uuid = match fields.remove("uuid") {
        Some(Value::String(uuid)) if parse_uuid(&uuid).is_some() => uuid,
        Some(Value::String(uuid)) => {
            return Err(AppError::bad_request(format!(
                "PUT request is malformed: uuid must be a timestamp like 2024-03-01T08:00:00.000000, got {}",
                uuid
            )));
        }
        Some(Value::Null) | None => new_uuid(),
        Some(other) => {
            return Err(AppError::bad_request(format!(
                "PUT request is malformed: uuid must be a string, got {}",
                other
            )));
        }
    };

    let mut result = match RunResult::load(storage.clone(), name, RunKind::Check, &uuid).await {
        Some(previous) => previous,
        None => RunResult::check(storage, name),
    };

    for (field, value) in fields {
        match field.as_str() {
            "brief_output" => {
                result.brief_output = merge_output(std::mem::take(&mut result.brief_output), value)
            }
            "full_output" => {
                result.full_output = merge_output(std::mem::take(&mut result.full_output), value)
            }
            "admin_output" => {
                result.admin_output = merge_output(std::mem::take(&mut result.admin_output), value)
            }
            "status" | "summary" | "description" | "action_message" => {
                let text = match value {
                    Value::String(text) => text,
                    other => other.to_string(),
                };
                match field.as_str() {
                    "status" => result.status = text,
                    "summary" => result.summary = text,
                    "description" => result.description = text,
                    _ => result.action_message = text,
                }
            }
            "allow_action" => result.allow_action = value.as_bool().unwrap_or(false),
            "action" => result.action = value.as_str().map(str::to_string),
            _ => {
                tracing::debug!(field = %field, "忽略未知的结果字段");
            }
        }
    }

    let mut kwargs = Kwargs::new();
    kwargs.insert("primary".to_string(), Value::Bool(true));
    kwargs.insert("uuid".to_string(), Value::String(uuid));
    result.kwargs = kwargs;

    result.store_result().await
}
