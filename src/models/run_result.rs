use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// 调用参数，等价于 JSON 对象
pub type Kwargs = Map<String, Value>;

/// 结果 uuid 的格式：定宽，因此字典序与时间顺序一致
pub const UUID_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

/// 主结果指针的文件名
pub const PRIMARY_RESULT: &str = "primary_result";

/// 当前 UTC 时间生成的结果 uuid
pub fn new_uuid() -> String {
    format_uuid(Utc::now())
}

pub fn format_uuid(time: DateTime<Utc>) -> String {
    time.format(UUID_FORMAT).to_string()
}

/// 解析结果 uuid，兼容任意精度的小数秒
pub fn parse_uuid(uuid: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(uuid, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// 从存储 key（`<name>/<uuid>.json`）中解析时间
pub fn filename_to_datetime(key: &str) -> Option<DateTime<Utc>> {
    let file_name = key.rsplit('/').next()?;
    let uuid = file_name.strip_suffix(".json")?;
    parse_uuid(uuid)
}

/// 运行类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunKind {
    Check,
    Action,
}

impl RunKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunKind::Check => "check",
            RunKind::Action => "action",
        }
    }

    /// 允许写入的状态
    pub fn allowed_statuses(&self) -> &'static [&'static str] {
        match self {
            RunKind::Check => &["PASS", "WARN", "FAIL", "ERROR", "IGNORE"],
            RunKind::Action => &["PEND", "DONE", "FAIL"],
        }
    }

    /// 新建记录的默认状态
    pub fn default_status(&self) -> &'static str {
        match self {
            RunKind::Check => "IGNORE",
            RunKind::Action => "PEND",
        }
    }

    /// 出错时写入的状态
    pub fn error_status(&self) -> &'static str {
        match self {
            RunKind::Check => "ERROR",
            RunKind::Action => "FAIL",
        }
    }

    pub fn malformed_status_description(&self) -> &'static str {
        match self {
            RunKind::Check => "Malformed status; look at check definition.",
            RunKind::Action => "Malformed status; look at action definition.",
        }
    }

    /// 执行出错时写入的描述
    pub fn failed_to_run_description(&self) -> &'static str {
        match self {
            RunKind::Check => "Check failed to run. See full output.",
            RunKind::Action => "Action failed to run. See output.",
        }
    }

    pub fn wrong_result_kind_message(&self) -> &'static str {
        match self {
            RunKind::Check => "Check function must return a CheckResult object.",
            RunKind::Action => "Action functions must return an ActionResult object.",
        }
    }

    pub fn is_valid_status(&self, status: &str) -> bool {
        self.allowed_statuses().contains(&status)
    }
}

impl fmt::Display for RunKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 持久化的检查/动作结果记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub name: String,
    pub uuid: String,
    #[serde(rename = "type")]
    pub kind: RunKind,
    pub status: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub brief_output: Value,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub full_output: Value,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub admin_output: Value,
    /// 动作的输出
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub output: Value,
    #[serde(default)]
    pub kwargs: Kwargs,
    #[serde(default)]
    pub allow_action: bool,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub action_message: String,
}

impl RunRecord {
    /// 该记录是否被标记为主结果
    pub fn is_primary(&self) -> bool {
        self.kwargs
            .get("primary")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn is_error(&self) -> bool {
        self.status == self.kind.error_status()
    }

    pub fn storage_key(&self) -> String {
        result_key(&self.name, &self.uuid)
    }
}

/// 结果记录的存储 key
pub fn result_key(name: &str, uuid: &str) -> String {
    format!("{}/{}.json", name, uuid)
}

/// 主结果指针的存储 key
pub fn primary_key(name: &str) -> String {
    format!("{}/{}.json", name, PRIMARY_RESULT)
}

/// 历史记录中的一条
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub status: String,
    pub summary: String,
    /// 去掉 `_run_info` 后的调用参数
    pub kwargs: Kwargs,
    pub is_primary: bool,
}

impl From<RunRecord> for HistoryEntry {
    fn from(record: RunRecord) -> Self {
        let is_primary = record.is_primary();
        let mut kwargs = record.kwargs;
        kwargs.remove("_run_info");
        Self {
            status: record.status,
            summary: record.summary,
            kwargs,
            is_primary,
        }
    }
}

/// 合并两次提交的输出：列表拼接，对象合并（新值覆盖），其余按字符串拼接
///
/// 非字符串值先渲染为 JSON 文本再拼接。
pub fn merge_output(old: Value, new: Value) -> Value {
    match (old, new) {
        (old, Value::Null) => old,
        (Value::Null, new) => new,
        (Value::Array(mut old), Value::Array(new)) => {
            old.extend(new);
            Value::Array(old)
        }
        (Value::Object(mut old), Value::Object(new)) => {
            old.extend(new);
            Value::Object(old)
        }
        (old, new) => Value::String(output_text(old) + &output_text(new)),
    }
}

fn output_text(value: Value) -> String {
    match value {
        Value::String(text) => text,
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_uuid_order_is_chronological() {
        let earlier = Utc.with_ymd_and_hms(2024, 1, 9, 23, 59, 59).unwrap();
        let later = Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap();
        let a = format_uuid(earlier);
        let b = format_uuid(later);
        assert!(a < b);
        assert_eq!(a, "2024-01-09T23:59:59.000000");
        assert_eq!(parse_uuid(&a), Some(earlier));
    }

    #[test]
    fn test_filename_to_datetime() {
        let key = "item_counts/2024-03-01T12:30:00.250000.json";
        let parsed = filename_to_datetime(key).unwrap();
        assert_eq!(format_uuid(parsed), "2024-03-01T12:30:00.250000");

        assert!(filename_to_datetime("item_counts/primary_result.json").is_none());
        assert!(filename_to_datetime("item_counts/action_records/2024-03-01T12:30:00").is_none());
    }

    #[test]
    fn test_statuses() {
        assert!(RunKind::Check.is_valid_status("WARN"));
        assert!(!RunKind::Check.is_valid_status("DONE"));
        assert!(RunKind::Action.is_valid_status("DONE"));
        assert_eq!(RunKind::Check.error_status(), "ERROR");
        assert_eq!(RunKind::Action.error_status(), "FAIL");
    }

    #[test]
    fn test_record_serialization() {
        let record: RunRecord = serde_json::from_value(json!({
            "name": "item_counts",
            "uuid": "2024-03-01T12:30:00.000000",
            "type": "check",
            "status": "PASS",
            "kwargs": {"primary": true, "uuid": "2024-03-01T12:30:00.000000"}
        }))
        .unwrap();
        assert!(record.is_primary());
        assert_eq!(
            record.storage_key(),
            "item_counts/2024-03-01T12:30:00.000000.json"
        );

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["type"], "check");
        assert!(value.get("output").is_none());
    }

    #[test]
    fn test_history_entry_strips_run_info() {
        let record: RunRecord = serde_json::from_value(json!({
            "name": "item_counts",
            "uuid": "2024-03-01T12:30:00.000000",
            "type": "check",
            "status": "WARN",
            "summary": "2 items missing",
            "kwargs": {"primary": false, "_run_info": {"run_id": "x"}}
        }))
        .unwrap();
        let entry = HistoryEntry::from(record);
        assert!(!entry.kwargs.contains_key("_run_info"));
        assert!(!entry.is_primary);
        assert_eq!(entry.summary, "2 items missing");
    }

    #[test]
    fn test_merge_output() {
        assert_eq!(merge_output(json!(["a"]), json!(["b"])), json!(["a", "b"]));
        assert_eq!(
            merge_output(json!({"k1": "v1", "k": 1}), json!({"k2": "v2", "k": 2})),
            json!({"k1": "v1", "k2": "v2", "k": 2})
        );
        assert_eq!(merge_output(json!("abc"), json!("def")), json!("abcdef"));
        assert_eq!(merge_output(json!(["a"]), Value::Null), json!(["a"]));
        assert_eq!(merge_output(json!(1), json!({"k": 1})), json!("1{\"k\":1}"));
        assert_eq!(merge_output(json!(1), json!(2)), json!("12"));
        assert_eq!(merge_output(json!(["a"]), json!("b")), json!("[\"a\"]b"));
        assert_eq!(merge_output(json!({"k": 1}), json!(["b"])), json!("{\"k\":1}[\"b\"]"));
    }
}
