use super::{CheckEntry, Kwargs};
use serde::{Deserialize, Serialize};

/// 检查队列中的消息体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    /// 目标环境
    pub environment: String,
    /// 同一次调度共享的运行ID
    pub run_id: String,
    /// `module/name`
    pub check_or_action: String,
    #[serde(default)]
    pub kwargs: Kwargs,
    #[serde(default)]
    pub dependency_ids: Vec<String>,
    /// 运行信息标记使用的条目ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl QueueMessage {
    pub fn from_entry(environment: &str, run_id: &str, entry: CheckEntry) -> Self {
        Self {
            environment: environment.to_string(),
            run_id: run_id.to_string(),
            check_or_action: entry.check_string,
            kwargs: entry.kwargs,
            dependency_ids: entry.dependency_ids,
            id: entry.id,
        }
    }

    /// 条目ID，默认为检查名
    pub fn entry_id(&self) -> &str {
        self.id
            .as_deref()
            .unwrap_or_else(|| super::check::short_name(&self.check_or_action))
    }
}

/// 注入到 kwargs 中的运行信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
    pub run_id: String,
    pub receipt: String,
    pub queue: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_wire_format() {
        let entry = CheckEntry::new("system_checks/result_freshness").with_dependencies(["reach"]);
        let message = QueueMessage::from_entry("dev", "2024-03-01T00:00:00.000000", entry);
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(
            value,
            json!({
                "environment": "dev",
                "run_id": "2024-03-01T00:00:00.000000",
                "check_or_action": "system_checks/result_freshness",
                "kwargs": {},
                "dependency_ids": ["reach"]
            })
        );
        assert_eq!(message.entry_id(), "result_freshness");

        let parsed: QueueMessage = serde_json::from_value(json!({
            "environment": "dev",
            "run_id": "r",
            "check_or_action": "a/b",
            "id": "custom"
        }))
        .unwrap();
        assert!(parsed.kwargs.is_empty());
        assert_eq!(parsed.entry_id(), "custom");
    }
}
