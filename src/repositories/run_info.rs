use crate::storage::SharedStorage;
use bytes::Bytes;

/// 运行信息标记：`<run_id>/<entry_id>`，值为该条目结果的存储 key
///
/// 同一次调度中的后续条目通过这些标记判断依赖是否已经完成。
#[derive(Debug, Clone)]
pub struct RunInfoRepository {
    storage: SharedStorage,
}

impl RunInfoRepository {
    pub fn new(storage: SharedStorage) -> Self {
        Self { storage }
    }

    fn marker_key(run_id: &str, entry_id: &str) -> String {
        format!("{}/{}", run_id, entry_id)
    }

    /// 记录条目已完成
    pub async fn record_completion(&self, run_id: &str, entry_id: &str, result_key: &str) {
        let key = Self::marker_key(run_id, entry_id);
        if self
            .storage
            .put_object(&key, Bytes::from(result_key.to_string()))
            .await
            .is_none()
        {
            tracing::warn!(key = %key, "运行信息写入失败");
        }
    }

    pub async fn is_complete(&self, run_id: &str, entry_id: &str) -> bool {
        self.storage
            .get_object(&Self::marker_key(run_id, entry_id))
            .await
            .is_some()
    }

    /// 返回尚未完成的依赖
    pub async fn unmet_dependencies(&self, run_id: &str, dependency_ids: &[String]) -> Vec<String> {
        if dependency_ids.is_empty() {
            return Vec::new();
        }
        let completed = self.collect_run_info(run_id).await;
        dependency_ids
            .iter()
            .filter(|dep| !completed.iter().any(|done| done == *dep))
            .cloned()
            .collect()
    }

    /// 某次运行中已完成的条目ID
    pub async fn collect_run_info(&self, run_id: &str) -> Vec<String> {
        let prefix = format!("{}/", run_id);
        let mut ids: Vec<String> = self
            .storage
            .list_keys_with_prefix(&prefix)
            .await
            .into_iter()
            .filter_map(|key| key.strip_prefix(&prefix).map(str::to_string))
            .collect();
        ids.sort();
        ids
    }
}
