use super::Storage;
use bytes::Bytes;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

/// 进程内结果存储，用于测试和本地运行
#[derive(Debug, Default)]
pub struct MemoryStorage {
    objects: RwLock<BTreeMap<String, Bytes>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl Storage for MemoryStorage {
    async fn put_object(&self, key: &str, body: Bytes) -> Option<(String, Bytes)> {
        self.objects
            .write()
            .await
            .insert(key.to_string(), body.clone());
        Some((key.to_string(), body))
    }

    async fn get_object(&self, key: &str) -> Option<Bytes> {
        self.objects.read().await.get(key).cloned()
    }

    async fn list_keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.objects
            .read()
            .await
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect()
    }

    async fn delete_keys(&self, keys: &[String]) {
        let mut objects = self.objects.write().await;
        for key in keys {
            objects.remove(key);
        }
    }

    async fn health_check(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_list_delete() {
        let storage = MemoryStorage::new();
        assert!(storage.is_empty().await);

        let (key, _) = storage
            .put_object("check_a/2024-01-01T00:00:00.000000.json", Bytes::from_static(b"{}"))
            .await
            .unwrap();
        assert_eq!(key, "check_a/2024-01-01T00:00:00.000000.json");
        storage
            .put_object("check_ab/primary_result.json", Bytes::from_static(b"{}"))
            .await;
        storage
            .put_object("check_b/primary_result.json", Bytes::from_static(b"{}"))
            .await;

        // 前缀只匹配 check_a/ 下的 key
        let keys = storage.list_keys_with_prefix("check_a/").await;
        assert_eq!(keys, vec!["check_a/2024-01-01T00:00:00.000000.json"]);
        assert_eq!(storage.list_all_keys().await.len(), 3);

        assert!(storage.get_object("missing").await.is_none());

        storage.delete_keys(&keys).await;
        assert!(storage.list_keys_with_prefix("check_a/").await.is_empty());
        assert_eq!(storage.len().await, 2);
    }
}
