pub mod memory;
pub mod s3;

pub use memory::MemoryStorage;
pub use s3::S3Storage;

use bytes::Bytes;
use std::sync::Arc;

/// 结果存储抽象接口
///
/// 所有方法都不返回错误：传输层失败会被记录日志并转换为 `None`/空结果，
/// 调用方统一把存储失败当作“不存在”处理。
#[async_trait::async_trait]
pub trait Storage: Send + Sync + std::fmt::Debug {
    /// 写入对象，成功时返回 `(key, body)`
    async fn put_object(&self, key: &str, body: Bytes) -> Option<(String, Bytes)>;

    /// 读取对象；不存在或出错时返回 `None`
    async fn get_object(&self, key: &str) -> Option<Bytes>;

    /// 列出指定前缀下的全部 key，顺序不保证
    async fn list_keys_with_prefix(&self, prefix: &str) -> Vec<String>;

    /// 列出全部 key
    async fn list_all_keys(&self) -> Vec<String> {
        self.list_keys_with_prefix("").await
    }

    /// 批量删除
    async fn delete_keys(&self, keys: &[String]);

    /// 健康检查
    async fn health_check(&self) -> bool;
}

pub type SharedStorage = Arc<dyn Storage>;
