use super::Storage;
use crate::{
    config::StorageConfig,
    error::{AppError, AppResult},
};
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::{
    Client,
    config::Credentials,
    primitives::ByteStream,
    types::{BucketLocationConstraint, CreateBucketConfiguration, Delete, ObjectIdentifier},
};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// S3 单次 DeleteObjects 请求的 key 上限
const DELETE_BATCH_SIZE: usize = 1000;

/// 创建 S3 客户端，同一进程内的所有 bucket 共享
pub fn build_client(config: &StorageConfig) -> Arc<Client> {
    let credentials = Credentials::new(
        &config.access_key,
        &config.secret_key,
        None, // session token
        None, // expiration
        "check-runner",
    );

    let s3_config = aws_sdk_s3::Config::builder()
        .endpoint_url(&config.endpoint)
        .credentials_provider(credentials)
        .region(Region::new(config.region.clone()))
        .force_path_style(true) // MinIO需要路径样式
        .behavior_version(BehaviorVersion::latest())
        .build();

    Arc::new(Client::from_conf(s3_config))
}

/// 绑定到单个 bucket 的 S3 结果存储
#[derive(Debug, Clone)]
pub struct S3Storage {
    client: Arc<Client>,
    bucket: String,
    region: String,
    /// bucket 只在首次使用时确认/创建一次
    bucket_ready: Arc<OnceCell<()>>,
}

impl S3Storage {
    pub fn new(client: Arc<Client>, bucket: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            region: region.into(),
            bucket_ready: Arc::new(OnceCell::new()),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// 确保bucket存在，不存在则创建
    async fn ensure_bucket(&self) -> AppResult<()> {
        self.bucket_ready
            .get_or_try_init(|| async {
                match self.client.head_bucket().bucket(&self.bucket).send().await {
                    Ok(_) => {
                        tracing::debug!("Bucket '{}' 已存在", self.bucket);
                        Ok(())
                    }
                    Err(_) => {
                        tracing::info!("Bucket '{}' 不存在，正在创建", self.bucket);
                        self.create_bucket().await
                    }
                }
            })
            .await
            .map(|_| ())
    }

    /// 创建bucket
    async fn create_bucket(&self) -> AppResult<()> {
        let mut request = self.client.create_bucket().bucket(&self.bucket);

        // us-east-1 不接受显式的 location constraint
        if self.region != "us-east-1" {
            let create_bucket_config = CreateBucketConfiguration::builder()
                .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                .build();
            request = request.create_bucket_configuration(create_bucket_config);
        }

        match request.send().await {
            Ok(_) => {
                tracing::info!("成功创建bucket: {}", self.bucket);
                Ok(())
            }
            Err(e) => {
                let service_err = e.into_service_error();
                // 并发创建时另一个 worker 可能已经创建成功
                if service_err.is_bucket_already_owned_by_you() {
                    Ok(())
                } else {
                    Err(AppError::storage(format!(
                        "创建bucket {} 失败: {}",
                        self.bucket, service_err
                    )))
                }
            }
        }
    }

    async fn try_put(&self, key: &str, body: Bytes) -> AppResult<()> {
        self.ensure_bucket().await?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type("application/json")
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| AppError::storage(format!("写入对象失败: {}", e)))?;
        Ok(())
    }

    async fn try_get(&self, key: &str) -> AppResult<Option<Bytes>> {
        self.ensure_bucket().await?;
        let result = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(result) => result,
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_no_such_key() {
                    return Ok(None);
                }
                return Err(AppError::storage(format!("读取对象失败: {}", service_err)));
            }
        };

        let data = result
            .body
            .collect()
            .await
            .map_err(|e| AppError::storage(format!("读取对象数据失败: {}", e)))?;

        Ok(Some(data.into_bytes()))
    }

    async fn try_list(&self, prefix: &str) -> AppResult<Vec<String>> {
        self.ensure_bucket().await?;
        let mut keys = Vec::new();
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .into_paginator()
            .send();

        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| AppError::storage(format!("列出对象失败: {}", e)))?;
            keys.extend(
                page.contents()
                    .iter()
                    .filter_map(|object| object.key().map(str::to_string)),
            );
        }

        Ok(keys)
    }

    async fn try_delete(&self, keys: &[String]) -> AppResult<()> {
        self.ensure_bucket().await?;
        for chunk in keys.chunks(DELETE_BATCH_SIZE) {
            let objects = chunk
                .iter()
                .map(|key| ObjectIdentifier::builder().key(key).build())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| AppError::storage(format!("构建删除请求失败: {}", e)))?;

            let delete = Delete::builder()
                .set_objects(Some(objects))
                .quiet(true)
                .build()
                .map_err(|e| AppError::storage(format!("构建删除请求失败: {}", e)))?;

            self.client
                .delete_objects()
                .bucket(&self.bucket)
                .delete(delete)
                .send()
                .await
                .map_err(|e| AppError::storage(format!("批量删除失败: {}", e)))?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Storage for S3Storage {
    async fn put_object(&self, key: &str, body: Bytes) -> Option<(String, Bytes)> {
        match self.try_put(key, body.clone()).await {
            Ok(()) => Some((key.to_string(), body)),
            Err(e) => {
                tracing::warn!(bucket = %self.bucket, key, error = %e, "写入结果失败");
                None
            }
        }
    }

    async fn get_object(&self, key: &str) -> Option<Bytes> {
        match self.try_get(key).await {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(bucket = %self.bucket, key, error = %e, "读取结果失败");
                None
            }
        }
    }

    async fn list_keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        match self.try_list(prefix).await {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!(bucket = %self.bucket, prefix, error = %e, "列出结果失败");
                Vec::new()
            }
        }
    }

    async fn delete_keys(&self, keys: &[String]) {
        if keys.is_empty() {
            return;
        }
        if let Err(e) = self.try_delete(keys).await {
            tracing::warn!(bucket = %self.bucket, count = keys.len(), error = %e, "删除结果失败");
        }
    }

    async fn health_check(&self) -> bool {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => true,
            Err(e) => {
                tracing::error!("S3健康检查失败: {}", e);
                false
            }
        }
    }
}
