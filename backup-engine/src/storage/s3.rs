//! S3 and S3-compatible object storage (MinIO, Wasabi, R2, ...).

use super::{check_key, join_key, BackendKind, BackendStatus, RemoteFileInfo, StorageBackend};
use crate::config::StorageBackendConfig;
use crate::utils::errors::{EngineError, Result};
use crate::utils::fs::partial_path;
use async_trait::async_trait;
use aws_config::Region;
use aws_credential_types::Credentials;
use aws_sdk_s3::{
    config::Builder as S3ConfigBuilder, error::DisplayErrorContext, primitives::ByteStream,
    Client as S3Client,
};
use chrono::{DateTime, Utc};
use std::path::Path;
use tracing::debug;

pub struct S3Backend {
    name: String,
    client: S3Client,
    bucket: String,
    prefix: Option<String>,
}

impl S3Backend {
    pub async fn from_config(name: String, config: &StorageBackendConfig) -> Result<Self> {
        let StorageBackendConfig::S3 {
            bucket,
            region,
            endpoint,
            access_key_id,
            secret_access_key,
            session_token,
            prefix,
            force_path_style,
            ..
        } = config
        else {
            return Err(EngineError::Configuration(
                "Expected S3 backend configuration".into(),
            ));
        };

        let mut aws_config_builder = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(region.clone()));

        if let (Some(access_key_id), Some(secret_access_key)) = (access_key_id, secret_access_key)
        {
            let creds = Credentials::new(
                access_key_id,
                secret_access_key,
                session_token.clone(),
                None,
                "backup-engine",
            );
            aws_config_builder = aws_config_builder.credentials_provider(creds);
        }

        let aws_config = aws_config_builder.load().await;
        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);
        if let Some(endpoint_url) = endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }
        if *force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }
        let client = S3Client::from_conf(s3_config_builder.build());

        debug!(backend = %name, bucket = %bucket, region = %region, "Created S3 backend");
        Ok(Self {
            name,
            client,
            bucket: bucket.clone(),
            prefix: prefix.clone(),
        })
    }

    fn full_key(&self, key: &str) -> Result<String> {
        check_key(&self.name, key)?;
        Ok(join_key(self.prefix.as_deref(), key))
    }

    fn strip_prefix<'a>(&self, key: &'a str) -> &'a str {
        match self.prefix.as_deref().map(|p| p.trim_matches('/')) {
            Some(prefix) if !prefix.is_empty() => key
                .strip_prefix(prefix)
                .map(|k| k.trim_start_matches('/'))
                .unwrap_or(key),
            _ => key,
        }
    }

    fn err(&self, action: &str, key: &str, e: impl std::error::Error) -> EngineError {
        EngineError::storage(
            &self.name,
            format!("{} '{}': {}", action, key, DisplayErrorContext(e)),
        )
    }

    async fn list_with_sizes(&self, prefix: &str) -> Result<Vec<(String, u64)>> {
        let full_prefix = join_key(self.prefix.as_deref(), prefix);
        let mut objects = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&full_prefix)
                .set_continuation_token(continuation_token.take())
                .send()
                .await
                .map_err(|e| self.err("list", prefix, e))?;

            for object in response.contents() {
                if let Some(key) = object.key() {
                    let size = object.size().unwrap_or(0).max(0) as u64;
                    objects.push((self.strip_prefix(key).to_string(), size));
                }
            }

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation_token = Some(token.to_string());
                }
                _ => break,
            }
        }

        objects.sort();
        Ok(objects)
    }
}

#[async_trait]
impl StorageBackend for S3Backend {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        BackendKind::S3
    }

    async fn upload(&self, local_path: &Path, key: &str) -> Result<()> {
        let full_key = self.full_key(key)?;
        let body = ByteStream::from_path(local_path)
            .await
            .map_err(|e| self.err("read", key, e))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .body(body)
            .send()
            .await
            .map_err(|e| self.err("upload", key, e))?;

        debug!(backend = %self.name, key = %full_key, "Uploaded object");
        Ok(())
    }

    async fn download(&self, key: &str, local_path: &Path) -> Result<()> {
        let full_key = self.full_key(key)?;
        let response = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) if e.as_service_error().map(|se| se.is_no_such_key()).unwrap_or(false) => {
                return Err(EngineError::NotFound(format!("{}: {}", self.name, key)));
            }
            Err(e) => return Err(self.err("download", key, e)),
        };

        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let staged = partial_path(local_path);
        let mut reader = response.body.into_async_read();
        let mut file = tokio::fs::File::create(&staged).await?;
        let copied = tokio::io::copy(&mut reader, &mut file).await;
        drop(file);
        if let Err(e) = copied {
            let _ = tokio::fs::remove_file(&staged).await;
            return Err(self.err("download", key, e));
        }
        tokio::fs::rename(&staged, local_path).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        if !self.exists(key).await? {
            return Ok(false);
        }
        let full_key = self.full_key(key)?;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
            .map_err(|e| self.err("delete", key, e))?;
        Ok(true)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .list_with_sizes(prefix)
            .await?
            .into_iter()
            .map(|(key, _)| key)
            .collect())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.stat(key).await?.is_some())
    }

    async fn stat(&self, key: &str) -> Result<Option<RemoteFileInfo>> {
        let full_key = self.full_key(key)?;
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
        {
            Ok(response) => Ok(Some(RemoteFileInfo {
                key: key.to_string(),
                size: response.content_length().unwrap_or(0).max(0) as u64,
                modified_at: response
                    .last_modified()
                    .and_then(|dt| DateTime::<Utc>::from_timestamp(dt.secs(), 0)),
            })),
            Err(e) if e.as_service_error().map(|se| se.is_not_found()).unwrap_or(false) => {
                Ok(None)
            }
            Err(e) => Err(self.err("stat", key, e)),
        }
    }

    async fn info(&self) -> BackendStatus {
        if let Err(e) = self.client.head_bucket().bucket(&self.bucket).send().await {
            return BackendStatus::unreachable(
                &self.name,
                self.kind(),
                DisplayErrorContext(e).to_string(),
            );
        }
        match self.list_with_sizes("").await {
            Ok(objects) => BackendStatus {
                name: self.name.clone(),
                kind: self.kind(),
                reachable: true,
                object_count: Some(objects.len() as u64),
                total_size: Some(objects.iter().map(|(_, size)| size).sum()),
                free_space: None,
                error: None,
            },
            Err(e) => BackendStatus::unreachable(&self.name, self.kind(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_prefix_is_applied_and_stripped() -> Result<()> {
        let config = StorageBackendConfig::S3 {
            name: None,
            bucket: "bucket".into(),
            region: "us-east-1".into(),
            endpoint: Some("http://127.0.0.1:9".into()),
            access_key_id: Some("ak".into()),
            secret_access_key: Some("sk".into()),
            session_token: None,
            prefix: Some("engine/".into()),
            force_path_style: true,
        };
        let backend = S3Backend::from_config(config.name(), &config).await?;

        assert_eq!(backend.name(), "s3:bucket");
        assert_eq!(backend.full_key("database/full/a.db")?, "engine/database/full/a.db");
        assert_eq!(backend.strip_prefix("engine/database/full/a.db"), "database/full/a.db");
        assert!(backend.full_key("../escape").is_err());
        Ok(())
    }
}
