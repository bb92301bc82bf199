//! Object Store Gateway.
//!
//! Uniform put/get/list/delete/presign over a namespaced bucket. The gateway
//! never interprets contents beyond the JSON helpers; artifact layout is the
//! stages' business. [`S3Store`] talks to any S3-compatible backend (MinIO
//! included); [`MemoryStore`] backs tests and local runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use tracing::{info, warn};

use crate::config::StoreConfig;
use crate::error::{Error, Result};

/// `put` retries on transient backend errors; reads and deletes surface
/// errors to the caller unretried.
const PUT_ATTEMPTS: u32 = 3;
const PUT_RETRY_PAUSE: Duration = Duration::from_secs(1);

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` at `path`, returning the path. Retries transient backend
    /// failures internally.
    async fn put(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
        user_metadata: HashMap<String, String>,
    ) -> Result<String>;

    /// Fetch the object at `path`; `Ok(None)` when it does not exist.
    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>>;

    /// All object paths under `prefix`, lexicographically ordered.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    async fn delete(&self, path: &str) -> Result<bool>;

    /// Time-limited GET URL for `path`.
    async fn presign(&self, path: &str, ttl: Duration) -> Result<String>;

    async fn save_json(&self, path: &str, value: &serde_json::Value) -> Result<String> {
        let bytes = serde_json::to_vec_pretty(value)?;
        self.put(path, bytes, "application/json", HashMap::new())
            .await
    }

    async fn get_json(&self, path: &str) -> Result<Option<serde_json::Value>> {
        match self.get(path).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

/// S3-compatible gateway. Path-style addressing so MinIO-style endpoints work
/// without virtual-host DNS.
pub struct S3Store {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3Store {
    /// Build the client and make sure the bucket exists.
    pub async fn connect(cfg: &StoreConfig) -> Result<Self> {
        if cfg.endpoint.trim().is_empty() {
            return Err(Error::Validation("STORE_ENDPOINT must not be empty".into()));
        }

        let scheme = if cfg.secure { "https" } else { "http" };
        let endpoint = format!("{scheme}://{}", cfg.endpoint);
        let credentials = Credentials::new(
            cfg.access_key.clone(),
            cfg.secret_key.clone(),
            None,
            None,
            "transom",
        );

        let sdk_config = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .endpoint_url(endpoint)
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();

        let store = Self {
            client: aws_sdk_s3::Client::from_conf(sdk_config),
            bucket: cfg.bucket.clone(),
        };
        store.ensure_bucket().await?;
        Ok(store)
    }

    async fn ensure_bucket(&self) -> Result<()> {
        let exists = self
            .client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .is_ok();
        if exists {
            return Ok(());
        }

        match self.client.create_bucket().bucket(&self.bucket).send().await {
            Ok(_) => {
                info!(bucket = %self.bucket, "created bucket");
                Ok(())
            }
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_bucket_already_owned_by_you()
                    || service_err.is_bucket_already_exists()
                {
                    Ok(())
                } else {
                    Err(Error::Storage(format!(
                        "creating bucket {}: {service_err}",
                        self.bucket
                    )))
                }
            }
        }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
        user_metadata: HashMap<String, String>,
    ) -> Result<String> {
        let mut last_err = None;

        for attempt in 1..=PUT_ATTEMPTS {
            // A fresh body each attempt restarts the upload from offset 0.
            let body = ByteStream::from(bytes.clone());
            let mut req = self
                .client
                .put_object()
                .bucket(&self.bucket)
                .key(path)
                .content_type(content_type)
                .body(body);
            for (key, value) in &user_metadata {
                req = req.metadata(key, value);
            }

            match req.send().await {
                Ok(_) => return Ok(path.to_owned()),
                Err(err) => {
                    warn!(%path, attempt, error = %err, "put failed");
                    last_err = Some(err);
                    if attempt < PUT_ATTEMPTS {
                        tokio::time::sleep(PUT_RETRY_PAUSE).await;
                    }
                }
            }
        }

        Err(Error::Storage(format!(
            "put {path} failed after {PUT_ATTEMPTS} attempts: {}",
            last_err.expect("at least one attempt ran")
        )))
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let out = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(path)
            .send()
            .await;

        match out {
            Ok(obj) => {
                let data = obj
                    .body
                    .collect()
                    .await
                    .map_err(|err| Error::Storage(format!("reading {path}: {err}")))?;
                Ok(Some(data.into_bytes().to_vec()))
            }
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(Error::Storage(format!("get {path}: {service_err}")))
                }
            }
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut paths = Vec::new();
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .into_paginator()
            .send();

        while let Some(page) = pages.next().await {
            let page = page.map_err(|err| Error::Storage(format!("list {prefix}: {err}")))?;
            for object in page.contents() {
                if let Some(key) = object.key() {
                    paths.push(key.to_owned());
                }
            }
        }

        paths.sort();
        Ok(paths)
    }

    async fn delete(&self, path: &str) -> Result<bool> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(path)
            .send()
            .await
            .map_err(|err| Error::Storage(format!("delete {path}: {err}")))?;
        Ok(true)
    }

    async fn presign(&self, path: &str, ttl: Duration) -> Result<String> {
        let presigning = PresigningConfig::expires_in(ttl)
            .map_err(|err| Error::Storage(format!("presign config: {err}")))?;
        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(path)
            .presigned(presigning)
            .await
            .map_err(|err| Error::Storage(format!("presign {path}: {err}")))?;
        Ok(presigned.uri().to_string())
    }
}

#[derive(Debug, Clone)]
struct StoredObject {
    bytes: Vec<u8>,
    content_type: String,
}

/// In-memory gateway for tests and local runs. Keys are kept sorted, so
/// `list` has the same ordering guarantees as the S3 backend.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<String, StoredObject>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Content type recorded for `path`, when the object exists.
    pub fn content_type(&self, path: &str) -> Option<String> {
        self.objects
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(path)
            .map(|obj| obj.content_type.clone())
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn put(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
        _user_metadata: HashMap<String, String>,
    ) -> Result<String> {
        let mut objects = self.objects.lock().unwrap_or_else(|p| p.into_inner());
        objects.insert(
            path.to_owned(),
            StoredObject {
                bytes,
                content_type: content_type.to_owned(),
            },
        );
        Ok(path.to_owned())
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let objects = self.objects.lock().unwrap_or_else(|p| p.into_inner());
        Ok(objects.get(path).map(|obj| obj.bytes.clone()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let objects = self.objects.lock().unwrap_or_else(|p| p.into_inner());
        Ok(objects
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn delete(&self, path: &str) -> Result<bool> {
        let mut objects = self.objects.lock().unwrap_or_else(|p| p.into_inner());
        Ok(objects.remove(path).is_some())
    }

    async fn presign(&self, path: &str, ttl: Duration) -> Result<String> {
        Ok(format!("memory://{path}?expires_in={}", ttl.as_secs()))
    }
}
