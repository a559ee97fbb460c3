// SPDX-License-Identifier: Apache-2.0
// Copyright 2026 Stasis Contributors

//! Remote checkpoint store client.
//!
//! Uploads snapshot archives with a three-phase multipart protocol: the
//! server dictates the part plan, the client uploads exactly that many
//! parts and completes the upload. A part that keeps failing aborts the
//! whole upload server-side. Downloads are single-stream GETs verified on
//! disk before returning. All requests carry the JWT bearer token from
//! `CEDANA_JWT_TOKEN` and the host identity from `CEDANA_CLIENT_ID`.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;

use crate::error::StoreError;

/// Per-part upload timeout.
const PART_TIMEOUT: Duration = Duration::from_secs(60);

/// Consecutive failures of one part before the upload is abandoned.
const MAX_PART_ATTEMPTS: u32 = 5;

const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Server-dictated upload plan.
#[derive(Debug, Clone, Deserialize)]
pub struct MultipartUpload {
    pub upload_id: String,
    pub part_size: u64,
    pub part_count: u64,
}

/// Client for the remote object service holding snapshot archives.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    http: reqwest::Client,
    base_url: String,
    token: String,
    client_id: String,
}

impl CheckpointStore {
    pub fn new(server_url: &str) -> Result<Self, StoreError> {
        let token = std::env::var("CEDANA_JWT_TOKEN").map_err(|_| StoreError::MissingToken)?;
        let client_id = std::env::var("CEDANA_CLIENT_ID").unwrap_or_default();
        Ok(Self {
            http: reqwest::Client::new(),
            base_url: server_url.trim_end_matches('/').to_string(),
            token,
            client_id,
        })
    }

    /// Remote URI a finished upload is addressable at.
    pub fn checkpoint_uri(&self, upload_id: &str) -> String {
        format!("{}/checkpoints/{}", self.base_url, upload_id)
    }

    /// Whether a checkpoint path names a remote object rather than a local
    /// file.
    pub fn is_remote(path: &str) -> bool {
        path.starts_with("http://") || path.starts_with("https://")
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .bearer_auth(&self.token)
            .header("x-cedana-client-id", &self.client_id)
    }

    fn check_status(
        operation: &'static str,
        status: StatusCode,
    ) -> Result<(), StoreError> {
        if status == StatusCode::UNAUTHORIZED {
            return Err(StoreError::TokenExpired);
        }
        if !status.is_success() {
            return Err(StoreError::Status {
                operation,
                status: status.as_u16(),
            });
        }
        Ok(())
    }

    /// Phase one: announce the archive size, receive the part plan.
    pub async fn create_multipart(&self, size: u64) -> Result<MultipartUpload, StoreError> {
        let url = format!("{}/checkpoints/uploads", self.base_url);
        let resp = self
            .request(reqwest::Method::POST, &url)
            .json(&serde_json::json!({ "size": size }))
            .send()
            .await?;
        Self::check_status("create multipart upload", resp.status())?;
        let plan: MultipartUpload = resp.json().await?;
        Ok(plan)
    }

    async fn put_part(
        &self,
        upload_id: &str,
        index: u64,
        body: Vec<u8>,
    ) -> Result<(), StoreError> {
        let url = format!(
            "{}/checkpoints/uploads/{}/parts/{}",
            self.base_url, upload_id, index
        );
        let resp = self
            .request(reqwest::Method::PUT, &url)
            .timeout(PART_TIMEOUT)
            .body(body)
            .send()
            .await?;
        Self::check_status("upload part", resp.status())
    }

    async fn complete(&self, upload_id: &str) -> Result<(), StoreError> {
        let url = format!(
            "{}/checkpoints/uploads/{}/complete",
            self.base_url, upload_id
        );
        let resp = self.request(reqwest::Method::POST, &url).send().await?;
        Self::check_status("complete multipart upload", resp.status())
    }

    async fn abort(&self, upload_id: &str) {
        let url = format!("{}/checkpoints/uploads/{}", self.base_url, upload_id);
        match self.request(reqwest::Method::DELETE, &url).send().await {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => {
                tracing::warn!(upload_id, status = %resp.status(), "abort request rejected")
            }
            Err(e) => tracing::warn!(upload_id, error = %e, "could not abort upload"),
        }
    }

    /// Upload an archive in the exact part plan the server dictates.
    /// Returns the upload id of the completed object. Cancellation takes
    /// effect at the next part boundary.
    pub async fn upload_checkpoint(
        &self,
        archive: &Path,
        cancel: &CancellationToken,
    ) -> Result<String, StoreError> {
        let read_err = |source| StoreError::ReadArchive {
            path: archive.to_path_buf(),
            source,
        };

        let total = tokio::fs::metadata(archive).await.map_err(read_err)?.len();
        let plan = self.create_multipart(total).await?;

        let expected = total.div_ceil(plan.part_size.max(1));
        if plan.part_size == 0 || plan.part_count != expected {
            return Err(StoreError::BadPartPlan {
                part_count: plan.part_count,
                part_size: plan.part_size,
                total,
            });
        }

        tracing::info!(
            upload_id = plan.upload_id.as_str(),
            parts = plan.part_count,
            part_size = plan.part_size,
            "starting multipart upload"
        );

        let mut file = tokio::fs::File::open(archive).await.map_err(read_err)?;
        for part in 0..plan.part_count {
            if cancel.is_cancelled() {
                self.abort(&plan.upload_id).await;
                return Err(StoreError::Cancelled);
            }

            let offset = part * plan.part_size;
            let len = plan.part_size.min(total - offset) as usize;
            file.seek(SeekFrom::Start(offset)).await.map_err(read_err)?;
            let mut buf = vec![0u8; len];
            file.read_exact(&mut buf).await.map_err(read_err)?;

            let index = part + 1;
            let mut attempts = 0u32;
            loop {
                attempts += 1;
                match self.put_part(&plan.upload_id, index, buf.clone()).await {
                    Ok(()) => break,
                    Err(e @ StoreError::TokenExpired) => {
                        self.abort(&plan.upload_id).await;
                        return Err(e);
                    }
                    Err(e) if attempts >= MAX_PART_ATTEMPTS => {
                        tracing::error!(index, error = %e, "part failed, abandoning upload");
                        self.abort(&plan.upload_id).await;
                        return Err(StoreError::PartFailed {
                            index,
                            attempts,
                            upload_id: plan.upload_id.clone(),
                        });
                    }
                    Err(e) => {
                        let backoff = BACKOFF_CAP
                            .min(BACKOFF_BASE * 2u32.saturating_pow(attempts - 1));
                        tracing::warn!(index, attempt = attempts, error = %e, "part failed, retrying");
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }

        self.complete(&plan.upload_id).await?;
        tracing::info!(upload_id = plan.upload_id.as_str(), "upload complete");
        Ok(plan.upload_id)
    }

    /// Fetch a checkpoint object to `dest` and verify it landed.
    pub async fn download_checkpoint(
        &self,
        uri: &str,
        dest: &Path,
    ) -> Result<PathBuf, StoreError> {
        let resp = self.request(reqwest::Method::GET, uri).send().await?;
        Self::check_status("download checkpoint", resp.status())?;
        let bytes = resp.bytes().await?;
        tokio::fs::write(dest, &bytes)
            .await
            .map_err(|source| StoreError::WriteDownload {
                path: dest.to_path_buf(),
                source,
            })?;

        if !dest.exists() {
            return Err(StoreError::NotDownloaded {
                path: dest.to_path_buf(),
            });
        }
        tracing::info!(uri, dest = %dest.display(), "downloaded checkpoint");
        Ok(dest.to_path_buf())
    }
}
