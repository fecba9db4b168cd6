//! 厂商文件服务 - 业务能力层
//!
//! 视频和 PDF 太大，不能内联进消息，先上传到厂商的 `/files` 接口，
//! 等文件处理完成后在消息里用文件 ID 引用。

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info};

use super::ai_dispatch::endpoint;
use crate::error::UpstreamError;
use crate::models::ProviderConfig;

#[derive(Debug, Deserialize)]
struct FileObject {
    id: String,
    #[serde(default)]
    status: Option<String>,
}

/// 文件处理状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileState {
    Ready,
    Processing,
    Failed,
}

fn file_state(status: Option<&str>) -> FileState {
    match status {
        None | Some("active") | Some("processed") | Some("uploaded") => FileState::Ready,
        Some("failed") | Some("error") => FileState::Failed,
        Some(_) => FileState::Processing,
    }
}

/// 厂商文件上传器
pub struct FileUploader<'a> {
    http: &'a reqwest::Client,
    poll_interval: Duration,
    max_polls: usize,
}

impl<'a> FileUploader<'a> {
    pub fn new(http: &'a reqwest::Client) -> Self {
        Self {
            http,
            poll_interval: Duration::from_secs(2),
            max_polls: 60,
        }
    }

    /// 上传文件并等待处理完成，返回文件 ID
    pub async fn upload(&self, path: &Path, config: &ProviderConfig) -> Result<String, UpstreamError> {
        let upstream = |msg: String| UpstreamError::new(&config.provider_name, msg);

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "upload.bin".to_string());
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| upstream(format!("读取待上传文件失败 ({}): {}", path.display(), e)))?;

        info!("📤 上传文件 {} ({} 字节) 到 [{}]", file_name, bytes.len(), config.provider_name);

        let form = reqwest::multipart::Form::new()
            .text("purpose", "user_data")
            .part("file", reqwest::multipart::Part::bytes(bytes).file_name(file_name.clone()));

        let response = self
            .http
            .post(endpoint(&config.base_url, "files"))
            .bearer_auth(&config.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| upstream(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(upstream(format!("文件上传失败 HTTP {}: {}", status.as_u16(), text)));
        }
        let uploaded: FileObject = response.json().await.map_err(|e| upstream(e.to_string()))?;

        self.wait_until_ready(uploaded, config).await
    }

    async fn wait_until_ready(
        &self,
        mut file: FileObject,
        config: &ProviderConfig,
    ) -> Result<String, UpstreamError> {
        for attempt in 0..self.max_polls {
            match file_state(file.status.as_deref()) {
                FileState::Ready => {
                    debug!("文件 {} 已就绪", file.id);
                    return Ok(file.id);
                }
                FileState::Failed => {
                    return Err(UpstreamError::new(
                        &config.provider_name,
                        format!("文件 {} 处理失败", file.id),
                    ));
                }
                FileState::Processing => {
                    debug!("文件 {} 处理中 (第 {} 次查询)", file.id, attempt + 1);
                    tokio::time::sleep(self.poll_interval).await;
                }
            }

            let url = endpoint(&config.base_url, &format!("files/{}", file.id));
            file = self
                .http
                .get(&url)
                .bearer_auth(&config.api_key)
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|e| UpstreamError::new(&config.provider_name, e.to_string()))?
                .json()
                .await
                .map_err(|e| UpstreamError::new(&config.provider_name, e.to_string()))?;
        }

        Err(UpstreamError::new(
            &config.provider_name,
            format!("文件 {} 处理超时", file.id),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_state_mapping() {
        assert_eq!(file_state(None), FileState::Ready);
        assert_eq!(file_state(Some("active")), FileState::Ready);
        assert_eq!(file_state(Some("processing")), FileState::Processing);
        assert_eq!(file_state(Some("failed")), FileState::Failed);
    }

    #[test]
    fn test_file_object_tolerates_missing_status() {
        let obj: FileObject = serde_json::from_str(r#"{"id":"file-abc","bytes":12}"#).unwrap();
        assert_eq!(obj.id, "file-abc");
        assert!(obj.status.is_none());
    }
}
