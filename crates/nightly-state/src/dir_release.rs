//! Local directory release channel.
//!
//! Mirrors the remote channel's semantics on disk: `<root>/<tag>/<asset>`,
//! same-named assets are overwritten. Used for dry runs and local testing of
//! the packaging flow; the token is accepted but not checked.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::StorageError;
use crate::storage_traits::*;

#[derive(Debug, Clone)]
pub struct DirReleaseChannel {
    root: PathBuf,
}

impl DirReleaseChannel {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl ReleaseChannel for DirReleaseChannel {
    async fn publish(
        &self,
        tag: &str,
        assets: &[ReleaseAsset],
        _token: &SecretToken,
    ) -> StorageResult<PublishReport> {
        let dir = self.root.join(tag);
        tokio::fs::create_dir_all(&dir).await?;

        let mut uploads = Vec::with_capacity(assets.len());
        for asset in assets {
            let dest = dir.join(&asset.name);
            let tmp = dir.join(format!(".{}.partial", asset.name));
            let copied = async {
                tokio::fs::copy(&asset.path, &tmp).await?;
                tokio::fs::rename(&tmp, &dest).await
            }
            .await;
            uploads.push(match copied {
                Ok(()) => UploadOutcome::ok(&asset.name),
                Err(e) => UploadOutcome::failed(&asset.name, e.to_string()),
            });
        }

        Ok(PublishReport {
            tag: tag.to_string(),
            uploads,
        })
    }

    async fn list_assets(&self, tag: &str, _token: &SecretToken) -> StorageResult<Vec<String>> {
        let dir = self.root.join(tag);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::ReleaseNotFound {
                    tag: tag.to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with('.') {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}
