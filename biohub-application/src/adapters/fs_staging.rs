use crate::error::{AppError, AppResult};
use crate::ports::ImportStaging;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// 基于本地文件系统的暂存区：`<root>/<workspace_id>` 为导入基础目录，
/// 暂存时把导入源目录整体复制进去
#[derive(Clone, Debug)]
pub struct FsImportStaging {
    root: PathBuf,
}

impl FsImportStaging {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn base_dir(&self, workspace_id: &str) -> AppResult<PathBuf> {
        let invalid = workspace_id.is_empty()
            || workspace_id == "."
            || workspace_id == ".."
            || workspace_id.contains(['/', '\\']);
        if invalid {
            return Err(AppError::Validation(format!(
                "workspace id {workspace_id:?} is not a valid directory name"
            )));
        }
        Ok(self.root.join(workspace_id))
    }
}

#[async_trait]
impl ImportStaging for FsImportStaging {
    async fn stage(&self, workspace_id: &str, storage: &str) -> AppResult<PathBuf> {
        let source = PathBuf::from(storage);
        let is_dir = match fs::metadata(&source).await {
            Ok(meta) => meta.is_dir(),
            Err(err) if err.kind() == ErrorKind::NotFound => false,
            Err(err) => return Err(err.into()),
        };
        if !is_dir {
            return Err(AppError::NotFound(format!("import source {storage}")));
        }

        let base_dir = self.base_dir(workspace_id)?;
        fs::create_dir_all(&base_dir).await?;
        let copied = copy_tree(&source, &base_dir).await?;
        debug!(workspace_id, base_dir = %base_dir.display(), copied, "import staged");
        Ok(base_dir)
    }

    async fn cleanup(&self, import_base_dir: &Path) -> AppResult<()> {
        match fs::remove_dir_all(import_base_dir).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// 复制目录树，返回复制的文件数
async fn copy_tree(from: &Path, to: &Path) -> AppResult<usize> {
    let mut pending = vec![(from.to_path_buf(), to.to_path_buf())];
    let mut copied = 0;

    while let Some((src, dst)) = pending.pop() {
        fs::create_dir_all(&dst).await?;
        let mut entries = fs::read_dir(&src).await?;
        while let Some(entry) = entries.next_entry().await? {
            let target = dst.join(entry.file_name());
            if entry.file_type().await?.is_dir() {
                pending.push((entry.path(), target));
            } else {
                fs::copy(entry.path(), &target).await?;
                copied += 1;
            }
        }
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("biohub-staging-{name}-{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn stage_copies_source_tree_and_cleanup_removes_it() {
        let source = scratch("source");
        fs::create_dir_all(source.join("notebooks")).await.unwrap();
        fs::write(source.join("manifest.json"), b"{}").await.unwrap();
        fs::write(source.join("notebooks/qc.ipynb"), b"{}").await.unwrap();

        let staging = FsImportStaging::new(scratch("root"));
        let base = staging
            .stage("w1", source.to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(base, staging.root().join("w1"));
        assert!(fs::metadata(base.join("notebooks/qc.ipynb")).await.is_ok());

        // 再次暂存得到同一目录
        let again = staging
            .stage("w1", source.to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(again, base);

        staging.cleanup(&base).await.unwrap();
        assert!(fs::metadata(&base).await.is_err());
        staging.cleanup(&base).await.unwrap();

        fs::remove_dir_all(&source).await.unwrap();
        let _ = fs::remove_dir_all(staging.root()).await;
    }

    #[tokio::test]
    async fn missing_source_is_not_found() {
        let staging = FsImportStaging::new(scratch("root"));
        let err = staging
            .stage("w1", "/definitely/not/here")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn path_like_workspace_ids_are_rejected() {
        let source = scratch("source");
        fs::create_dir_all(&source).await.unwrap();
        let staging = FsImportStaging::new(scratch("root"));

        let err = staging
            .stage("../escape", source.to_str().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        fs::remove_dir_all(&source).await.unwrap();
    }
}
