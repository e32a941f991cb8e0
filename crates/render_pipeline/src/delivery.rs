use crate::job::RequesterId;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Hands finished artifacts and status messages back to the requester.
#[async_trait]
pub trait Delivery: Send + Sync {
    /// Short status message, e.g. "Your poster is processing now".
    async fn notify(&self, recipient: RequesterId, text: &str) -> Result<()>;

    /// Sends the preview (captioned `"{caption} (preview)"`) followed by the
    /// full-size artifact. Both files are consumed: they must not remain at
    /// their original paths once this returns `Ok`.
    async fn deliver(&self, recipient: RequesterId, artifact: &Path, preview: &Path, caption: &str) -> Result<()>;
}

/// File-system mailbox: one directory per recipient holding delivered files
/// and a `messages.log` of notifications.
#[derive(Debug, Clone)]
pub struct OutboxDelivery {
    root: PathBuf,
}

impl OutboxDelivery {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn mailbox(&self, recipient: RequesterId) -> PathBuf {
        self.root.join(recipient.to_string())
    }

    async fn ensure_mailbox(&self, recipient: RequesterId) -> Result<PathBuf> {
        let dir = self.mailbox(recipient);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create mailbox {}", dir.display()))?;
        Ok(dir)
    }

    async fn append_log(&self, dir: &Path, line: &str) -> Result<()> {
        let path = dir.join("messages.log");
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("failed to open {}", path.display()))?;
        file.write_all(format!("{line}\n").as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl Delivery for OutboxDelivery {
    async fn notify(&self, recipient: RequesterId, text: &str) -> Result<()> {
        let dir = self.ensure_mailbox(recipient).await?;
        self.append_log(&dir, text).await
    }

    async fn deliver(&self, recipient: RequesterId, artifact: &Path, preview: &Path, caption: &str) -> Result<()> {
        let dir = self.ensure_mailbox(recipient).await?;

        let preview_dst = move_into(preview, &dir).await?;
        self.append_log(&dir, &format!("{caption} (preview): {}", file_name(&preview_dst)))
            .await?;

        let artifact_dst = move_into(artifact, &dir).await?;
        self.append_log(&dir, &format!("{caption}: {}", file_name(&artifact_dst)))
            .await?;

        tracing::info!(
            recipient = recipient.0,
            artifact = %artifact_dst.display(),
            preview = %preview_dst.display(),
            "Delivered to outbox"
        );
        Ok(())
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Moves `src` into `dir`, copying when a rename crosses file systems.
async fn move_into(src: &Path, dir: &Path) -> Result<PathBuf> {
    let name = src
        .file_name()
        .with_context(|| format!("{} has no file name", src.display()))?;
    let dst = dir.join(name);

    if fs::rename(src, &dst).await.is_err() {
        fs::copy(src, &dst)
            .await
            .with_context(|| format!("failed to copy {} to {}", src.display(), dst.display()))?;
        fs::remove_file(src)
            .await
            .with_context(|| format!("failed to remove {}", src.display()))?;
    }
    Ok(dst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deliver_moves_both_files_into_the_mailbox() {
        let work = tempfile::tempdir().unwrap();
        let outbox = tempfile::tempdir().unwrap();
        let artifact = work.path().join("7_1_Tokyo_coral.png");
        let preview = work.path().join("prev_7_1_Tokyo_coral.png");
        std::fs::write(&artifact, b"full").unwrap();
        std::fs::write(&preview, b"small").unwrap();

        let delivery = OutboxDelivery::new(outbox.path());
        delivery.notify(RequesterId(7), "Your poster is processing now").await.unwrap();
        delivery
            .deliver(RequesterId(7), &artifact, &preview, "Tokyo")
            .await
            .unwrap();

        assert!(!artifact.exists());
        assert!(!preview.exists());
        let mailbox = delivery.mailbox(RequesterId(7));
        assert_eq!(std::fs::read(mailbox.join("7_1_Tokyo_coral.png")).unwrap(), b"full");
        assert_eq!(std::fs::read(mailbox.join("prev_7_1_Tokyo_coral.png")).unwrap(), b"small");

        let log = std::fs::read_to_string(mailbox.join("messages.log")).unwrap();
        let lines: Vec<_> = log.lines().collect();
        assert_eq!(
            lines,
            [
                "Your poster is processing now",
                "Tokyo (preview): prev_7_1_Tokyo_coral.png",
                "Tokyo: 7_1_Tokyo_coral.png",
            ]
        );
    }

    #[tokio::test]
    async fn missing_artifact_is_an_error() {
        let work = tempfile::tempdir().unwrap();
        let outbox = tempfile::tempdir().unwrap();
        let delivery = OutboxDelivery::new(outbox.path());
        let missing = work.path().join("nope.png");
        assert!(delivery
            .deliver(RequesterId(1), &missing, &missing, "x")
            .await
            .is_err());
    }
}
