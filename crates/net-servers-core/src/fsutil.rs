//! Filesystem primitives shared by the store, the environment manager and
//! the synchronizers.

use crate::error::{CoreError, CoreResult};
use std::path::{Path, PathBuf};

/// `users.yaml` → `users.yaml.tmp` / `users.yaml.bak`.
#[must_use]
pub fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push('.');
    name.push_str(suffix);
    path.with_file_name(name)
}

/// Write `content` to `<dest>.tmp`, fsync, set `mode`, then rename over
/// `dest`. A crash at any point leaves the previous committed file intact.
pub async fn write_atomic(dest: &Path, content: &[u8], mode: u32) -> CoreResult<()> {
    use std::os::unix::fs::PermissionsExt;

    let tmp = sibling(dest, "tmp");
    let res: std::io::Result<()> = async {
        let mut file = tokio::fs::File::create(&tmp).await?;
        tokio::io::AsyncWriteExt::write_all(&mut file, content).await?;
        file.sync_all().await?;
        let mut perms = file.metadata().await?.permissions();
        perms.set_mode(mode);
        tokio::fs::set_permissions(&tmp, perms).await?;
        Ok(())
    }
    .await;
    res.map_err(|e| CoreError::from_io(&e, &tmp))?;

    tokio::fs::rename(&tmp, dest)
        .await
        .map_err(|e| CoreError::from_io(&e, dest))
}
