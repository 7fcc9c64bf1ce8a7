use std::io;
use std::path::{Path, PathBuf};

use autosolve_core::LanguageProfile;
use tempfile::TempDir;

const SOURCE_STEM: &str = "solution";

/// Creates one staging directory per attempt.
#[derive(Debug, Clone, Default)]
pub struct WorkspaceManager {
    root: Option<PathBuf>,
}

impl WorkspaceManager {
    pub fn new(root: Option<PathBuf>) -> Self {
        Self { root }
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    /// Create `attempt-<id>-XXXX` and write the source into it.
    ///
    /// The filesystem work runs on the blocking pool.
    pub async fn stage(
        &self,
        attempt_id: &str,
        source: &str,
        profile: &LanguageProfile,
    ) -> io::Result<Workspace> {
        let root = self.root.clone();
        let prefix = format!("attempt-{attempt_id}-");
        let file_name = format!("{SOURCE_STEM}.{}", profile.file_extension);
        let source = source.to_owned();

        let workspace = tokio::task::spawn_blocking(move || {
            stage_blocking(root.as_deref(), &prefix, &file_name, &source)
        })
        .await
        .map_err(io::Error::other)??;

        tracing::debug!("Staged attempt {} at {:?}", attempt_id, workspace.path());
        Ok(workspace)
    }
}

fn stage_blocking(
    root: Option<&Path>,
    prefix: &str,
    file_name: &str,
    source: &str,
) -> io::Result<Workspace> {
    let mut builder = tempfile::Builder::new();
    builder.prefix(prefix);

    let dir = match root {
        Some(root) => {
            std::fs::create_dir_all(root)?;
            builder.tempdir_in(root)?
        }
        None => builder.tempdir()?,
    };

    let source_path = dir.path().join(file_name);
    // Dropping `dir` on this error path removes the directory.
    std::fs::write(&source_path, source)?;

    Ok(Workspace {
        binary_path: dir.path().join(SOURCE_STEM),
        source_path,
        dir,
    })
}

/// Owning handle for a staged attempt. The directory and everything in it,
/// compiled artifacts included, is removed by [`cleanup`](Self::cleanup) or
/// when the handle is dropped.
#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
    source_path: PathBuf,
    binary_path: PathBuf,
}

impl Workspace {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    /// Where a compile step is expected to leave its artifact.
    pub fn binary_path(&self) -> &Path {
        &self.binary_path
    }

    /// Remove the directory now, on the blocking pool, reporting failure
    /// instead of ignoring it.
    pub async fn cleanup(self) -> io::Result<()> {
        let path = self.dir.path().to_path_buf();
        let dir = self.dir;
        tokio::task::spawn_blocking(move || dir.close())
            .await
            .map_err(io::Error::other)??;
        tracing::debug!("Removed workspace {:?}", path);
        Ok(())
    }
}
