//! Ephemeral build workspaces.

use icarium_core::BuildId;
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// A disposable checkout directory owned by exactly one build.
///
/// Laid out as `<root>/<owner>/<repository>/<build id>`. Only the parent is
/// created up front; the checkout tool creates the leaf. On unix every
/// level below the root is private to the daemon user (0700).
#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
}

impl Workspace {
    pub async fn create(root: &Path, owner: &str, repository: &str, id: BuildId) -> io::Result<Self> {
        let owner_dir = root.join(single_component(owner)?);
        let parent = owner_dir.join(single_component(repository)?);
        create_private_dir_all(&parent).await?;
        restrict(&owner_dir).await?;
        restrict(&parent).await?;

        let path = parent.join(id.to_string());
        debug!(path = %path.display(), "Allocated workspace");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the workspace and everything in it. A missing directory is not an error.
    pub async fn release(self) -> io::Result<()> {
        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => {
                debug!(path = %self.path.display(), "Released workspace");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(unix)]
const PRIVATE_MODE: u32 = 0o700;

async fn create_private_dir_all(path: &Path) -> io::Result<()> {
    let mut builder = tokio::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(PRIVATE_MODE);
    builder.create(path).await
}

/// Tighten directories that already existed with a looser mode.
#[cfg(unix)]
async fn restrict(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(PRIVATE_MODE)).await
}

#[cfg(not(unix))]
async fn restrict(_path: &Path) -> io::Result<()> {
    Ok(())
}

/// Reject anything that would not stay a single directory level under the root.
fn single_component(name: &str) -> io::Result<&str> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(name),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("'{}' is not a valid workspace path component", name),
        )),
    }
}
