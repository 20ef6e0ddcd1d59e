//! File operations confined to the context's storage root

use std::io;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use log::debug;
use serde_json::Value;

use crate::rpc::{to_value, unknown_method, RpcArgs, Snippet};
use crate::{Error, Result, SnippetContext};

/// Resolves the caller supplied relative `path` against `root`.
///
/// Absolute paths and `..` components are rejected outright rather than
/// normalized. Symlinks are followed only as long as they stay inside
/// `root`, so the result always lies inside it.
pub fn resolve_under(root: &Path, path: &str) -> Result<PathBuf> {
    let relative = Path::new(path);
    let mut resolved = root.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::precondition(format!("Path {:?} escapes the storage root",
                                                       path)));
            }
        }
    }
    check_real_location(root, &resolved, path)?;
    Ok(resolved)
}

// The deepest existing part of `resolved` decides where it really points
fn check_real_location(root: &Path, resolved: &Path, path: &str) -> Result<()> {
    let real_root = match root.canonicalize() {
        Ok(real_root) => real_root,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };
    let outside = || Error::precondition(format!("Path {:?} leads outside the storage root", path));
    let mut candidate = resolved;
    loop {
        match candidate.canonicalize() {
            Ok(real) if real.starts_with(&real_root) => return Ok(()),
            Ok(_) => return Err(outside()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                // A dangling link could still be written through
                if candidate.symlink_metadata().is_ok() {
                    return Err(outside());
                }
                match candidate.parent() {
                    Some(parent) if parent.starts_with(root) => candidate = parent,
                    _ => return Ok(()),
                }
            }
            Err(err) => return Err(err.into()),
        }
    }
}

fn not_found(path: &str, err: io::Error) -> Error {
    if err.kind() == io::ErrorKind::NotFound {
        Error::precondition(format!("No such file {:?}", path))
    } else {
        Error::Io(err)
    }
}

pub struct StorageSnippet {
    root: PathBuf,
}

impl StorageSnippet {
    pub fn new(ctx: &SnippetContext) -> Self {
        Self { root: ctx.storage_root().to_path_buf() }
    }

    pub async fn exists(&self, path: &str) -> Result<bool> {
        let resolved = resolve_under(&self.root, path)?;
        Ok(tokio::fs::metadata(resolved).await.is_ok())
    }

    pub async fn size(&self, path: &str) -> Result<u64> {
        let resolved = resolve_under(&self.root, path)?;
        let metadata = tokio::fs::metadata(resolved).await.map_err(|e| not_found(path, e))?;
        Ok(metadata.len())
    }

    pub async fn delete(&self, path: &str) -> Result<()> {
        let resolved = resolve_under(&self.root, path)?;
        if resolved == self.root {
            return Err(Error::precondition("Refusing to delete the storage root"));
        }
        let metadata = tokio::fs::metadata(&resolved).await.map_err(|e| not_found(path, e))?;
        if metadata.is_dir() {
            tokio::fs::remove_dir_all(&resolved).await?;
        } else {
            tokio::fs::remove_file(&resolved).await?;
        }
        debug!("Deleted {:?}", resolved);
        Ok(())
    }

    /// Names of the entries of directory `path`, sorted
    pub async fn list(&self, path: &str) -> Result<Vec<String>> {
        let resolved = resolve_under(&self.root, path)?;
        let mut entries = tokio::fs::read_dir(resolved).await.map_err(|e| not_found(path, e))?;
        let mut names = vec![];
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    /// Creates missing parent directories
    pub async fn write_text(&self, path: &str, text: &str) -> Result<()> {
        let resolved = resolve_under(&self.root, path)?;
        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&resolved, text).await?;
        debug!("Wrote {} bytes to {:?}", text.len(), resolved);
        Ok(())
    }

    pub async fn read_text(&self, path: &str) -> Result<String> {
        let resolved = resolve_under(&self.root, path)?;
        tokio::fs::read_to_string(resolved).await.map_err(|e| not_found(path, e))
    }
}

#[async_trait]
impl Snippet for StorageSnippet {
    fn name(&self) -> &'static str {
        "storage"
    }

    async fn call(&self, method: &str, args: &RpcArgs) -> Result<Value> {
        let path = || args.get::<String>(0);
        match method {
            "fileExists" => to_value(self.exists(&path()?).await?),
            "fileSize" => to_value(self.size(&path()?).await?),
            "fileDelete" => to_value(self.delete(&path()?).await?),
            "fileList" => to_value(self.list(&path()?).await?),
            "fileWriteText" => {
                let text: String = args.get(1)?;
                to_value(self.write_text(&path()?, &text).await?)
            }
            "fileReadText" => to_value(self.read_text(&path()?).await?),
            _ => Err(unknown_method(self.name(), method)),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::ContextConfig;

    fn setup() -> (tempfile::TempDir, StorageSnippet) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ContextConfig::new();
        config.set_storage_root(dir.path());
        let ctx = config.start().unwrap();
        (dir, StorageSnippet::new(&ctx))
    }

    #[test]
    fn paths_stay_under_the_root() {
        let root = Path::new("/data/snippets");
        assert_eq!(resolve_under(root, "a/./b.txt").unwrap(), root.join("a/b.txt"));
        assert_eq!(resolve_under(root, "").unwrap(), root);
        for path in ["../etc/passwd", "a/../../b", "/etc/passwd"] {
            assert!(matches!(resolve_under(root, path), Err(Error::Precondition(_))), "{}", path);
        }
    }

    #[tokio::test]
    async fn write_read_and_delete() {
        let (dir, snippet) = setup();
        snippet.write_text("logs/run1.txt", "hello").await.unwrap();
        assert!(dir.path().join("logs/run1.txt").is_file());
        assert!(snippet.exists("logs/run1.txt").await.unwrap());
        assert_eq!(snippet.size("logs/run1.txt").await.unwrap(), 5);
        assert_eq!(snippet.read_text("logs/run1.txt").await.unwrap(), "hello");

        snippet.write_text("logs/run0.txt", "").await.unwrap();
        assert_eq!(snippet.list("logs").await.unwrap(), vec!["run0.txt", "run1.txt"]);

        snippet.delete("logs/run1.txt").await.unwrap();
        assert!(!snippet.exists("logs/run1.txt").await.unwrap());
        assert!(matches!(snippet.delete("logs/run1.txt").await, Err(Error::Precondition(_))));
        assert!(matches!(snippet.read_text("nope.txt").await, Err(Error::Precondition(_))));

        snippet.delete("logs").await.unwrap();
        assert!(snippet.list("").await.unwrap().is_empty());
        assert!(matches!(snippet.delete("").await, Err(Error::Precondition(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinks_must_stay_inside_the_root() {
        use std::os::unix::fs::symlink;

        let (dir, snippet) = setup();
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret.txt"), "s3cret").unwrap();
        symlink(outside.path(), dir.path().join("link")).unwrap();
        symlink(outside.path().join("missing.txt"), dir.path().join("dangling")).unwrap();

        for path in ["link", "link/secret.txt", "link/new.txt", "dangling"] {
            assert!(matches!(resolve_under(dir.path(), path), Err(Error::Precondition(_))),
                    "{}", path);
        }
        assert!(matches!(snippet.read_text("link/secret.txt").await, Err(Error::Precondition(_))));
        assert!(matches!(snippet.write_text("dangling", "x").await, Err(Error::Precondition(_))));
        assert!(matches!(snippet.delete("link/secret.txt").await, Err(Error::Precondition(_))));
        assert!(outside.path().join("secret.txt").exists());
        assert!(!outside.path().join("missing.txt").exists());

        // Links that stay inside are fine
        snippet.write_text("logs/a.txt", "inside").await.unwrap();
        symlink(dir.path().join("logs"), dir.path().join("alias")).unwrap();
        assert_eq!(snippet.read_text("alias/a.txt").await.unwrap(), "inside");
    }

    #[tokio::test]
    async fn escaping_paths_are_rejected_over_rpc() {
        let (_dir, snippet) = setup();
        let err = snippet.call("fileReadText", &RpcArgs::new(vec![json!("../secret")]))
                         .await
                         .unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
        assert!(matches!(snippet.call("fileExists", &RpcArgs::default()).await,
                         Err(Error::InvalidArgument(_))));
    }
}
