//! # Package Repository
//!
//! On-disk store of installed NPK archives. One flat directory holds
//! `*.npk` files; each file is opened and verified on insert and on
//! startup scan. The repository never mutates a package in place:
//! installs copy into a temp file first and promote it with an atomic
//! rename, so a crash mid-install leaves no partial package behind.
//!
//! Packages are keyed by [`Container`]. Duplicate keys (two archives
//! declaring the same name and version) are an install error, not a
//! replace.

use crate::constants::NPK_EXT;
use crate::container::Container;
use crate::error::{Error, Result};
use crate::npk::Npk;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Directory-backed package store.
#[derive(Debug)]
pub struct Repository {
    dir: PathBuf,
    packages: HashMap<Container, Npk>,
}

impl Repository {
    /// Opens a repository, creating the directory if needed, and scans
    /// it for packages.
    ///
    /// Archives that fail to open or verify are skipped with a warning;
    /// one bad file never blocks the rest of the repository.
    pub fn open(dir: &Path) -> Result<Repository> {
        std::fs::create_dir_all(dir).map_err(|e| Error::RepositoryInit {
            path: dir.to_owned(),
            reason: e.to_string(),
        })?;

        let mut packages = HashMap::new();
        let entries = std::fs::read_dir(dir).map_err(|e| Error::RepositoryInit {
            path: dir.to_owned(),
            reason: e.to_string(),
        })?;
        for entry in entries {
            let entry = entry.map_err(|e| Error::RepositoryInit {
                path: dir.to_owned(),
                reason: e.to_string(),
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(NPK_EXT) {
                continue;
            }
            match Npk::open(&path) {
                Ok(npk) => {
                    let container = npk.manifest().container();
                    debug!("found package {container} at {}", path.display());
                    if let Some(previous) = packages.insert(container.clone(), npk) {
                        warn!(
                            "duplicate package {container}: ignoring {}",
                            previous.path().display()
                        );
                    }
                }
                Err(e) => warn!("skipping {}: {e}", path.display()),
            }
        }

        info!(
            "repository {} holds {} packages",
            dir.display(),
            packages.len()
        );
        Ok(Repository {
            dir: dir.to_owned(),
            packages,
        })
    }

    /// Returns the repository directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Installs the archive at `src` into the repository.
    ///
    /// The archive is copied to a temp file, verified there, and
    /// promoted with an atomic rename. Returns the container key of the
    /// installed package.
    ///
    /// # Errors
    ///
    /// [`Error::InstallDuplicate`] if the key is already present; any
    /// [`Npk::open`] error if the archive is malformed or tampered.
    pub fn install(&mut self, src: &Path) -> Result<Container> {
        let (staging, npk) = Self::stage(&self.dir, src)?;
        self.promote(staging, npk)
    }

    /// Copies `src` to a staging file inside `dir` and verifies it.
    ///
    /// Pure file work; touches no repository state, so callers may run
    /// it on a blocking thread without holding the store. The staging
    /// file is removed on error.
    pub fn stage(dir: &Path, src: &Path) -> Result<(PathBuf, Npk)> {
        let staging = dir.join(format!(".{}.tmp", Uuid::new_v4()));
        std::fs::copy(src, &staging)
            .map_err(|e| Error::io(format!("copy {} into repository", src.display()), e))?;
        match Npk::open(&staging) {
            Ok(npk) => Ok((staging, npk)),
            Err(e) => {
                let _ = std::fs::remove_file(&staging);
                Err(e)
            }
        }
    }

    /// Promotes a staged, verified archive into the store with an
    /// atomic rename. Removes the staging file on error.
    pub fn promote(&mut self, staging: PathBuf, npk: Npk) -> Result<Container> {
        let container = npk.manifest().container();
        if self.packages.contains_key(&container) {
            let _ = std::fs::remove_file(&staging);
            return Err(Error::InstallDuplicate(container));
        }
        let dest = self
            .dir
            .join(format!("{}-{}.{NPK_EXT}", container.name(), container.version()));
        if let Err(e) = std::fs::rename(&staging, &dest) {
            let _ = std::fs::remove_file(&staging);
            return Err(Error::io(format!("rename to {}", dest.display()), e));
        }
        // Reopen at the final path so the handle points at the
        // promoted file.
        let npk = Npk::open(&dest)?;
        info!("installed {container} as {}", dest.display());
        self.packages.insert(container.clone(), npk);
        Ok(container)
    }

    /// Removes a package and deletes its archive.
    pub fn remove(&mut self, container: &Container) -> Result<()> {
        let npk = self
            .packages
            .remove(container)
            .ok_or_else(|| Error::InvalidContainer(container.clone()))?;
        std::fs::remove_file(npk.path())
            .map_err(|e| Error::io(format!("remove {}", npk.path().display()), e))?;
        info!("uninstalled {container}");
        Ok(())
    }

    /// Looks up a package by key.
    pub fn get(&self, container: &Container) -> Option<&Npk> {
        self.packages.get(container)
    }

    /// Returns true if the key is present.
    pub fn contains(&self, container: &Container) -> bool {
        self.packages.contains_key(container)
    }

    /// Iterates all packages.
    pub fn iter(&self) -> impl Iterator<Item = (&Container, &Npk)> {
        self.packages.iter()
    }

    /// Returns all container keys.
    pub fn containers(&self) -> Vec<Container> {
        self.packages.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{Name, Version};
    use crate::manifest::Manifest;

    fn make_npk(dir: &Path, name: &str, version: Version) -> PathBuf {
        let manifest = Manifest {
            name: Name::try_from(name).unwrap(),
            version,
            init: Some(PathBuf::from("/init")),
            args: Vec::new(),
            env: Default::default(),
            uid: 1000,
            gid: 1000,
            cpu: None,
            memory: None,
            blkio: None,
            mounts: Default::default(),
            capabilities: Default::default(),
            rlimits: Default::default(),
            seccomp: None,
            selinux: None,
            console: None,
            autostart: None,
            io: None,
        };
        let root = dir.join(format!("{name}-root"));
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("init"), b"init").unwrap();
        crate::npk::pack(&manifest, &root, dir).unwrap()
    }

    #[test]
    fn test_install_and_scan() {
        let dir = tempfile::TempDir::new().unwrap();
        let repo_dir = dir.path().join("repo");
        let npk = make_npk(dir.path(), "hello", Version::new(0, 0, 1));

        let mut repo = Repository::open(&repo_dir).unwrap();
        let container = repo.install(&npk).unwrap();
        assert_eq!(container.to_string(), "hello:0.0.1");
        assert!(repo.contains(&container));

        // A fresh open finds the installed package.
        let repo = Repository::open(&repo_dir).unwrap();
        assert!(repo.contains(&container));
        assert_eq!(repo.containers().len(), 1);
    }

    #[test]
    fn test_install_duplicate_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let repo_dir = dir.path().join("repo");
        let npk = make_npk(dir.path(), "hello", Version::new(0, 0, 1));

        let mut repo = Repository::open(&repo_dir).unwrap();
        repo.install(&npk).unwrap();
        assert!(matches!(
            repo.install(&npk),
            Err(Error::InstallDuplicate(_))
        ));
        // No staging leftovers.
        let leftovers = std::fs::read_dir(&repo_dir)
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .ends_with(".tmp")
            })
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_install_corrupt_archive_cleans_staging() {
        let dir = tempfile::TempDir::new().unwrap();
        let repo_dir = dir.path().join("repo");
        let junk = dir.path().join("junk.npk");
        std::fs::write(&junk, b"not a tar archive").unwrap();

        let mut repo = Repository::open(&repo_dir).unwrap();
        assert!(repo.install(&junk).is_err());
        let leftovers = std::fs::read_dir(&repo_dir).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_remove_deletes_archive() {
        let dir = tempfile::TempDir::new().unwrap();
        let repo_dir = dir.path().join("repo");
        let npk = make_npk(dir.path(), "hello", Version::new(0, 0, 1));

        let mut repo = Repository::open(&repo_dir).unwrap();
        let container = repo.install(&npk).unwrap();
        let path = repo.get(&container).unwrap().path().to_owned();
        repo.remove(&container).unwrap();
        assert!(!path.exists());
        assert!(!repo.contains(&container));
    }

    #[test]
    fn test_scan_skips_corrupt_archive() {
        let dir = tempfile::TempDir::new().unwrap();
        let repo_dir = dir.path().join("repo");
        std::fs::create_dir_all(&repo_dir).unwrap();
        std::fs::write(repo_dir.join("junk.npk"), b"not a tar archive").unwrap();

        let repo = Repository::open(&repo_dir).unwrap();
        assert_eq!(repo.containers().len(), 0);
    }
}
