//! Server-side library of pushable scripts and binaries.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

use crate::protocol::ScriptKind;

const IGNORED_DIR: &str = "_obsolete_";

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact directory `{0}` not found")]
    MissingDirectory(PathBuf),
    #[error("artifact `{0}` not found")]
    NotFound(String),
    #[error("artifact name `{0}` is not a relative path inside the library")]
    InvalidName(String),
    #[error("failed to read `{path}`: {source}")]
    Io { path: PathBuf, source: io::Error },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactListing {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone)]
pub struct ArtifactLibrary {
    root: PathBuf,
}

impl ArtifactLibrary {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Scripts at the top level and one directory down, by recognised
    /// extension. `_obsolete_` is skipped.
    pub fn list_scripts(&self) -> Result<Vec<ArtifactListing>, ArtifactError> {
        if !self.root.is_dir() {
            return Err(ArtifactError::MissingDirectory(self.root.clone()));
        }

        let mut listings = Vec::new();
        for entry in read_dir(&self.root)? {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if path.is_dir() {
                if name == IGNORED_DIR {
                    continue;
                }
                for nested in read_dir(&path)? {
                    let nested_path = nested.path();
                    if nested_path.is_file() {
                        let file = nested.file_name().to_string_lossy().into_owned();
                        push_script(&mut listings, format!("{name}/{file}"), &nested_path);
                    }
                }
            } else if path.is_file() {
                push_script(&mut listings, name, &path);
            }
        }
        listings.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(listings)
    }

    /// Read an artifact by its library-relative name.
    pub fn read(&self, name: &str) -> Result<Vec<u8>, ArtifactError> {
        let path = self.resolve(name)?;
        if !path.is_file() {
            return Err(ArtifactError::NotFound(name.to_string()));
        }
        fs::read(&path).map_err(|source| ArtifactError::Io { path, source })
    }

    fn resolve(&self, name: &str) -> Result<PathBuf, ArtifactError> {
        let relative = Path::new(name.trim());
        let plain = relative
            .components()
            .all(|component| matches!(component, Component::Normal(_) | Component::CurDir));
        if name.trim().is_empty() || !plain {
            return Err(ArtifactError::InvalidName(name.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

fn read_dir(dir: &Path) -> Result<Vec<fs::DirEntry>, ArtifactError> {
    let io_error = |source| ArtifactError::Io {
        path: dir.to_path_buf(),
        source,
    };
    fs::read_dir(dir)
        .map_err(io_error)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(io_error)
}

fn push_script(listings: &mut Vec<ArtifactListing>, name: String, path: &Path) {
    let kind = path
        .extension()
        .and_then(|ext| ext.to_str())
        .and_then(ScriptKind::from_extension);
    if let Some(kind) = kind {
        listings.push(ArtifactListing {
            name,
            kind: kind.as_str().to_string(),
        });
    }
}
