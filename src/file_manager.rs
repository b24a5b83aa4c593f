// src/file_manager.rs - G-code file listing and name resolution
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::error::GCodeError;

pub const DEFAULT_EXTENSIONS: [&str; 3] = ["gcode", "g", "gco"];

/// Locates printable files below a base directory.
#[derive(Debug, Clone)]
pub struct FileManager {
    base_dir: PathBuf,
    extensions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileInfo {
    /// Path relative to the base directory, `/` separated.
    pub name: String,
    pub size: u64,
    #[serde(skip)]
    pub path: PathBuf,
}

impl FileManager {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            extensions: DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
        }
    }

    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.extensions = extensions
            .into_iter()
            .map(|e| e.as_ref().trim_start_matches('.').to_ascii_lowercase())
            .collect();
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn has_valid_extension(&self, name: &str) -> bool {
        name.rsplit_once('.')
            .is_some_and(|(_, ext)| self.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
    }

    /// Printable files, sorted by case-insensitive name. The non-recursive
    /// listing only covers the base directory and skips dotfiles.
    pub async fn list_files(&self, recursive: bool) -> Result<Vec<FileInfo>, GCodeError> {
        let mut files = if recursive {
            self.walk().await?
        } else {
            self.list_top_level().await?
        };
        files.sort_by_key(|f| f.name.to_lowercase());
        Ok(files)
    }

    async fn list_top_level(&self) -> Result<Vec<FileInfo>, GCodeError> {
        let mut entries = fs::read_dir(&self.base_dir).await?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !self.has_valid_extension(&name) {
                continue;
            }
            let path = entry.path();
            // Follows symlinks, unlike DirEntry::metadata.
            let metadata = match fs::metadata(&path).await {
                Ok(metadata) => metadata,
                Err(_) => continue,
            };
            if metadata.is_file() {
                files.push(FileInfo {
                    name,
                    size: metadata.len(),
                    path,
                });
            }
        }
        Ok(files)
    }

    async fn walk(&self) -> Result<Vec<FileInfo>, GCodeError> {
        let mut files = Vec::new();
        let mut visited = HashSet::new();
        let mut pending = vec![(self.base_dir.clone(), String::new())];
        while let Some((dir, prefix)) = pending.pop() {
            let canonical = fs::canonicalize(&dir).await.unwrap_or_else(|_| dir.clone());
            if !visited.insert(canonical) {
                continue;
            }
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let file_name = entry.file_name().to_string_lossy().into_owned();
                let name = if prefix.is_empty() {
                    file_name.clone()
                } else {
                    format!("{}/{}", prefix, file_name)
                };
                let path = entry.path();
                let Ok(metadata) = fs::metadata(&path).await else {
                    continue;
                };
                if metadata.is_dir() {
                    pending.push((path, name));
                } else if metadata.is_file() && self.has_valid_extension(&file_name) {
                    files.push(FileInfo {
                        name,
                        size: metadata.len(),
                        path,
                    });
                }
            }
        }
        Ok(files)
    }

    /// Find a file by name: exact path first, then a listing scan that falls
    /// back to a case-insensitive match.
    pub async fn resolve(&self, filename: &str, check_subdirs: bool) -> Result<FileInfo, GCodeError> {
        let wanted = filename.trim().trim_start_matches(['.', '/', '\\']);
        if wanted.is_empty() {
            return Err(GCodeError::FileNotFound(filename.to_string()));
        }
        if check_subdirs || !wanted.contains('/') {
            let path = self.base_dir.join(wanted);
            if let Ok(metadata) = fs::metadata(&path).await {
                if metadata.is_file() {
                    return Ok(FileInfo {
                        name: wanted.to_string(),
                        size: metadata.len(),
                        path,
                    });
                }
            }
        }
        let files = self.list_files(check_subdirs).await.unwrap_or_default();
        if let Some(found) = files.iter().find(|f| f.name == wanted) {
            return Ok(found.clone());
        }
        let lower = wanted.to_lowercase();
        files
            .into_iter()
            .find(|f| f.name.to_lowercase() == lower)
            .ok_or_else(|| GCodeError::FileNotFound(filename.to_string()))
    }
}
