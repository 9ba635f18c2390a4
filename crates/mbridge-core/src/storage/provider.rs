use std::fmt::Debug;
use std::path::{Path, PathBuf};

use crate::storage::error::StorageResult;

/// Trait for storage providers that can read and write data
pub trait StorageProvider: Send + Sync + Debug {
    /// Get the name of this provider
    fn name(&self) -> &str;

    /// Absolute form of a provider-relative path
    fn resolve(&self, path: &Path) -> PathBuf;

    /// Check if a path exists
    fn exists(&self, path: &Path) -> bool;

    /// Check if a path is a file
    fn is_file(&self, path: &Path) -> bool;

    /// Check if a path is a directory
    fn is_dir(&self, path: &Path) -> bool;

    /// Create a directory and all its parent directories
    fn create_dir_all(&self, path: &Path) -> StorageResult<()>;

    /// Read a file to a string
    fn read_to_string(&self, path: &Path) -> StorageResult<String>;

    /// Write a string to a file, replacing it atomically
    fn write_string(&self, path: &Path, contents: &str) -> StorageResult<()>;

    /// Write bytes to a file, replacing it atomically
    fn write_bytes(&self, path: &Path, contents: &[u8]) -> StorageResult<()>;

    /// Copy a file from one path to another
    fn copy(&self, from: &Path, to: &Path) -> StorageResult<()>;

    /// Remove a file
    fn remove_file(&self, path: &Path) -> StorageResult<()>;

    /// Remove a directory and all its contents
    fn remove_dir_all(&self, path: &Path) -> StorageResult<()>;

    /// List all entries in a directory
    fn read_dir(&self, path: &Path) -> StorageResult<Vec<PathBuf>>;
}
