use std::{
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, Error};

/// Creates all directories in a path if they don't exist.
pub fn create_dirs<S>(path: S) -> Result<(), Error>
where
    S: AsRef<Path>,
{
    std::fs::create_dir_all(path.as_ref()).context(format!(
        "Could not create path: {}",
        path.as_ref().display()
    ))
}

/// Reads the content of a file and trims it.
pub fn read_file_trim(file_path: &Path) -> Result<String, Error> {
    let content = std::fs::read_to_string(file_path)
        .context(format!("Could not read file contents: {:?}", file_path))?;
    Ok(content.trim().to_string())
}

/// Writes a file atomically: the content lands in a temporary file in the
/// target directory which is then renamed over the destination. Parent
/// directories are created as needed.
pub fn write_atomic<S>(path: S, contents: &[u8]) -> Result<(), Error>
where
    S: AsRef<Path>,
{
    let path = path.as_ref();
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    create_dirs(&parent)?;

    let mut tmp = tempfile::NamedTempFile::new_in(&parent)
        .context("Failed to create temporary file for atomic write")?;
    tmp.write_all(contents)
        .context("Failed to write temporary file")?;
    tmp.persist(path)
        .with_context(|| format!("Failed to persist {}", path.display()))?;
    Ok(())
}
