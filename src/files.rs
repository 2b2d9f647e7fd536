use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::{ClientError, Result};

/// Where received payloads end up: a directory for files, stdout for listings.
#[derive(Debug, Clone)]
pub struct PayloadSink {
    dir: PathBuf,
}

impl PayloadSink {
    pub fn new(dir: impl Into<PathBuf>) -> PayloadSink {
        PayloadSink { dir: dir.into() }
    }

    /// Sink rooted at the process working directory.
    pub fn current_dir() -> PayloadSink {
        PayloadSink::new(".")
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Creates `filename` holding `contents`, unless a file by that name is
    /// already listed in the directory. The listing and the create are two
    /// separate steps; a file appearing in between gets overwritten.
    /// Names with directory parts are refused before anything is touched.
    pub fn write(&self, filename: &str, contents: &str) -> Result<PathBuf> {
        if !is_plain_name(filename) {
            tracing::warn!(filename, "refusing to save outside the target directory");
            return Err(ClientError::Argument(format!(
                "Refusing to save {}: not a plain file name.",
                filename
            )));
        }
        if existing_files(&self.dir)?.iter().any(|name| name == filename) {
            tracing::warn!(filename, "refusing to overwrite existing file");
            return Err(ClientError::FileCollision(filename.to_string()));
        }
        let path = self.dir.join(filename);
        let mut writer = build_file_writer(&path)?;
        writer.write_all(contents.as_bytes())?;
        writer.flush()?;
        tracing::info!(
            path = %path.display(),
            bytes = contents.len(),
            sha256 = %digest(contents.as_bytes()),
            "file written"
        );
        println!("File transfer complete.");
        Ok(path)
    }

    pub fn display(&self, contents: &str) -> Result<()> {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        out.write_all(contents.as_bytes())?;
        out.flush()?;
        Ok(())
    }
}

/// True for a single path component such as `notes.txt`; false for
/// `sub/notes.txt`, `../notes.txt`, absolute paths, `.` and the empty string.
pub fn is_plain_name(filename: &str) -> bool {
    let mut parts = Path::new(filename).components();
    matches!((parts.next(), parts.next()), (Some(Component::Normal(_)), None))
}

/// Names of the regular files directly inside `dir`.
pub fn existing_files(dir: &Path) -> io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.path().is_file() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

pub fn build_file_writer(path: &Path) -> io::Result<BufWriter<File>> {
    let file = File::create(path).map_err(|e| {
        io::Error::new(e.kind(), format!("Error opening file {} for writing: {}", path.display(), e))
    })?;
    Ok(BufWriter::new(file))
}

/// Hex SHA-256 of `bytes`, logged so a transfer can be checked against the source.
pub fn digest(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}
