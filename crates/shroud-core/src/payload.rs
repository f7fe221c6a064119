//! Plaintext file payloads.
//!
//! Reading a file into memory on the sending side and persisting a decrypted
//! file on the receiving side. Names suggested by the peer are reduced to a
//! single safe path component before touching the file system.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

/// MIME type used when nothing better is known
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Plaintext file with its metadata
#[derive(Clone, PartialEq, Eq)]
pub struct FilePayload {
    /// Suggested file name
    pub name: String,
    /// MIME type
    pub mime_type: String,
    /// File contents
    pub bytes: Vec<u8>,
}

impl FilePayload {
    /// Create a payload from parts.
    #[must_use]
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            bytes,
        }
    }

    /// Read a whole file, guessing its MIME type from the extension.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the file cannot be read.
    pub async fn from_path(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());

        Ok(Self::new(name, guess_mime_type(path), bytes))
    }

    /// Plaintext size in bytes
    #[must_use]
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// The suggested name reduced to one safe path component.
    #[must_use]
    pub fn sanitized_name(&self) -> String {
        sanitize_file_name(&self.name)
    }

    /// Write the payload into `dir` under its sanitized name.
    ///
    /// An existing file is never overwritten; a numeric suffix is added
    /// instead. Returns the path written.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the directory or file cannot be written.
    pub async fn write_into(&self, dir: impl AsRef<Path>) -> io::Result<PathBuf> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir).await?;

        let name = self.sanitized_name();
        let mut target = dir.join(&name);
        let mut attempt = 1u32;
        while tokio::fs::try_exists(&target).await? {
            target = dir.join(numbered(&name, attempt));
            attempt += 1;
        }

        tokio::fs::write(&target, &self.bytes).await?;
        tracing::info!("Wrote {} bytes to {}", self.bytes.len(), target.display());
        Ok(target)
    }
}

impl fmt::Debug for FilePayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilePayload")
            .field("name", &self.name)
            .field("mime_type", &self.mime_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

fn sanitize_file_name(name: &str) -> String {
    let last = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = last
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | '-' | '_' | ' ') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim().trim_start_matches('.');

    if cleaned.is_empty() {
        "download".to_string()
    } else {
        cleaned.to_string()
    }
}

fn numbered(name: &str, n: u32) -> String {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem} ({n}).{ext}"),
        _ => format!("{name} ({n})"),
    }
}

fn guess_mime_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "txt" | "log" => "text/plain",
        "md" => "text/markdown",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "csv" => "text/csv",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "tar" => "application/x-tar",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        _ => DEFAULT_MIME_TYPE,
    }
}
