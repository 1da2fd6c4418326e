//! Input materialisation: turn a file reference into a stable local path.
//!
//! Providers need a file-system path. Paths are used as-is after a
//! readability check; byte buffers and downloads are written to a named
//! temporary file owned by a [`TempInput`]. The temp file is removed by
//! [`TempInput::cleanup`] on every exit path of a conversion, and again on
//! `Drop` so that a cancelled future (client disconnect, request timeout)
//! still releases it. Removal is idempotent and never fails the caller.

use crate::error::{ConvertError, ResourceCleanupError};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::TempPath;
use tracing::{debug, info, warn};

/// What the caller wants converted.
#[derive(Debug, Clone)]
pub enum FileRef {
    /// A file already on disk.
    Path(PathBuf),
    /// File contents held in memory.
    Bytes(Vec<u8>),
}

impl From<PathBuf> for FileRef {
    fn from(p: PathBuf) -> Self {
        FileRef::Path(p)
    }
}

impl From<&Path> for FileRef {
    fn from(p: &Path) -> Self {
        FileRef::Path(p.to_path_buf())
    }
}

impl From<Vec<u8>> for FileRef {
    fn from(b: Vec<u8>) -> Self {
        FileRef::Bytes(b)
    }
}

/// A local path for the duration of one conversion.
#[derive(Debug)]
pub struct TempInput {
    path: PathBuf,
    temp: Option<TempPath>,
}

impl TempInput {
    /// Wrap a caller-owned path; cleanup leaves it alone.
    pub fn borrowed(path: PathBuf) -> Self {
        Self { path, temp: None }
    }

    /// Take ownership of a temporary path; cleanup removes it.
    pub fn owned(temp: TempPath) -> Self {
        Self {
            path: temp.to_path_buf(),
            temp: Some(temp),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_temporary(&self) -> bool {
        self.temp.is_some()
    }

    /// Remove the temporary file, if any. Safe to call repeatedly and on a
    /// file someone else already removed; failures are logged only.
    pub fn cleanup(&mut self) {
        let Some(temp) = self.temp.take() else {
            return;
        };
        match temp.close() {
            Ok(()) => debug!("Removed temporary input {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Temporary input {} already gone", self.path.display())
            }
            Err(source) => {
                let err = ResourceCleanupError {
                    path: self.path.clone(),
                    source,
                };
                warn!("{}", err);
            }
        }
    }
}

impl Drop for TempInput {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Check that a local path exists and is readable.
pub fn resolve_local(path: &Path) -> Result<(), ConvertError> {
    if !path.exists() {
        return Err(ConvertError::FileNotFound {
            path: path.to_path_buf(),
        });
    }
    match std::fs::File::open(path) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            Err(ConvertError::PermissionDenied {
                path: path.to_path_buf(),
            })
        }
        Err(_) => Err(ConvertError::FileNotFound {
            path: path.to_path_buf(),
        }),
    }
}

/// Write bytes to a fresh temporary file.
pub fn write_temp(bytes: &[u8], suffix: &str) -> Result<TempInput, ConvertError> {
    let mut file = tempfile::Builder::new()
        .prefix("docpipe-")
        .suffix(suffix)
        .tempfile()
        .map_err(|e| ConvertError::Internal(format!("Failed to create temp file: {e}")))?;
    file.write_all(bytes)
        .and_then(|_| file.flush())
        .map_err(|e| ConvertError::Internal(format!("Failed to write temp file: {e}")))?;
    let input = TempInput::owned(file.into_temp_path());
    debug!("Materialised {} bytes at {}", bytes.len(), input.path().display());
    Ok(input)
}

/// Turn a [`FileRef`] into a local path, writing buffers to a temp file.
pub fn materialize(file: FileRef) -> Result<TempInput, ConvertError> {
    match file {
        FileRef::Path(path) => {
            resolve_local(&path)?;
            Ok(TempInput::borrowed(path))
        }
        FileRef::Bytes(bytes) => {
            let suffix = if bytes.starts_with(b"%PDF") { ".pdf" } else { ".bin" };
            write_temp(&bytes, suffix)
        }
    }
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Download a URL into a temporary file.
///
/// With `require_pdf`, a response that is neither served as
/// `application/pdf` nor addressed by a `.pdf` URL is rejected before the
/// body is read. The returned [`TempInput`] exists only once every byte is
/// on disk.
pub async fn download(
    url: &str,
    timeout_secs: u64,
    require_pdf: bool,
) -> Result<TempInput, ConvertError> {
    info!("Downloading document from: {}", url);

    let failed = |reason: String| ConvertError::DownloadFailed {
        url: url.to_string(),
        reason,
    };

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| failed(e.to_string()))?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            ConvertError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            failed(e.to_string())
        }
    })?;

    if !response.status().is_success() {
        return Err(failed(format!("HTTP {}", response.status())));
    }

    if require_pdf {
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !looks_like_pdf(content_type, url) {
            return Err(failed("URL does not point to a PDF file".into()));
        }
    }

    let suffix = extension_of(url);
    let bytes = response.bytes().await.map_err(|e| {
        if e.is_timeout() {
            ConvertError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            failed(e.to_string())
        }
    })?;

    let input = write_temp(&bytes, &suffix)?;
    info!("Downloaded to: {}", input.path().display());
    Ok(input)
}

fn looks_like_pdf(content_type: &str, url: &str) -> bool {
    content_type.contains("application/pdf")
        || reqwest::Url::parse(url)
            .map(|u| u.path().to_ascii_lowercase().ends_with(".pdf"))
            .unwrap_or(false)
}

/// `.ext` of the URL's last path segment, `.pdf` when there is none.
fn extension_of(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .and_then(|last| {
            Path::new(&last)
                .extension()
                .map(|ext| format!(".{}", ext.to_string_lossy().to_ascii_lowercase()))
        })
        .unwrap_or_else(|| ".pdf".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_url() {
        assert!(is_url("https://example.com/doc.pdf"));
        assert!(is_url("http://example.com/doc.pdf"));
        assert!(!is_url("/tmp/doc.pdf"));
        assert!(!is_url(""));
    }

    #[test]
    fn extension_from_url() {
        assert_eq!(extension_of("https://x.org/a/report.PDF"), ".pdf");
        assert_eq!(extension_of("https://x.org/a/download"), ".pdf");
        assert_eq!(extension_of("https://x.org/a/file.docx?x=1"), ".docx");
    }

    #[test]
    fn pdf_check_accepts_header_or_extension() {
        assert!(looks_like_pdf("application/pdf", "https://x.org/get?id=1"));
        assert!(looks_like_pdf("application/octet-stream", "https://x.org/a.pdf"));
        assert!(!looks_like_pdf("text/html", "https://x.org/page.html"));
        assert!(!looks_like_pdf("text/html", "https://x.org/download"));
    }

    #[test]
    fn bytes_are_written_and_removed() {
        let mut input = materialize(FileRef::Bytes(b"%PDF-1.7 test".to_vec())).unwrap();
        let path = input.path().to_path_buf();
        assert!(input.is_temporary());
        assert!(path.exists());
        assert_eq!(path.extension().unwrap(), "pdf");
        input.cleanup();
        assert!(!path.exists());
    }

    #[test]
    fn cleanup_is_idempotent() {
        let mut input = write_temp(b"abc", ".bin").unwrap();
        let path = input.path().to_path_buf();
        std::fs::remove_file(&path).unwrap();
        input.cleanup();
        input.cleanup();
        assert!(!path.exists());
    }

    #[test]
    fn drop_removes_temp_file() {
        let input = write_temp(b"abc", ".bin").unwrap();
        let path = input.path().to_path_buf();
        drop(input);
        assert!(!path.exists());
    }

    #[test]
    fn borrowed_path_is_kept() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut input = materialize(FileRef::Path(file.path().to_path_buf())).unwrap();
        input.cleanup();
        assert!(file.path().exists());
    }

    #[test]
    fn missing_path_is_file_not_found() {
        let err = materialize(FileRef::Path("/definitely/not/here.pdf".into())).unwrap_err();
        assert!(matches!(err, ConvertError::FileNotFound { .. }));
    }
}
