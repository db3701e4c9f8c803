use std::path::{Path, PathBuf};

use super::identifier::has_url_scheme;
use super::{BatchBuffer, Resolution, ResolverManager, XlinkResolver};
use crate::error::Result;
use crate::models::{TextureImageXlink, XlinkKind};
use crate::storage::{SqliteStorage, TextureImageData};

/// Map a texture URI to a file on disk.
///
/// `file:` URIs are taken as-is. Anything else with a URL scheme is remote and
/// rejected. Plain paths are percent-decoded and resolved against `import_dir`.
pub(crate) fn local_path(import_dir: &Path, uri: &str) -> std::result::Result<PathBuf, String> {
    let uri = uri.trim();
    if uri.starts_with("file:") {
        let url = url::Url::parse(uri).map_err(|e| format!("invalid file URI '{}': {}", uri, e))?;
        return url
            .to_file_path()
            .map_err(|_| format!("file URI '{}' has no local path", uri));
    }
    if has_url_scheme(uri) {
        return Err(format!("remote file '{}'", uri));
    }

    let decoded = urlencoding::decode(uri).map_err(|e| format!("invalid URI '{}': {}", uri, e))?;
    let normalized = decoded.replace('\\', "/");
    let path = Path::new(&normalized);
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(import_dir.join(path))
    }
}

fn mime_type(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match extension.as_deref() {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("tif") | Some("tiff") => "image/tiff",
        Some("bmp") => "image/bmp",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    }
}

/// Loads texture image files referenced by `tex_image` rows into the store.
pub struct TextureImageResolver {
    storage: SqliteStorage,
    import_dir: PathBuf,
    batch: BatchBuffer<TextureImageData>,
}

impl TextureImageResolver {
    pub fn new(storage: SqliteStorage, import_dir: PathBuf, batch_size: usize) -> Self {
        Self {
            storage,
            import_dir,
            batch: BatchBuffer::new(batch_size),
        }
    }

    pub async fn resolve(
        &self,
        xlink: &TextureImageXlink,
        _manager: &ResolverManager,
    ) -> Result<Resolution> {
        let path = match local_path(&self.import_dir, &xlink.file_uri) {
            Ok(path) => path,
            Err(reason) => return Ok(Resolution::Skipped(reason)),
        };

        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) => {
                return Ok(Resolution::Skipped(format!(
                    "cannot read texture image {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        let image = TextureImageData {
            id: xlink.id,
            mime_type: mime_type(&path).to_string(),
            data,
        };
        if self.batch.push(image).await {
            self.flush().await?;
        }
        Ok(Resolution::Resolved)
    }
}

#[async_trait::async_trait]
impl XlinkResolver for TextureImageResolver {
    fn kind(&self) -> XlinkKind {
        XlinkKind::TextureImage
    }

    async fn flush(&self) -> Result<()> {
        let images = self.batch.take().await;
        if images.is_empty() {
            return Ok(());
        }
        self.storage.write_texture_images(&images).await?;
        Ok(())
    }
}
