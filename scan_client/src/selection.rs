//! Local file selection and preview references.
//!
//! A selected image gets a `blob:` style preview URL that can be resolved
//! back to its bytes without touching the network. The URL stays resolvable
//! for exactly as long as its [`PreviewReference`] is alive; dropping the
//! reference revokes it.

use std::{fmt, path::Path, sync::Arc};

use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;

const PREVIEW_SCHEME: &str = "blob:scan-client/";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedImage {
    file_name: String,
    mime_type: String,
    bytes: Arc<[u8]>,
}

impl SelectedImage {
    pub fn new(file_name: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        let file_name = file_name.into();
        let mime_type = mime_for(&file_name).to_string();
        Self {
            file_name,
            mime_type,
            bytes: bytes.into(),
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = mime_type.into();
        self
    }

    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        Ok(Self::new(file_name, bytes))
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub(crate) fn shared_bytes(&self) -> Arc<[u8]> {
        Arc::clone(&self.bytes)
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

// Only the first file of a pick is ever used.
#[derive(Debug, Clone, Default)]
pub struct FilePick {
    files: Vec<SelectedImage>,
}

impl FilePick {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn single(image: SelectedImage) -> Self {
        Self { files: vec![image] }
    }

    pub fn from_files(files: Vec<SelectedImage>) -> Self {
        Self { files }
    }

    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::single(SelectedImage::from_path(path).await?))
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn into_first(self) -> Option<SelectedImage> {
        self.files.into_iter().next()
    }
}

#[derive(Clone, Default)]
pub struct PreviewStore {
    entries: Arc<DashMap<Uuid, Arc<[u8]>>>,
}

impl PreviewStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, image: &SelectedImage) -> PreviewReference {
        let id = Uuid::new_v4();
        self.entries.insert(id, Arc::clone(&image.bytes));
        debug!(%id, file = image.file_name(), "preview created");
        PreviewReference {
            id,
            url: format!("{PREVIEW_SCHEME}{id}"),
            entries: Arc::clone(&self.entries),
        }
    }

    pub fn resolve(&self, url: &str) -> Option<Arc<[u8]>> {
        let id = url.strip_prefix(PREVIEW_SCHEME)?;
        let id = Uuid::parse_str(id).ok()?;
        self.entries.get(&id).map(|bytes| Arc::clone(bytes.value()))
    }

    pub fn live_count(&self) -> usize {
        self.entries.len()
    }
}

impl fmt::Debug for PreviewStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreviewStore")
            .field("live", &self.entries.len())
            .finish()
    }
}

/// Owning handle to a preview URL. Revoked on drop.
pub struct PreviewReference {
    id: Uuid,
    url: String,
    entries: Arc<DashMap<Uuid, Arc<[u8]>>>,
}

impl PreviewReference {
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Drop for PreviewReference {
    fn drop(&mut self) {
        self.entries.remove(&self.id);
        debug!(id = %self.id, "preview revoked");
    }
}

impl fmt::Debug for PreviewReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PreviewReference").field(&self.url).finish()
    }
}

fn mime_for(file_name: &str) -> &'static str {
    let ext = Path::new(file_name)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "webp" => "image/webp",
        "tif" | "tiff" => "image/tiff",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_type_follows_extension() {
        assert_eq!(SelectedImage::new("scan.PNG", vec![1u8]).mime_type(), "image/png");
        assert_eq!(SelectedImage::new("a.jpeg", vec![1u8]).mime_type(), "image/jpeg");
        assert_eq!(
            SelectedImage::new("notes", vec![1u8]).mime_type(),
            "application/octet-stream"
        );
    }

    #[test]
    fn preview_resolves_until_dropped() {
        let store = PreviewStore::new();
        let image = SelectedImage::new("scan.png", vec![7u8, 8, 9]);

        let preview = store.create(&image);
        let url = preview.url().to_string();
        assert!(url.starts_with("blob:"));
        assert_eq!(store.resolve(&url).as_deref(), Some(&[7u8, 8, 9][..]));
        assert_eq!(store.live_count(), 1);

        drop(preview);
        assert!(store.resolve(&url).is_none());
        assert_eq!(store.live_count(), 0);
    }

    #[test]
    fn resolve_ignores_foreign_urls() {
        let store = PreviewStore::new();
        assert!(store.resolve("http://localhost/scan.png").is_none());
        assert!(store.resolve("blob:scan-client/not-a-uuid").is_none());
    }

    #[test]
    fn pick_uses_first_file_only() {
        let pick = FilePick::from_files(vec![
            SelectedImage::new("first.png", vec![1u8]),
            SelectedImage::new("second.png", vec![2u8]),
        ]);
        assert_eq!(pick.into_first().unwrap().file_name(), "first.png");
        assert!(FilePick::empty().into_first().is_none());
    }

    #[tokio::test]
    async fn loads_image_from_disk() {
        let path = std::env::temp_dir().join(format!("{}-scan 1.png", Uuid::new_v4()));
        tokio::fs::write(&path, [0x89, b'P', b'N', b'G']).await.unwrap();

        let image = SelectedImage::from_path(&path).await.unwrap();
        assert!(image.file_name().ends_with("scan 1.png"));
        assert_eq!(image.mime_type(), "image/png");
        assert_eq!(image.len(), 4);

        tokio::fs::remove_file(&path).await.unwrap();
        assert!(SelectedImage::from_path(&path).await.is_err());
    }
}
