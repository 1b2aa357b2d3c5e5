//! Data source abstraction consumed by the renderer.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::io::Cursor;
use std::sync::Arc;

/// Forward iterator over a collection's items.
pub type ItemIter<'a> = Box<dyn Iterator<Item = Value> + Send + 'a>;

/// Supplies values, collections, images and metadata to a rendering.
///
/// `items` must hand out a fresh iterator on every call; the renderer may ask
/// for the same collection more than once (size counting, several regions).
pub trait DataSource: Send + Sync {
    fn value(&self, name: &str) -> Option<Value>;

    fn items(&self, name: &str) -> Option<ItemIter<'_>>;

    /// Optional size hint, used to plan streaming output without a counting
    /// pass.
    fn item_count(&self, _name: &str) -> Option<usize> {
        None
    }

    fn image(&self, _name: &str) -> Option<ImageData> {
        None
    }

    fn metadata(&self) -> Option<DocumentMetadata> {
        None
    }
}

impl<T: DataSource + ?Sized> DataSource for Arc<T> {
    fn value(&self, name: &str) -> Option<Value> {
        (**self).value(name)
    }

    fn items(&self, name: &str) -> Option<ItemIter<'_>> {
        (**self).items(name)
    }

    fn item_count(&self, name: &str) -> Option<usize> {
        (**self).item_count(name)
    }

    fn image(&self, name: &str) -> Option<ImageData> {
        (**self).image(name)
    }

    fn metadata(&self) -> Option<DocumentMetadata> {
        (**self).metadata()
    }
}

/// Resolve a dotted path: the full name is tried first, then the root segment
/// followed by navigation into objects (and arrays, by index).
pub fn resolve_path(source: &dyn DataSource, path: &str) -> Option<Value> {
    if let Some(value) = source.value(path) {
        return Some(value);
    }
    let (root, rest) = path.split_once('.')?;
    let value = source.value(root)?;
    navigate(&value, rest).cloned()
}

/// Walk `a.b.c` into a JSON value.
pub fn navigate<'v>(value: &'v Value, path: &str) -> Option<&'v Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub title: Option<String>,
    pub subject: Option<String>,
    pub creator: Option<String>,
    pub keywords: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
}

impl DocumentMetadata {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.subject.is_none()
            && self.creator.is_none()
            && self.keywords.is_none()
            && self.description.is_none()
            && self.category.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    Png,
    Jpeg,
    Gif,
}

impl ImageFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpeg",
            ImageFormat::Gif => "gif",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Gif => "image/gif",
        }
    }

    /// Sniff the format from magic bytes.
    pub fn detect(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
            Some(ImageFormat::Png)
        } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Some(ImageFormat::Jpeg)
        } else if bytes.starts_with(b"GIF8") {
            Some(ImageFormat::Gif)
        } else {
            None
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct ImageData {
    pub bytes: Vec<u8>,
    pub format: ImageFormat,
}

impl fmt::Debug for ImageData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageData")
            .field("format", &self.format)
            .field("len", &self.bytes.len())
            .finish()
    }
}

impl ImageData {
    /// Wrap raw image bytes; `None` when the format is not recognised.
    pub fn from_bytes(bytes: Vec<u8>) -> Option<Self> {
        let format = ImageFormat::detect(&bytes)?;
        Some(Self { bytes, format })
    }

    /// Intrinsic pixel size, when the bytes can be decoded far enough.
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        image::ImageReader::new(Cursor::new(&self.bytes))
            .with_guessed_format()
            .ok()?
            .into_dimensions()
            .ok()
    }
}

type CollectionFactory = Arc<dyn Fn() -> ItemIter<'static> + Send + Sync>;

enum Collection {
    Items(Arc<Vec<Value>>),
    Lazy {
        factory: CollectionFactory,
        hint: Option<usize>,
    },
}

/// In-memory data source backed by maps.
///
/// Collections are either materialised vectors or lazy factories producing a
/// fresh iterator per call.
#[derive(Default)]
pub struct MapDataSource {
    values: IndexMap<String, Value>,
    collections: IndexMap<String, Collection>,
    images: HashMap<String, ImageData>,
    metadata: Option<DocumentMetadata>,
}

impl fmt::Debug for MapDataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapDataSource")
            .field("values", &self.values.keys().collect::<Vec<_>>())
            .field("collections", &self.collections.keys().collect::<Vec<_>>())
            .field("images", &self.images.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl MapDataSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Top-level arrays become collections; everything else becomes a value.
    /// A `_metadata` object, when present, is read as document metadata.
    pub fn from_json(root: Value) -> Self {
        let mut source = Self::new();
        if let Value::Object(map) = root {
            for (key, value) in map {
                if key == "_metadata" {
                    source.metadata = serde_json::from_value(value).ok();
                    continue;
                }
                match value {
                    Value::Array(items) => {
                        source
                            .collections
                            .insert(key, Collection::Items(Arc::new(items)));
                    }
                    other => {
                        source.values.insert(key, other);
                    }
                }
            }
        }
        source
    }

    pub fn with_value(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    pub fn with_collection(mut self, name: impl Into<String>, items: Vec<Value>) -> Self {
        self.collections
            .insert(name.into(), Collection::Items(Arc::new(items)));
        self
    }

    /// Register a collection produced on demand. `hint` is reported through
    /// [`DataSource::item_count`].
    pub fn with_lazy_collection<F>(
        mut self,
        name: impl Into<String>,
        hint: Option<usize>,
        factory: F,
    ) -> Self
    where
        F: Fn() -> ItemIter<'static> + Send + Sync + 'static,
    {
        self.collections.insert(
            name.into(),
            Collection::Lazy {
                factory: Arc::new(factory),
                hint,
            },
        );
        self
    }

    pub fn with_image(mut self, name: impl Into<String>, image: ImageData) -> Self {
        self.images.insert(name.into(), image);
        self
    }

    pub fn with_metadata(mut self, metadata: DocumentMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn insert_image(&mut self, name: impl Into<String>, image: ImageData) {
        self.images.insert(name.into(), image);
    }
}

impl DataSource for MapDataSource {
    fn value(&self, name: &str) -> Option<Value> {
        self.values.get(name).cloned()
    }

    fn items(&self, name: &str) -> Option<ItemIter<'_>> {
        match self.collections.get(name)? {
            Collection::Items(items) => Some(Box::new(items.iter().cloned())),
            Collection::Lazy { factory, .. } => Some(factory()),
        }
    }

    fn item_count(&self, name: &str) -> Option<usize> {
        match self.collections.get(name)? {
            Collection::Items(items) => Some(items.len()),
            Collection::Lazy { hint, .. } => *hint,
        }
    }

    fn image(&self, name: &str) -> Option<ImageData> {
        self.images.get(name).cloned()
    }

    fn metadata(&self) -> Option<DocumentMetadata> {
        self.metadata.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_arrays_become_collections() {
        let source = MapDataSource::from_json(json!({
            "title": "Report",
            "user": {"name": "Ada", "address": {"city": "London"}},
            "employees": [{"name": "a"}, {"name": "b"}],
            "_metadata": {"title": "Quarterly", "creator": "ops"}
        }));
        assert_eq!(source.value("title"), Some(json!("Report")));
        assert_eq!(source.item_count("employees"), Some(2));
        assert_eq!(source.items("employees").unwrap().count(), 2);
        assert!(source.value("employees").is_none());
        let meta = source.metadata().unwrap();
        assert_eq!(meta.title.as_deref(), Some("Quarterly"));
        assert_eq!(meta.creator.as_deref(), Some("ops"));
    }

    #[test]
    fn dotted_paths_navigate_objects() {
        let source = MapDataSource::new()
            .with_value("user", json!({"name": "Ada", "address": {"city": "London"}}))
            .with_value("user.name", json!("Override"));
        assert_eq!(resolve_path(&source, "user.name"), Some(json!("Override")));
        assert_eq!(
            resolve_path(&source, "user.address.city"),
            Some(json!("London"))
        );
        assert_eq!(resolve_path(&source, "user.missing"), None);
        assert_eq!(resolve_path(&source, "nobody"), None);
    }

    #[test]
    fn lazy_collections_yield_fresh_iterators() {
        let source = MapDataSource::new().with_lazy_collection("rows", None, || {
            Box::new((0..3).map(|i| json!({"n": i})))
        });
        assert_eq!(source.item_count("rows"), None);
        assert_eq!(source.items("rows").unwrap().count(), 3);
        assert_eq!(source.items("rows").unwrap().count(), 3);
    }

    #[test]
    fn image_format_detection() {
        assert_eq!(
            ImageFormat::detect(&[0x89, b'P', b'N', b'G', 0x0D]),
            Some(ImageFormat::Png)
        );
        assert_eq!(
            ImageFormat::detect(&[0xFF, 0xD8, 0xFF, 0xE0]),
            Some(ImageFormat::Jpeg)
        );
        assert!(ImageData::from_bytes(b"not an image".to_vec()).is_none());
    }
}
