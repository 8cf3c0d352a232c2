//! Content types known to the cache.
//!
//! The cache only needs two questions answered about a response body: is
//! it HTML-like (HTML is never implicitly cached and always respects
//! `Vary`), and is it worth compressing.

use std::collections::HashMap;

use once_cell::sync::Lazy;

/// Broad family of a content type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentKind {
    Html,
    Xhtml,
    CeHtml,
    Javascript,
    Css,
    Text,
    Xml,
    Json,
    SourceMap,
    Svg,
    Png,
    Gif,
    Jpeg,
    Webp,
    Ico,
    Swf,
    Pdf,
    Video,
    Audio,
    Binary,
}

/// A MIME type and its canonical file extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentType {
    pub mime_type: &'static str,
    pub file_extension: &'static str,
    pub kind: ContentKind,
}

impl ContentType {
    const fn new(mime_type: &'static str, file_extension: &'static str, kind: ContentKind) -> Self {
        Self {
            mime_type,
            file_extension,
            kind,
        }
    }

    pub fn is_html_like(&self) -> bool {
        matches!(
            self.kind,
            ContentKind::Html | ContentKind::Xhtml | ContentKind::CeHtml
        )
    }

    pub fn is_image(&self) -> bool {
        matches!(
            self.kind,
            ContentKind::Png
                | ContentKind::Gif
                | ContentKind::Jpeg
                | ContentKind::Webp
                | ContentKind::Ico
                | ContentKind::Svg
        )
    }

    /// Text-like bodies that shrink under deflate
    pub fn is_compressible(&self) -> bool {
        matches!(
            self.kind,
            ContentKind::Html
                | ContentKind::Xhtml
                | ContentKind::CeHtml
                | ContentKind::Javascript
                | ContentKind::Css
                | ContentKind::Text
                | ContentKind::Xml
                | ContentKind::Json
                | ContentKind::SourceMap
                | ContentKind::Svg
        )
    }
}

static TYPES: &[ContentType] = &[
    ContentType::new("text/html", ".html", ContentKind::Html),
    ContentType::new("text/html", ".htm", ContentKind::Html),
    ContentType::new("application/xhtml+xml", ".xhtml", ContentKind::Xhtml),
    ContentType::new("application/ce-html+xml", ".xhtml", ContentKind::CeHtml),
    ContentType::new("text/javascript", ".js", ContentKind::Javascript),
    ContentType::new("application/javascript", ".js", ContentKind::Javascript),
    ContentType::new("application/x-javascript", ".js", ContentKind::Javascript),
    ContentType::new("application/ecmascript", ".js", ContentKind::Javascript),
    ContentType::new("text/ecmascript", ".js", ContentKind::Javascript),
    ContentType::new("text/css", ".css", ContentKind::Css),
    ContentType::new("text/plain", ".txt", ContentKind::Text),
    ContentType::new("text/xml", ".xml", ContentKind::Xml),
    ContentType::new("application/xml", ".xml", ContentKind::Xml),
    ContentType::new("application/json", ".json", ContentKind::Json),
    ContentType::new("application/json", ".map", ContentKind::SourceMap),
    ContentType::new("image/svg+xml", ".svg", ContentKind::Svg),
    ContentType::new("image/png", ".png", ContentKind::Png),
    ContentType::new("image/gif", ".gif", ContentKind::Gif),
    ContentType::new("image/jpeg", ".jpg", ContentKind::Jpeg),
    ContentType::new("image/jpeg", ".jpeg", ContentKind::Jpeg),
    ContentType::new("image/webp", ".webp", ContentKind::Webp),
    ContentType::new("image/x-icon", ".ico", ContentKind::Ico),
    ContentType::new("image/vnd.microsoft.icon", ".ico", ContentKind::Ico),
    ContentType::new("application/x-shockwave-flash", ".swf", ContentKind::Swf),
    ContentType::new("application/pdf", ".pdf", ContentKind::Pdf),
    ContentType::new("video/mp4", ".mp4", ContentKind::Video),
    ContentType::new("video/webm", ".webm", ContentKind::Video),
    ContentType::new("audio/mpeg", ".mp3", ContentKind::Audio),
    ContentType::new("application/octet-stream", ".bin", ContentKind::Binary),
    ContentType::new("application/zip", ".zip", ContentKind::Binary),
    ContentType::new("application/gzip", ".gz", ContentKind::Binary),
];

// First entry wins for both indexes.
static BY_MIME: Lazy<HashMap<&'static str, &'static ContentType>> = Lazy::new(|| {
    let mut map = HashMap::new();
    for t in TYPES {
        map.entry(t.mime_type).or_insert(t);
    }
    map
});

static BY_EXTENSION: Lazy<HashMap<&'static str, &'static ContentType>> = Lazy::new(|| {
    let mut map = HashMap::new();
    for t in TYPES {
        map.entry(t.file_extension).or_insert(t);
    }
    map
});

/// Look up a `Content-Type` header value; parameters such as `charset`
/// are ignored
pub fn mime_type_to_content_type(value: &str) -> Option<&'static ContentType> {
    let mime = value.split(';').next()?.trim().to_ascii_lowercase();
    BY_MIME.get(mime.as_str()).copied()
}

/// Look up a URL or file name by its extension
pub fn name_extension_to_content_type(name: &str) -> Option<&'static ContentType> {
    let path = name.split(['?', '#']).next()?;
    let dot = path.rfind('.')?;
    let ext = path[dot..].to_ascii_lowercase();
    BY_EXTENSION.get(ext.as_str()).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mime_lookup_ignores_parameters_and_case() {
        let t = mime_type_to_content_type("Text/HTML; charset=UTF-8").unwrap();
        assert!(t.is_html_like());
        assert!(t.is_compressible());
        assert!(mime_type_to_content_type("application/unknown").is_none());
    }

    #[test]
    fn test_images_are_not_compressible() {
        let png = mime_type_to_content_type("image/png").unwrap();
        assert!(png.is_image());
        assert!(!png.is_compressible());
        let svg = mime_type_to_content_type("image/svg+xml").unwrap();
        assert!(svg.is_compressible());
    }

    #[test]
    fn test_extension_lookup() {
        assert_eq!(
            name_extension_to_content_type("http://x/a/b.CSS?v=1").map(|t| t.kind),
            Some(ContentKind::Css)
        );
        assert_eq!(
            name_extension_to_content_type("photo.jpeg").map(|t| t.mime_type),
            Some("image/jpeg")
        );
        assert!(name_extension_to_content_type("README").is_none());
    }
}
