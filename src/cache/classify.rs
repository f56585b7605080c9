//! Request classification by path prefix, declared destination and extension.

use super::traits::ResourceClass;
use crate::http::{Destination, Request};

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "svg", "ico"];
const STATIC_EXTENSIONS: &[&str] = &["css", "js", "html", "json"];

/// Classify a GET request into the resource class that picks its strategy.
///
/// Precedence: `/api/` prefix, then image (destination or extension), then
/// static (extension or the web manifest), else dynamic.
pub fn classify(request: &Request) -> ResourceClass {
  let path = request.url.path();

  if path.starts_with("/api/") {
    return ResourceClass::Api;
  }

  let last_extension = extension(path);
  let extension = last_extension.as_deref();

  if request.destination == Some(Destination::Image)
    || extension.is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext))
  {
    return ResourceClass::Image;
  }

  if extension.is_some_and(|ext| STATIC_EXTENSIONS.contains(&ext))
    || path.contains("/manifest.json")
  {
    return ResourceClass::Static;
  }

  ResourceClass::Dynamic
}

/// Lowercased extension of the last path segment.
fn extension(path: &str) -> Option<String> {
  let segment = path.rsplit('/').next()?;
  let (stem, ext) = segment.rsplit_once('.')?;
  if stem.is_empty() || ext.is_empty() {
    return None;
  }
  Some(ext.to_ascii_lowercase())
}
