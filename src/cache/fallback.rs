//! Degraded responses served when neither the network nor a partition can answer.

use chrono::Utc;
use serde_json::json;

use crate::http::Response;

const PLACEHOLDER_SVG: &str = r##"<svg width="200" height="200" xmlns="http://www.w3.org/2000/svg">
  <rect width="200" height="200" fill="#E3F2FD"/>
  <text x="100" y="100" text-anchor="middle" dy=".3em" fill="#1976D2">Image unavailable offline</text>
</svg>"##;

const OFFLINE_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head>
  <title>Offline</title>
  <style>
    body { font-family: Arial, sans-serif; text-align: center; padding: 2rem; }
    .offline { color: #666; }
  </style>
</head>
<body>
  <div class="offline">
    <h2>You are currently offline</h2>
    <p>Some features may be limited. The app will work normally when you're back online.</p>
    <button onclick="window.location.reload()">Try Again</button>
  </div>
</body>
</html>"#;

/// HTTP 503 `{ error: "offline", message, offline: true, timestamp }`.
pub fn offline_api_response() -> Response {
  Response::json(
    503,
    &json!({
      "error": "offline",
      "message": "This feature requires internet connection",
      "offline": true,
      "timestamp": Utc::now().timestamp_millis(),
    }),
  )
}

pub fn placeholder_image() -> Response {
  Response::new(200, PLACEHOLDER_SVG).with_header("content-type", "image/svg+xml")
}

/// Shown for navigations when even the root document is not cached.
pub fn offline_page() -> Response {
  Response::new(200, OFFLINE_PAGE).with_header("content-type", "text/html")
}
