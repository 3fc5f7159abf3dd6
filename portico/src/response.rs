//! Server-generated ("meta") responses and response plumbing.

use http::header::{HeaderValue, CACHE_CONTROL, CONTENT_TYPE, SERVER};
use http::{HeaderMap, Response, StatusCode};

use crate::body::{self, BoxBody};

/// The `Server` header value, computed once per process.
pub const SERVER_NAME: &str = concat!("portico/", env!("CARGO_PKG_VERSION"));

pub(crate) fn apply_server_header(headers: &mut HeaderMap) {
    headers
        .entry(SERVER)
        .or_insert_with(|| HeaderValue::from_static(SERVER_NAME));
}

/// Build a diagnostic plain-text response for an engine-generated
/// status, optionally with an extra detail line.
///
/// The body always begins with the status line, e.g. `404 Not Found`.
pub fn meta_response(status: StatusCode, extra: Option<&str>) -> Response<BoxBody> {
    let reason = status.canonical_reason().unwrap_or("Unknown");
    let mut text = format!("{} {}\n", status.as_u16(), reason);
    if let Some(extra) = extra {
        text.push_str("\n  ");
        text.push_str(extra);
        text.push('\n');
    }

    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .header(CACHE_CONTROL, "no-store, must-revalidate")
        .body(body::full(text))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body_text(response: Response<BoxBody>) -> String {
        let collected = response.into_body().collect().await.unwrap();
        String::from_utf8(collected.to_bytes().to_vec()).unwrap()
    }

    #[tokio::test]
    async fn meta_body_begins_with_the_status_line() {
        let response = meta_response(StatusCode::BAD_REQUEST, None);
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_text(response).await.starts_with("400 Bad Request"));
    }

    #[tokio::test]
    async fn meta_body_carries_the_extra_line() {
        let response = meta_response(StatusCode::NOT_FOUND, Some("http://x.y/z"));
        let text = body_text(response).await;
        assert!(text.starts_with("404 Not Found"));
        assert!(text.contains("http://x.y/z"));
    }

    #[test]
    fn server_header_is_only_applied_when_absent() {
        let mut headers = HeaderMap::new();
        apply_server_header(&mut headers);
        assert_eq!(headers.get(SERVER).unwrap(), SERVER_NAME);

        let mut headers = HeaderMap::new();
        headers.insert(SERVER, HeaderValue::from_static("custom"));
        apply_server_header(&mut headers);
        assert_eq!(headers.get(SERVER).unwrap(), "custom");
    }
}
