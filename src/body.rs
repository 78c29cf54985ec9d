//! Request body parser.
//!
//! Reads the body under a byte cap and a total-time cap, then decodes it by
//! content type into the payload map. Overflow is a 413, a slow body is a
//! 408, a receive error is a 400, and an unrecognized content type is a 415.

use std::time::Duration;

use bytes::Buf;
use http_body_util::BodyExt;
use serde_json::{Map, Value};
use tokio::time::timeout;

use crate::error::HttpError;

#[derive(Debug, Clone)]
pub struct BodyLimits {
    pub max_size: usize,
    pub timeout_ms: u64,
}

/// Decodes one request body. `content_type` is the raw header value; a
/// missing header fails with 400 before any bytes are read.
pub async fn parse<B>(
    content_type: Option<&str>,
    body: B,
    limits: &BodyLimits,
) -> Result<Map<String, Value>, HttpError>
where
    B: http_body::Body + Unpin,
    B::Error: std::fmt::Display,
{
    let content_type = match content_type {
        Some(ct) => ct,
        None => return Err(HttpError::bad_request("missing Content-Type header")),
    };
    let media = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();

    match media.as_str() {
        "application/json" => {
            let bytes = read_bounded(body, limits).await?;
            parse_json(&bytes)
        }
        "application/x-www-form-urlencoded" => {
            let bytes = read_bounded(body, limits).await?;
            Ok(parse_form(&bytes))
        }
        "multipart/form-data" => {
            let boundary = boundary_of(content_type)?;
            let bytes = read_bounded(body, limits).await?;
            parse_multipart(&bytes, &boundary)
        }
        other => Err(HttpError::unsupported_media_type(format!(
            "unsupported content type: {}",
            other
        ))),
    }
}

/// Accumulates body frames under the byte cap, bounded by the time cap.
async fn read_bounded<B>(mut body: B, limits: &BodyLimits) -> Result<Vec<u8>, HttpError>
where
    B: http_body::Body + Unpin,
    B::Error: std::fmt::Display,
{
    let deadline = Duration::from_millis(limits.timeout_ms);
    timeout(deadline, async {
        let mut buf = Vec::new();
        while let Some(next) = body.frame().await {
            let frame =
                next.map_err(|e| HttpError::bad_request(format!("body receive error: {}", e)))?;
            if let Ok(mut data) = frame.into_data() {
                if buf.len() + data.remaining() > limits.max_size {
                    return Err(HttpError::payload_too_large(
                        "request body exceeds the size cap",
                    ));
                }
                let chunk = data.copy_to_bytes(data.remaining());
                buf.extend_from_slice(&chunk);
            }
        }
        Ok(buf)
    })
    .await
    .map_err(|_| HttpError::timeout("request body read timed out"))?
}

fn parse_json(bytes: &[u8]) -> Result<Map<String, Value>, HttpError> {
    if bytes.is_empty() {
        return Ok(Map::new());
    }
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|_| HttpError::bad_request("invalid JSON body"))?;
    match value {
        Value::Object(map) => Ok(map),
        Value::Array(items) => {
            // Arrays merge index-keyed, mirroring an object assign.
            let mut map = Map::new();
            for (i, item) in items.into_iter().enumerate() {
                map.insert(i.to_string(), item);
            }
            Ok(map)
        }
        _ => Err(HttpError::bad_request(
            "JSON body must be an object or an array",
        )),
    }
}

fn parse_form(bytes: &[u8]) -> Map<String, Value> {
    let mut map = Map::new();
    for (key, value) in form_urlencoded::parse(bytes) {
        map.insert(key.into_owned(), Value::String(value.into_owned()));
    }
    map
}

fn boundary_of(content_type: &str) -> Result<String, HttpError> {
    content_type
        .split(';')
        .find_map(|part| part.trim().strip_prefix("boundary="))
        .map(|b| b.trim_matches('"').to_string())
        .filter(|b| !b.is_empty())
        .ok_or_else(|| HttpError::bad_request("multipart body without a boundary"))
}

/// Splits the raw body on the boundary delimiter; each part carries its
/// headers and value separated by a blank line. `Content-Disposition` is
/// mandatory and names the field.
fn parse_multipart(bytes: &[u8], boundary: &str) -> Result<Map<String, Value>, HttpError> {
    let text = String::from_utf8_lossy(bytes);
    let delimiter = format!("--{}", boundary);
    let mut payload = Map::new();

    for piece in text.split(delimiter.as_str()) {
        let piece = piece.strip_prefix("\r\n").unwrap_or(piece);
        if piece.is_empty() || piece.starts_with("--") {
            continue;
        }

        let (raw_headers, raw_value) = piece
            .split_once("\r\n\r\n")
            .ok_or_else(|| HttpError::bad_request("malformed multipart part"))?;

        let mut headers = Map::new();
        for line in raw_headers.split("\r\n") {
            if let Some((name, value)) = line.split_once(':') {
                headers.insert(
                    name.trim().to_ascii_lowercase(),
                    Value::String(value.trim().to_string()),
                );
            }
        }

        let disposition = headers
            .get("content-disposition")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                HttpError::bad_request("multipart part without Content-Disposition")
            })?;

        let name = disposition_param(disposition, "name").ok_or_else(|| {
            HttpError::bad_request("multipart part without a field name")
        })?;
        let filename = disposition_param(disposition, "filename");

        let value = raw_value.strip_suffix("\r\n").unwrap_or(raw_value);
        let entry = match filename {
            Some(filename) => {
                let mut part = Map::new();
                part.insert("filename".to_string(), Value::String(filename));
                part.insert("headers".to_string(), Value::Object(headers.clone()));
                part.insert("value".to_string(), Value::String(value.to_string()));
                Value::Object(part)
            }
            None => Value::String(value.to_string()),
        };
        payload.insert(name, entry);
    }

    Ok(payload)
}

fn disposition_param(disposition: &str, name: &str) -> Option<String> {
    let prefix = format!("{}=", name);
    disposition
        .split(';')
        .find_map(|part| part.trim().strip_prefix(prefix.as_str()))
        .map(|v| v.trim_matches('"').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http_body_util::Full;
    use serde_json::json;

    fn limits() -> BodyLimits {
        BodyLimits {
            max_size: 10 * 1024 * 1024,
            timeout_ms: 30_000,
        }
    }

    fn body(text: &str) -> Full<Bytes> {
        Full::new(Bytes::from(text.to_string()))
    }

    #[tokio::test]
    async fn test_missing_content_type_is_400() {
        let err = parse(None, body("{}"), &limits()).await.unwrap_err();
        assert_eq!(err.resolve().0, 400);
    }

    #[tokio::test]
    async fn test_json_object() {
        let payload = parse(Some("application/json"), body(r#"{"a":1,"b":"x"}"#), &limits())
            .await
            .unwrap();
        assert_eq!(payload["a"], json!(1));
        assert_eq!(payload["b"], json!("x"));
    }

    #[tokio::test]
    async fn test_json_array_is_index_keyed() {
        let payload = parse(Some("application/json"), body(r#"["x","y"]"#), &limits())
            .await
            .unwrap();
        assert_eq!(payload["0"], json!("x"));
        assert_eq!(payload["1"], json!("y"));
    }

    #[tokio::test]
    async fn test_json_scalar_rejected() {
        let err = parse(Some("application/json"), body("42"), &limits())
            .await
            .unwrap_err();
        assert_eq!(err.resolve().0, 400);
    }

    #[tokio::test]
    async fn test_json_empty_body_is_empty_map() {
        let payload = parse(Some("application/json"), body(""), &limits())
            .await
            .unwrap();
        assert!(payload.is_empty());
    }

    #[tokio::test]
    async fn test_json_invalid_is_400() {
        let err = parse(Some("application/json"), body("{nope"), &limits())
            .await
            .unwrap_err();
        assert_eq!(err.resolve().0, 400);
    }

    #[tokio::test]
    async fn test_oversize_body_is_413() {
        let small = BodyLimits {
            max_size: 100,
            timeout_ms: 30_000,
        };
        let payload = "x".repeat(200);
        let err = parse(
            Some("application/json"),
            body(&format!(r#"{{"k":"{}"}}"#, payload)),
            &small,
        )
        .await
        .unwrap_err();
        assert_eq!(err.resolve().0, 413);
    }

    #[tokio::test]
    async fn test_form_urlencoded() {
        let payload = parse(
            Some("application/x-www-form-urlencoded"),
            body("a=1&b=hello%20world"),
            &limits(),
        )
        .await
        .unwrap();
        assert_eq!(payload["a"], json!("1"));
        assert_eq!(payload["b"], json!("hello world"));
    }

    #[tokio::test]
    async fn test_unknown_content_type_is_415() {
        let err = parse(Some("text/csv"), body("a,b"), &limits())
            .await
            .unwrap_err();
        assert_eq!(err.resolve().0, 415);
    }

    #[tokio::test]
    async fn test_multipart_fields_and_files() {
        let raw = "--B\r\nContent-Disposition: form-data; name=\"field1\"\r\n\r\nvalue1\r\n\
                   --B\r\nContent-Disposition: form-data; name=\"file1\"; filename=\"a.txt\"\r\n\
                   Content-Type: text/plain\r\n\r\nfile body\r\n--B--\r\n";
        let payload = parse(
            Some("multipart/form-data; boundary=B"),
            body(raw),
            &limits(),
        )
        .await
        .unwrap();

        assert_eq!(payload["field1"], json!("value1"));
        let file = payload["file1"].as_object().unwrap();
        assert_eq!(file["filename"], json!("a.txt"));
        assert_eq!(file["value"], json!("file body"));
        assert_eq!(
            file["headers"]["content-type"],
            json!("text/plain")
        );
    }

    #[tokio::test]
    async fn test_multipart_without_boundary_is_400() {
        let err = parse(Some("multipart/form-data"), body("x"), &limits())
            .await
            .unwrap_err();
        assert_eq!(err.resolve().0, 400);
    }

    #[tokio::test]
    async fn test_multipart_without_disposition_is_400() {
        let raw = "--B\r\nContent-Type: text/plain\r\n\r\noops\r\n--B--\r\n";
        let err = parse(
            Some("multipart/form-data; boundary=B"),
            body(raw),
            &limits(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.resolve().0, 400);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_body_is_408() {
        struct NeverBody;
        impl http_body::Body for NeverBody {
            type Data = Bytes;
            type Error = std::convert::Infallible;

            fn poll_frame(
                self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
            ) -> std::task::Poll<Option<Result<http_body::Frame<Bytes>, Self::Error>>>
            {
                std::task::Poll::Pending
            }
        }

        let short = BodyLimits {
            max_size: 1024,
            timeout_ms: 50,
        };
        let err = parse(Some("application/json"), NeverBody, &short)
            .await
            .unwrap_err();
        assert_eq!(err.resolve().0, 408);
    }
}
