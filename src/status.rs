//! Status code and content-type helpers.

use serde_json::Value;

/// Canonical reason phrase for a status code, empty string when unknown.
pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        402 => "Payment Required",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        412 => "Precondition Failed",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        417 => "Expectation Failed",
        418 => "I'm a Teapot",
        422 => "Unprocessable Entity",
        425 => "Too Early",
        426 => "Upgrade Required",
        428 => "Precondition Required",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        451 => "Unavailable For Legal Reasons",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        507 => "Insufficient Storage",
        511 => "Network Authentication Required",
        _ => "",
    }
}

/// Reverse lookup: maps a reason phrase (case-insensitive) to its status code.
pub fn phrase_to_code(message: &str) -> Option<u16> {
    let needle = message.trim();
    if needle.is_empty() {
        return None;
    }
    for code in 100..=599u16 {
        let phrase = reason_phrase(code);
        if !phrase.is_empty() && phrase.eq_ignore_ascii_case(needle) {
            return Some(code);
        }
    }
    None
}

/// An integer is a valid status code when it falls in [100, 599].
pub fn is_status_code(n: i64) -> bool {
    (100..=599).contains(&n)
}

/// Infers a content type from the kind of value being dispatched.
///
/// Objects and arrays serialize as JSON. Strings that open with an HTML
/// preamble are served as HTML; everything else goes out as plain text.
pub fn infer_content_type(value: &Value) -> &'static str {
    match value {
        Value::Object(_) | Value::Array(_) => "application/json",
        Value::String(s) => {
            let head = s.trim_start().to_ascii_lowercase();
            if head.starts_with("<!doctype") || head.starts_with("<html") {
                "text/html"
            } else {
                "text/plain"
            }
        }
        _ => "text/plain",
    }
}
