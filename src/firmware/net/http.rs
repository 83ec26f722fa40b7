use alloc::{collections::BTreeSet, string::String};
use core::fmt::Write as _;

pub(crate) const STATUS_OK: &str = "200 OK";
pub(crate) const STATUS_BAD_REQUEST: &str = "400 Bad Request";
pub(crate) const STATUS_NOT_FOUND: &str = "404 Not Found";

/// Frames a POST with host, the registered headers in set order and a
/// content length matching `body`.
pub(crate) fn build_post(
    resource: &str,
    host_header: &str,
    headers: &BTreeSet<String>,
    body: &str,
) -> String {
    let mut request = String::with_capacity(96 + body.len());
    let _ = write!(request, "POST {} HTTP/1.1\r\n", resource);
    let _ = write!(request, "Host: {}\r\n", host_header);
    for header in headers {
        request.push_str(header);
        request.push_str("\r\n");
    }
    let _ = write!(request, "Content-Length: {}\r\n\r\n", body.len());
    request.push_str(body);
    request
}

pub(crate) fn render_response(status: &str, content_type: &str, body: &str) -> String {
    let mut response = String::with_capacity(80 + body.len());
    let _ = write!(response, "HTTP/1.1 {}\r\n", status);
    let _ = write!(response, "Content-type: {}\r\n", content_type);
    let _ = write!(response, "Content-Length: {}\r\n\r\n", body.len());
    response.push_str(body);
    response
}

pub(crate) fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|window| window == b"\r\n\r\n")
}

pub(crate) fn parse_request_line(header: &str) -> Option<(&str, &str)> {
    let first_line = header.lines().next()?;
    let mut parts = first_line.split_ascii_whitespace();
    let method = parts.next()?;
    let target = parts.next()?;
    let version = parts.next()?;
    if !version.starts_with("HTTP/1.") {
        return None;
    }
    Some((method, target))
}

/// Status code from a `HTTP/1.x NNN reason` line.
pub(crate) fn parse_status_code(reply: &[u8]) -> Option<u16> {
    let line_end = reply
        .windows(2)
        .position(|window| window == b"\r\n")
        .unwrap_or(reply.len());
    let line = core::str::from_utf8(&reply[..line_end]).ok()?;
    let mut parts = line.split_ascii_whitespace();
    if !parts.next()?.starts_with("HTTP/1.") {
        return None;
    }
    let code = parts.next()?;
    if code.len() != 3 {
        return None;
    }
    code.parse::<u16>().ok()
}

pub(crate) fn parse_content_length(header: &str) -> Result<Option<usize>, &'static str> {
    let mut content_length = None;

    for line in header.lines().skip(1) {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };

        if !name.eq_ignore_ascii_case("content-length") {
            continue;
        }

        let parsed = value
            .trim()
            .parse::<usize>()
            .map_err(|_| "invalid content-length")?;

        if content_length.is_some() {
            return Err("duplicate content-length");
        }

        content_length = Some(parsed);
    }

    Ok(content_length)
}

/// Body bytes after the header block, trimmed to Content-Length when the
/// peer sent one.
pub(crate) fn response_body(reply: &[u8]) -> &[u8] {
    let Some(end) = find_header_end(reply) else {
        return &[];
    };
    let body = &reply[end + 4..];
    let declared = core::str::from_utf8(&reply[..end])
        .ok()
        .and_then(|header| parse_content_length(header).ok().flatten());
    match declared {
        Some(len) if len < body.len() => &body[..len],
        _ => body,
    }
}

pub(crate) fn target_path(target: &str) -> &str {
    target.split('?').next().unwrap_or(target)
}
