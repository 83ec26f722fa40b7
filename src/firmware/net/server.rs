use alloc::string::String;
use core::fmt::Write as _;

use super::{http, registry::RequestHandler};
use crate::firmware::config::{GENERATOR, VERSION};

const ID_MAX: usize = 36;
const CONTENT_TYPE_JSON: &str = "application/json";

/// What the status page shows for one channel.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ChannelView<'a> {
    pub uuid: &'a str,
    pub last_ts_ms: Option<u64>,
    pub last_value: Option<f64>,
    pub interval_s: u32,
    pub protocol: &'static str,
}

/// Read-only access to every configured channel.
pub trait StatusSource {
    fn visit_channels(&self, visitor: &mut dyn FnMut(ChannelView<'_>));
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Query<'a> {
    All,
    Channel(&'a str),
}

/// Answers `GET /<uuid>` and, when enabled, `GET /` with the JSON status
/// document.
pub struct StatusServer<'a, S: StatusSource + ?Sized> {
    source: &'a S,
    index_enabled: bool,
}

impl<'a, S: StatusSource + ?Sized> StatusServer<'a, S> {
    pub fn new(source: &'a S, index_enabled: bool) -> Self {
        Self {
            source,
            index_enabled,
        }
    }

    fn parse<'r>(&self, request: &'r str) -> Option<Query<'r>> {
        let (method, target) = http::parse_request_line(request)?;
        if method != "GET" {
            return None;
        }
        let path = http::target_path(target).strip_prefix('/')?;
        if path.is_empty() {
            return self.index_enabled.then_some(Query::All);
        }
        let valid = path.len() <= ID_MAX
            && path
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        valid.then_some(Query::Channel(path))
    }

    /// Full HTTP response for `request`.
    pub fn render(&self, request: &str) -> String {
        let Some(query) = self.parse(request) else {
            log::warn!("httpd: invalid request line={}", first_line(request));
            return http::render_response(http::STATUS_BAD_REQUEST, CONTENT_TYPE_JSON, "");
        };

        let mut body = String::with_capacity(256);
        let _ = write!(
            body,
            "{{ \"version\": \"{}\", \"generator\": \"{}\", \"data\": [",
            VERSION, GENERATOR
        );
        let mut matched = 0usize;
        self.source.visit_channels(&mut |channel| {
            let selected = match query {
                Query::All => true,
                Query::Channel(uuid) => channel.uuid == uuid,
            };
            if !selected {
                return;
            }
            if matched > 0 {
                body.push(',');
            }
            matched += 1;
            push_channel(&mut body, &channel);
        });
        body.push_str(" ]}");

        let status = if matched > 0 {
            http::STATUS_OK
        } else {
            http::STATUS_NOT_FOUND
        };
        log::debug!("httpd: query={:?} matched={} status={}", query, matched, status);
        http::render_response(status, CONTENT_TYPE_JSON, &body)
    }
}

impl<S: StatusSource + ?Sized> RequestHandler for StatusServer<'_, S> {
    fn process(&mut self, request: &str) -> Option<String> {
        Some(self.render(request))
    }
}

fn push_channel(body: &mut String, channel: &ChannelView<'_>) {
    let last = channel.last_ts_ms.unwrap_or(0);
    let _ = write!(
        body,
        " {{ \"uuid\": \"{}\", \"last\": {}, \"interval\": {}, \"protocol\": \"{}\", \"tuples\": [",
        channel.uuid, last, channel.interval_s, channel.protocol
    );
    if let (Some(ts), Some(value)) = (channel.last_ts_ms, channel.last_value) {
        let _ = write!(body, " [ {}, {:.2} ] ", ts, value);
    }
    body.push_str("] }");
}

fn first_line(request: &str) -> &str {
    request.lines().next().unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    struct Channels(Vec<ChannelView<'static>>);

    impl StatusSource for Channels {
        fn visit_channels(&self, visitor: &mut dyn FnMut(ChannelView<'_>)) {
            for channel in &self.0 {
                visitor(*channel);
            }
        }
    }

    fn channels() -> Channels {
        Channels(alloc::vec![
            ChannelView {
                uuid: "abc",
                last_ts_ms: Some(1_700_000_000_000),
                last_value: Some(3.5),
                interval_s: 60,
                protocol: "analog",
            },
            ChannelView {
                uuid: "d2f1-77",
                last_ts_ms: None,
                last_value: None,
                interval_s: 300,
                protocol: "selfmon",
            },
        ])
    }

    fn body(response: &str) -> &str {
        response.split_once("\r\n\r\n").map(|(_, body)| body).unwrap_or("")
    }

    #[test]
    fn known_channel_is_reported() {
        let source = channels();
        let server = StatusServer::new(&source, true);
        let response = server.render("GET /abc HTTP/1.1\r\nHost: logger\r\n\r\n");

        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("Content-type: application/json\r\n"));
        let body = body(&response);
        assert!(response.contains(&alloc::format!("Content-Length: {}\r\n", body.len())));
        assert!(body.contains("\"uuid\": \"abc\""));
        assert!(body.contains("\"interval\": 60"));
        assert!(body.contains("[ 1700000000000, 3.50 ]"));
        assert!(!body.contains("d2f1-77"));
    }

    #[test]
    fn unknown_channel_is_404_with_empty_data() {
        let source = channels();
        let server = StatusServer::new(&source, true);
        let response = server.render("GET /xyz HTTP/1.1\r\n\r\n");

        assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(body(&response).ends_with("\"data\": [ ]}"));
    }

    #[test]
    fn index_lists_every_channel() {
        let source = channels();
        let server = StatusServer::new(&source, true);
        let response = server.render("GET / HTTP/1.1\r\n\r\n");
        let body = body(&response);

        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(body.contains("\"uuid\": \"abc\""));
        assert!(body.contains("\"uuid\": \"d2f1-77\", \"last\": 0, \"interval\": 300"));
        assert!(body.contains("\"tuples\": [] }"));
    }

    #[test]
    fn index_can_be_disabled() {
        let source = channels();
        let server = StatusServer::new(&source, false);
        let response = server.render("GET / HTTP/1.1\r\n\r\n");
        assert!(response.starts_with("HTTP/1.1 400 Bad Request"));
        assert!(response.ends_with("Content-Length: 0\r\n\r\n"));
    }

    #[test]
    fn malformed_requests_get_400() {
        let source = channels();
        let mut server = StatusServer::new(&source, true);
        for request in [
            "POST /abc HTTP/1.1\r\n\r\n",
            "GET /abc",
            "GET /a.b HTTP/1.1\r\n\r\n",
            "GET /0123456789012345678901234567890123456 HTTP/1.1\r\n\r\n",
            "",
        ] {
            let response = server.process(request).unwrap();
            assert!(response.starts_with("HTTP/1.1 400"), "{request:?}");
        }
    }

    #[test]
    fn query_string_is_ignored() {
        let source = channels();
        let server = StatusServer::new(&source, true);
        let response = server.render("GET /abc?pretty=1 HTTP/1.1\r\n\r\n");
        assert!(response.starts_with("HTTP/1.1 200 OK"));
    }
}
