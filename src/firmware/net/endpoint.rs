use alloc::{format, string::String};

const HOST_MAX: usize = 127;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndpointError {
    MissingScheme,
    UnsupportedScheme,
    MissingHost,
    MissingPort,
    InvalidPort,
    TooLong,
}

impl EndpointError {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MissingScheme => "endpoint missing scheme",
            Self::UnsupportedScheme => "endpoint scheme not http/https",
            Self::MissingHost => "endpoint missing host",
            Self::MissingPort => "endpoint needs an explicit port",
            Self::InvalidPort => "endpoint port invalid",
            Self::TooLong => "endpoint host too long",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

/// `scheme://host:port` plus the optional path that followed it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    scheme: Scheme,
    host: String,
    port: u16,
    path: String,
}

impl Endpoint {
    pub fn parse(url: &str) -> Result<Self, EndpointError> {
        let (scheme, rest) = url.split_once("://").ok_or(EndpointError::MissingScheme)?;
        let scheme = if scheme.eq_ignore_ascii_case("http") {
            Scheme::Http
        } else if scheme.eq_ignore_ascii_case("https") {
            Scheme::Https
        } else {
            return Err(EndpointError::UnsupportedScheme);
        };

        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, ""),
        };
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        };
        if host.is_empty() {
            return Err(EndpointError::MissingHost);
        }
        if host.len() > HOST_MAX {
            return Err(EndpointError::TooLong);
        }
        let port = port.ok_or(EndpointError::MissingPort)?;
        let port = port
            .parse::<u16>()
            .map_err(|_| EndpointError::InvalidPort)?;
        if port == 0 {
            return Err(EndpointError::InvalidPort);
        }

        Ok(Self {
            scheme,
            host: String::from(host),
            port,
            path: String::from(path.trim_end_matches('/')),
        })
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_secure(&self) -> bool {
        matches!(self.scheme, Scheme::Https)
    }

    /// Registry identity: the path is deliberately not part of it.
    pub fn key(&self) -> String {
        format!("{}://{}:{}", self.scheme.as_str(), self.host, self.port)
    }

    pub fn host_header(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_port_and_path() {
        let endpoint = Endpoint::parse("http://coll.example:8080/middleware.php/").unwrap();
        assert_eq!(endpoint.scheme(), Scheme::Http);
        assert_eq!(endpoint.host(), "coll.example");
        assert_eq!(endpoint.port(), 8080);
        assert_eq!(endpoint.path(), "/middleware.php");
        assert_eq!(endpoint.key(), "http://coll.example:8080");
        assert_eq!(endpoint.host_header(), "coll.example:8080");
    }

    #[test]
    fn https_marks_endpoint_secure() {
        let endpoint = Endpoint::parse("https://vz.example:443").unwrap();
        assert!(endpoint.is_secure());
        assert_eq!(endpoint.path(), "");
    }

    #[test]
    fn port_is_mandatory() {
        assert_eq!(
            Endpoint::parse("http://coll.example/middleware.php"),
            Err(EndpointError::MissingPort)
        );
    }

    #[test]
    fn rejects_malformed_urls() {
        assert_eq!(
            Endpoint::parse("coll.example:80"),
            Err(EndpointError::MissingScheme)
        );
        assert_eq!(
            Endpoint::parse("ftp://coll.example:21"),
            Err(EndpointError::UnsupportedScheme)
        );
        assert_eq!(
            Endpoint::parse("http://:80"),
            Err(EndpointError::MissingHost)
        );
        assert_eq!(
            Endpoint::parse("http://coll.example:http"),
            Err(EndpointError::InvalidPort)
        );
        assert_eq!(
            Endpoint::parse("http://coll.example:0"),
            Err(EndpointError::InvalidPort)
        );
    }
}
