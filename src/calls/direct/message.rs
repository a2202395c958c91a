//! Plain-text SIP messages as carried over a WebSocket (RFC 7118).

use super::stack::SipError;
use std::fmt;

/// Full header names for the compact forms a relay may send.
fn expand_compact(name: &str) -> &str {
    match name {
        "v" => "Via",
        "f" => "From",
        "t" => "To",
        "i" => "Call-ID",
        "m" => "Contact",
        "l" => "Content-Length",
        "c" => "Content-Type",
        "k" => "Supported",
        _ => name,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    Request { method: String, uri: String },
    Response { code: u16, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipMessage {
    pub start: StartLine,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl SipMessage {
    pub fn request(method: &str, uri: &str) -> Self {
        Self {
            start: StartLine::Request {
                method: method.to_owned(),
                uri: uri.to_owned(),
            },
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn response(code: u16, reason: &str) -> Self {
        Self {
            start: StartLine::Response {
                code,
                reason: reason.to_owned(),
            },
            headers: Vec::new(),
            body: String::new(),
        }
    }

    /// A response to `request` copying the headers that identify the
    /// transaction.
    pub fn response_to(request: &SipMessage, code: u16, reason: &str) -> Self {
        let mut response = Self::response(code, reason);
        for name in ["Via", "From", "To", "Call-ID", "CSeq"] {
            for value in request.header_all(name) {
                response.headers.push((name.to_owned(), value.to_owned()));
            }
        }
        response
    }

    pub fn parse(text: &str) -> Result<Self, SipError> {
        let (head, body) = text
            .split_once("\r\n\r\n")
            .or_else(|| text.split_once("\n\n"))
            .unwrap_or((text, ""));
        let mut lines = head.lines();
        let first = lines
            .next()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .ok_or_else(|| SipError::Parse("empty message".into()))?;

        let start = if let Some(rest) = first.strip_prefix("SIP/2.0 ") {
            let (code, reason) = rest.split_once(' ').unwrap_or((rest, ""));
            let code = code
                .parse()
                .map_err(|_| SipError::Parse(format!("bad status line: {first}")))?;
            StartLine::Response {
                code,
                reason: reason.to_owned(),
            }
        } else {
            let mut parts = first.split_whitespace();
            match (parts.next(), parts.next(), parts.next()) {
                (Some(method), Some(uri), Some("SIP/2.0")) => StartLine::Request {
                    method: method.to_owned(),
                    uri: uri.to_owned(),
                },
                _ => return Err(SipError::Parse(format!("bad request line: {first}"))),
            }
        };

        let mut headers: Vec<(String, String)> = Vec::new();
        for line in lines {
            if line.starts_with([' ', '\t']) {
                // Folded continuation of the previous header.
                if let Some((_, value)) = headers.last_mut() {
                    value.push(' ');
                    value.push_str(line.trim());
                }
                continue;
            }
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            headers.push((expand_compact(name.trim()).to_owned(), value.trim().to_owned()));
        }

        let mut message = Self {
            start,
            headers,
            body: body.to_owned(),
        };
        if let Some(len) = message.header("Content-Length").and_then(|l| l.parse::<usize>().ok())
            && len <= message.body.len()
        {
            if !message.body.is_char_boundary(len) {
                return Err(SipError::Parse(format!(
                    "Content-Length {len} splits a character"
                )));
            }
            message.body.truncate(len);
        }
        Ok(message)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn header_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_owned(), value.into()));
        self
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.headers.push((name.to_owned(), value.into()));
    }

    pub fn with_body(mut self, content_type: &str, body: impl Into<String>) -> Self {
        self.body = body.into();
        self.set_header("Content-Type", content_type);
        self
    }

    pub fn method(&self) -> Option<&str> {
        match &self.start {
            StartLine::Request { method, .. } => Some(method),
            StartLine::Response { .. } => None,
        }
    }

    pub fn request_uri(&self) -> Option<&str> {
        match &self.start {
            StartLine::Request { uri, .. } => Some(uri),
            StartLine::Response { .. } => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match &self.start {
            StartLine::Response { code, .. } => Some(*code),
            StartLine::Request { .. } => None,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match &self.start {
            StartLine::Response { reason, .. } if !reason.is_empty() => Some(reason),
            _ => None,
        }
    }

    pub fn call_id(&self) -> Option<&str> {
        self.header("Call-ID")
    }

    /// Sequence number and method from `CSeq`.
    pub fn cseq(&self) -> Option<(u32, &str)> {
        let (seq, method) = self.header("CSeq")?.split_once(' ')?;
        Some((seq.trim().parse().ok()?, method.trim()))
    }

    pub fn has_sdp(&self) -> bool {
        !self.body.is_empty()
            && self
                .header("Content-Type")
                .is_some_and(|t| t.eq_ignore_ascii_case("application/sdp"))
    }
}

impl fmt::Display for SipMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.start {
            StartLine::Request { method, uri } => write!(f, "{method} {uri} SIP/2.0\r\n")?,
            StartLine::Response { code, reason } => write!(f, "SIP/2.0 {code} {reason}\r\n")?,
        }
        for (name, value) in &self.headers {
            if !name.eq_ignore_ascii_case("Content-Length") {
                write!(f, "{name}: {value}\r\n")?;
            }
        }
        write!(f, "Content-Length: {}\r\n\r\n{}", self.body.len(), self.body)
    }
}

/// Value of `;name=value` in a header such as `From` or `Via`.
pub fn header_param<'a>(value: &'a str, name: &str) -> Option<&'a str> {
    value.split(';').skip(1).find_map(|param| {
        let (key, val) = param.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case(name)
            .then(|| val.trim().trim_matches('"'))
    })
}

/// The URI inside a name-addr (`"Alice" <sip:alice@host>;tag=1`).
pub fn addr_uri(value: &str) -> &str {
    match (value.find('<'), value.find('>')) {
        (Some(start), Some(end)) if start < end => &value[start + 1..end],
        _ => value.split(';').next().unwrap_or(value).trim(),
    }
}

/// The quoted or bare display name in front of `<`, if any.
pub fn addr_display_name(value: &str) -> Option<String> {
    let (name, _) = value.split_once('<')?;
    let name = name.trim().trim_matches('"').trim();
    (!name.is_empty()).then(|| name.to_owned())
}
