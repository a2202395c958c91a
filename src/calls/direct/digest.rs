//! HTTP digest authentication (RFC 2617) for REGISTER and INVITE challenges.

fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input))
}

/// The parameters of a `WWW-Authenticate` / `Proxy-Authenticate` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    pub algorithm: Option<String>,
    /// Offered qop values. Only `auth` is supported.
    pub qop: Vec<String>,
}

impl Challenge {
    pub fn parse(header: &str) -> Option<Self> {
        let params = header.trim().strip_prefix("Digest")?;
        let mut realm = None;
        let mut nonce = None;
        let mut opaque = None;
        let mut algorithm = None;
        let mut qop = Vec::new();

        for (key, value) in split_params(params) {
            match key.to_ascii_lowercase().as_str() {
                "realm" => realm = Some(value),
                "nonce" => nonce = Some(value),
                "opaque" => opaque = Some(value),
                "algorithm" => algorithm = Some(value),
                "qop" => qop = value.split(',').map(|q| q.trim().to_owned()).collect(),
                _ => {}
            }
        }

        Some(Self {
            realm: realm?,
            nonce: nonce?,
            opaque,
            algorithm,
            qop,
        })
    }

    pub fn supports_auth_qop(&self) -> bool {
        self.qop.iter().any(|q| q.eq_ignore_ascii_case("auth"))
    }
}

/// Splits `a="x, y", b=z` at commas outside quotes.
fn split_params(params: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for ch in params.chars().chain(std::iter::once(',')) {
        match ch {
            '"' => {
                quoted = !quoted;
                current.push(ch);
            }
            ',' if !quoted => {
                if let Some((key, value)) = current.split_once('=') {
                    out.push((key.trim().to_owned(), value.trim().trim_matches('"').to_owned()));
                }
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    out
}

/// Everything needed to answer one challenge.
#[derive(Debug, Clone)]
pub struct DigestCredentials<'a> {
    pub username: &'a str,
    pub password: &'a str,
    pub method: &'a str,
    pub uri: &'a str,
}

/// Computes the `response` value. With qop `auth`, `nc` and `cnonce` are
/// mixed in as RFC 2617 §3.2.2.1 describes.
pub fn digest_response(
    challenge: &Challenge,
    creds: &DigestCredentials<'_>,
    qop: Option<(&str, &str)>,
) -> String {
    let ha1 = md5_hex(&format!(
        "{}:{}:{}",
        creds.username, challenge.realm, creds.password
    ));
    let ha2 = md5_hex(&format!("{}:{}", creds.method, creds.uri));
    match qop {
        Some((nc, cnonce)) => md5_hex(&format!(
            "{ha1}:{}:{nc}:{cnonce}:auth:{ha2}",
            challenge.nonce
        )),
        None => md5_hex(&format!("{ha1}:{}:{ha2}", challenge.nonce)),
    }
}

/// Builds the `Authorization` / `Proxy-Authorization` header value.
pub fn authorization_header(
    challenge: &Challenge,
    creds: &DigestCredentials<'_>,
    cnonce: &str,
) -> String {
    let nc = "00000001";
    let qop = challenge.supports_auth_qop().then_some((nc, cnonce));
    let response = digest_response(challenge, creds, qop);

    let mut header = format!(
        "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{response}\", algorithm={}",
        creds.username,
        challenge.realm,
        challenge.nonce,
        creds.uri,
        challenge.algorithm.as_deref().unwrap_or("MD5"),
    );
    if let Some(opaque) = &challenge.opaque {
        header.push_str(&format!(", opaque=\"{opaque}\""));
    }
    if qop.is_some() {
        header.push_str(&format!(", qop=auth, nc={nc}, cnonce=\"{cnonce}\""));
    }
    header
}

#[cfg(test)]
mod tests {
    use super::*;

    const RFC_CHALLENGE: &str = r#"Digest realm="testrealm@host.com", qop="auth,auth-int", nonce="dcd98b7102dd2f0e8b11d0f600bfb0c093", opaque="5ccc069c403ebaf9f0171e9517f40e41""#;

    #[test]
    fn test_parse_challenge() {
        let challenge = Challenge::parse(RFC_CHALLENGE).unwrap();
        assert_eq!(challenge.realm, "testrealm@host.com");
        assert_eq!(challenge.nonce, "dcd98b7102dd2f0e8b11d0f600bfb0c093");
        assert_eq!(challenge.qop, vec!["auth", "auth-int"]);
        assert!(challenge.supports_auth_qop());
        assert!(Challenge::parse("Basic realm=\"x\"").is_none());
        assert!(Challenge::parse("Digest realm=\"x\"").is_none());
    }

    #[test]
    fn test_rfc2617_response_vector() {
        let challenge = Challenge::parse(RFC_CHALLENGE).unwrap();
        let creds = DigestCredentials {
            username: "Mufasa",
            password: "Circle Of Life",
            method: "GET",
            uri: "/dir/index.html",
        };
        assert_eq!(
            digest_response(&challenge, &creds, Some(("00000001", "0a4f113b"))),
            "6629fae49393a05397450978507c4ef1"
        );

        let header = authorization_header(&challenge, &creds, "0a4f113b");
        assert!(header.contains("response=\"6629fae49393a05397450978507c4ef1\""));
        assert!(header.contains("opaque=\"5ccc069c403ebaf9f0171e9517f40e41\""));
        assert!(header.contains("qop=auth, nc=00000001"));
    }

    #[test]
    fn test_response_without_qop() {
        let challenge = Challenge::parse(r#"Digest realm="asterisk", nonce="1a2b3c""#).unwrap();
        let creds = DigestCredentials {
            username: "1001",
            password: "secret",
            method: "REGISTER",
            uri: "sip:pbx.example.com",
        };
        let ha1 = md5_hex("1001:asterisk:secret");
        let ha2 = md5_hex("REGISTER:sip:pbx.example.com");
        assert_eq!(
            digest_response(&challenge, &creds, None),
            md5_hex(&format!("{ha1}:1a2b3c:{ha2}"))
        );
        assert!(!authorization_header(&challenge, &creds, "x").contains("qop"));
    }
}
