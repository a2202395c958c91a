//! Turning what the user typed into a SIP request URI.

use super::error::CallError;

fn strip_scheme(uri: &str) -> &str {
    uri.strip_prefix("sips:")
        .or_else(|| uri.strip_prefix("sip:"))
        .unwrap_or(uri)
}

/// `sip:2000@pbx.example.com;transport=ws` → `pbx.example.com`.
pub fn uri_domain(uri: &str) -> Option<&str> {
    let rest = strip_scheme(uri.trim().trim_start_matches('<').trim_end_matches('>'));
    let (_, host) = rest.split_once('@')?;
    let host = host.split([';', '?', '>']).next().unwrap_or(host);
    (!host.is_empty()).then_some(host)
}

/// `sip:2000@pbx.example.com` → `2000`.
pub fn uri_user(uri: &str) -> Option<&str> {
    let rest = strip_scheme(uri.trim().trim_start_matches('<'));
    let (user, _) = rest.split_once('@')?;
    (!user.is_empty()).then_some(user)
}

/// `sip:pbx.example.com:5060;lr` → `pbx.example.com`.
pub fn proxy_host(proxy: &str) -> Option<&str> {
    let rest = strip_scheme(proxy.trim());
    let rest = rest.rsplit_once('@').map_or(rest, |(_, host)| host);
    let host_port = rest.split([';', '?', '/']).next().unwrap_or(rest);
    let host = if let Some(v6) = host_port.strip_prefix('[') {
        v6.split(']').next().unwrap_or(v6)
    } else {
        host_port.split(':').next().unwrap_or(host_port)
    };
    (!host.is_empty()).then_some(host)
}

fn is_dial_string(target: &str) -> bool {
    target.chars().any(|c| c.is_ascii_digit())
        && target
            .chars()
            .all(|c| c.is_ascii_digit() || "+*#-(). ".contains(c))
}

/// Normalizes a call target against the own registered URI.
///
/// Qualified targets are kept (`user@host` gains a `sip:` prefix). A bare
/// user or telephone number takes the domain of `own_uri`. The proxy is only
/// a fallback: its host is used when the own URI carries no domain, and a
/// configured proxy never overrides the own domain. Dial-string punctuation
/// is removed from telephone numbers.
pub fn normalize_target(
    target: &str,
    own_uri: &str,
    proxy: Option<&str>,
) -> Result<String, CallError> {
    let target = target.trim();
    if target.is_empty() {
        return Err(CallError::InvalidTarget("empty target".into()));
    }
    if target.starts_with("sip:") || target.starts_with("sips:") {
        return Ok(target.to_owned());
    }
    if target.contains('@') {
        return Ok(format!("sip:{target}"));
    }

    let user: String = if is_dial_string(target) {
        target.chars().filter(|c| !"-(). ".contains(*c)).collect()
    } else if target.chars().any(char::is_whitespace) {
        return Err(CallError::InvalidTarget(target.to_owned()));
    } else {
        target.to_owned()
    };

    let domain = uri_domain(own_uri)
        .or_else(|| proxy.and_then(proxy_host))
        .ok_or_else(|| CallError::InvalidTarget(format!("no domain known for {target}")))?;
    Ok(format!("sip:{user}@{domain}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const OWN: &str = "sip:2000@pbx.example.com";

    #[test]
    fn test_bare_extension_takes_own_domain() {
        assert_eq!(
            normalize_target("1001", OWN, None).unwrap(),
            "sip:1001@pbx.example.com"
        );
    }

    #[test]
    fn test_qualified_targets_are_kept() {
        assert_eq!(
            normalize_target("sips:alice@example.org", OWN, None).unwrap(),
            "sips:alice@example.org"
        );
        assert_eq!(
            normalize_target("bob@example.org", OWN, None).unwrap(),
            "sip:bob@example.org"
        );
    }

    #[test]
    fn test_phone_number_punctuation_is_stripped() {
        assert_eq!(
            normalize_target(" +1 (555) 010-9999 ", OWN, None).unwrap(),
            "sip:+15550109999@pbx.example.com"
        );
        assert_eq!(
            normalize_target("555.0100", OWN, None).unwrap(),
            "sip:5550100@pbx.example.com"
        );
    }

    #[test]
    fn test_proxy_host_used_when_own_uri_has_no_domain() {
        assert_eq!(
            normalize_target("1001", "2000", Some("sip:proxy.example.net:5060;lr")).unwrap(),
            "sip:1001@proxy.example.net"
        );
        assert!(matches!(
            normalize_target("1001", "2000", None),
            Err(CallError::InvalidTarget(_))
        ));
    }

    #[test]
    fn test_own_domain_wins_over_configured_proxy() {
        assert_eq!(
            normalize_target("1001", OWN, Some("sip:proxy.example.net")).unwrap(),
            "sip:1001@pbx.example.com"
        );
    }

    #[test]
    fn test_rejects_empty_and_garbage() {
        assert!(normalize_target("   ", OWN, None).is_err());
        assert!(normalize_target("hello world", OWN, None).is_err());
    }

    #[test]
    fn test_uri_parts() {
        assert_eq!(uri_domain("<sip:2000@pbx.example.com;transport=ws>"), Some("pbx.example.com"));
        assert_eq!(uri_user(OWN), Some("2000"));
        assert_eq!(proxy_host("sip:[2001:db8::1]:5060"), Some("2001:db8::1"));
        assert_eq!(uri_domain("sip:pbx.example.com"), None);
    }
}
