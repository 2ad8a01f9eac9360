//! Header, certificate and protocol classification used by the probe.

/// Response headers in arrival order, names as sent by the server.
#[derive(Clone, Debug, Default)]
pub struct ResponseHeaders {
    entries: Vec<(String, String)>,
}

impl ResponseHeaders {
    pub fn push(&mut self, name: &str, value: &str) {
        self.entries
            .push((name.trim().to_string(), value.trim().to_string()));
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// First value for `name`, case-insensitive; empty when absent.
    pub fn get(&self, name: &str) -> &str {
        self.entries
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
            .unwrap_or("")
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProxyClassification {
    pub name: String,
    pub source: String,
    pub indicators: Vec<String>,
}

type Rule = (&'static [&'static str], &'static str);

const VIA_RULES: &[Rule] = &[
    (&["cloudfront"], "cloudfront"),
    (&["fastly"], "fastly"),
    (&["akamai"], "akamai"),
    (&["cachefly"], "cachefly"),
    (&["azureedge"], "azurecdn"),
    (&["cloudflare"], "cloudflare"),
    (&["zscaler"], "zscaler"),
    (&["bluecoat", "symantec"], "bluecoat"),
    (&["netskope"], "netskope"),
    (&["palosecure", "palo"], "paloalto"),
    (&["forcepoint"], "forcepoint"),
];

const X_CACHE_RULES: &[Rule] = &[
    (&["cloudfront"], "cloudfront"),
    (&["fastly"], "fastly"),
    (&["akam"], "akamai"),
    (&["cloudflare"], "cloudflare"),
    (&["cachefly"], "cachefly"),
    (&["zscaler"], "zscaler"),
];

const SERVER_RULES: &[Rule] = &[
    (&["cloudflare"], "cloudflare"),
    (&["cloudfront"], "cloudfront"),
    (&["fastly"], "fastly"),
    (&["akamai"], "akamai"),
    (&["varnish"], "varnish"),
    (&["squid"], "squid"),
    (&["nginx"], "nginx"),
    (&["apache"], "apache"),
    (&["zscaler"], "zscaler"),
    (&["bluecoat", "symantec"], "bluecoat"),
    (&["netskope"], "netskope"),
    (&["palosecure", "palo"], "paloalto"),
    (&["forcepoint"], "forcepoint"),
];

const CERT_RULES: &[Rule] = &[
    (&["zscaler"], "zscaler"),
    (&["bluecoat", "symantec"], "bluecoat"),
    (&["netskope"], "netskope"),
    (&["palo alto", "palonetworks", "palosecure"], "paloalto"),
    (&["forcepoint"], "forcepoint"),
];

/// Corporate interception proxies, as opposed to CDN or origin server software.
pub const ENTERPRISE_PROXIES: &[&str] = &["zscaler", "bluecoat", "netskope", "paloalto", "forcepoint"];

fn match_rules(value: &str, rules: &[Rule]) -> Option<&'static str> {
    let lower = value.to_ascii_lowercase();
    rules
        .iter()
        .find(|(needles, _)| needles.iter().any(|needle| lower.contains(needle)))
        .map(|(_, name)| *name)
}

fn match_via(value: &str) -> Option<&'static str> {
    let lower = value.to_ascii_lowercase();
    // google's edge cache is only recognised when both words appear
    let google = lower.contains("google") && lower.contains("cache");
    match match_rules(value, &VIA_RULES[..6]) {
        Some(name) => Some(name),
        None if google => Some("google"),
        None => match_rules(value, &VIA_RULES[6..]),
    }
}

fn vendor_header(name: &str) -> Option<&'static str> {
    let lower = name.to_ascii_lowercase();
    if lower.starts_with("x-zscaler-") {
        Some("zscaler")
    } else if lower == "x-bluecoat-via" || lower == "x-bluecoat-request-id" {
        Some("bluecoat")
    } else if lower == "x-paloalto-metadata" || lower == "x-paloalto-app" {
        Some("paloalto")
    } else if lower.starts_with("x-netskope-") {
        Some("netskope")
    } else if lower.starts_with("x-forcepoint-") {
        Some("forcepoint")
    } else {
        None
    }
}

fn claim(result: &mut ProxyClassification, name: Option<&'static str>, source: &str) {
    if result.name.is_empty()
        && let Some(name) = name
    {
        result.name = name.to_string();
        result.source = source.to_string();
    }
}

pub fn classify_cert_proxy(subject: &str, issuer: &str) -> Option<&'static str> {
    let combined = format!("{issuer} {subject}");
    match_rules(&combined, CERT_RULES)
}

/// Walks Via, X-Cache, Server, vendor headers and finally the certificate;
/// the first rule that names a proxy wins. Indicators collect every signal seen.
pub fn classify_proxy(headers: &ResponseHeaders, cert_subject: &str, cert_issuer: &str) -> ProxyClassification {
    let mut result = ProxyClassification::default();

    let via = headers.get("Via");
    if !via.is_empty() {
        claim(&mut result, match_via(via), "via");
        result.indicators.push(format!("via:{via}"));
    }
    let x_cache = headers.get("X-Cache");
    if !x_cache.is_empty() {
        claim(&mut result, match_rules(x_cache, X_CACHE_RULES), "x-cache");
        result.indicators.push(format!("x-cache:{x_cache}"));
    }
    let server = headers.get("Server");
    if !server.is_empty() {
        claim(&mut result, match_rules(server, SERVER_RULES), "server");
        result.indicators.push(format!("server:{server}"));
    }
    for (name, value) in headers.iter() {
        if let Some(vendor) = vendor_header(name) {
            claim(&mut result, Some(vendor), name);
            result.indicators.push(format!("{name}:{value}"));
        }
    }
    if let Some(vendor) = classify_cert_proxy(cert_subject, cert_issuer) {
        claim(&mut result, Some(vendor), "tls_cert");
        result.indicators.push(format!("cert:{vendor}"));
    }
    result
}

/// Cache evidence: a positive `Age` or an `X-Cache` containing HIT.
pub fn cache_present(age: &str, x_cache: &str) -> bool {
    let aged = age.trim().parse::<i64>().map(|v| v > 0).unwrap_or(false);
    aged || x_cache.to_ascii_uppercase().contains("HIT")
}

/// `HTTP/2` and `h2` become `HTTP/2.0`; unknown tokens are upper-cased.
pub fn normalize_http_protocol(raw: &str) -> String {
    let token = raw.trim().to_ascii_uppercase();
    match token.as_str() {
        "" => String::new(),
        "HTTP/1.0" | "HTTP/1" => "HTTP/1.0".to_string(),
        "HTTP/1.1" => "HTTP/1.1".to_string(),
        "HTTP/2" | "HTTP/2.0" | "H2" | "H2C" => "HTTP/2.0".to_string(),
        "HTTP/3" | "HTTP/3.0" | "H3" => "HTTP/3.0".to_string(),
        _ => token,
    }
}

/// Maps an OpenSSL protocol name (`TLSv1.3`) onto the wire label (`TLS1.3`).
pub fn tls_version_label(raw: &str) -> String {
    match raw.trim() {
        "TLSv1.3" => "TLS1.3".to_string(),
        "TLSv1.2" => "TLS1.2".to_string(),
        "TLSv1.1" => "TLS1.1".to_string(),
        "TLSv1" | "TLSv1.0" => "TLS1.0".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::{
        ResponseHeaders, cache_present, classify_cert_proxy, classify_proxy,
        normalize_http_protocol, tls_version_label,
    };

    fn headers(pairs: &[(&str, &str)]) -> ResponseHeaders {
        let mut headers = ResponseHeaders::default();
        for (name, value) in pairs {
            headers.push(name, value);
        }
        headers
    }

    #[test]
    fn via_wins_over_later_rules() {
        let result = classify_proxy(
            &headers(&[
                ("Via", "1.1 abc.cloudfront.net (CloudFront)"),
                ("X-Cache", "Hit from fastly"),
                ("Server", "nginx"),
            ]),
            "",
            "",
        );
        assert_eq!(result.name, "cloudfront");
        assert_eq!(result.source, "via");
        assert_eq!(result.indicators.len(), 3);
        assert_eq!(result.indicators[1], "x-cache:Hit from fastly");
    }

    #[test]
    fn unmatched_via_falls_through_to_server() {
        let result = classify_proxy(&headers(&[("Via", "1.1 internal"), ("Server", "Varnish")]), "", "");
        assert_eq!(result.name, "varnish");
        assert_eq!(result.source, "server");
    }

    #[test]
    fn google_needs_cache_in_via() {
        let result = classify_proxy(&headers(&[("Via", "1.1 google")]), "", "");
        assert!(result.name.is_empty());
        let result = classify_proxy(&headers(&[("Via", "1.1 google cache")]), "", "");
        assert_eq!(result.name, "google");
    }

    #[test]
    fn vendor_headers_name_the_source() {
        let result = classify_proxy(&headers(&[("X-Zscaler-Transaction", "abc")]), "", "");
        assert_eq!(result.name, "zscaler");
        assert_eq!(result.source, "X-Zscaler-Transaction");
        assert_eq!(result.indicators, vec!["X-Zscaler-Transaction:abc".to_string()]);
    }

    #[test]
    fn certificate_is_the_last_resort() {
        let result = classify_proxy(&headers(&[]), "example.com", "Zscaler Intermediate Root CA");
        assert_eq!(result.name, "zscaler");
        assert_eq!(result.source, "tls_cert");
        assert_eq!(classify_cert_proxy("x", "Palo Alto Networks"), Some("paloalto"));
        assert_eq!(classify_cert_proxy("example.com", "Let's Encrypt"), None);
    }

    #[test]
    fn cache_evidence() {
        assert!(cache_present("12", ""));
        assert!(!cache_present("0", ""));
        assert!(cache_present("", "TCP_HIT from edge"));
        assert!(!cache_present("abc", "MISS"));
    }

    #[test]
    fn protocol_and_tls_labels() {
        assert_eq!(normalize_http_protocol("HTTP/2"), "HTTP/2.0");
        assert_eq!(normalize_http_protocol(" http/1.1 "), "HTTP/1.1");
        assert_eq!(normalize_http_protocol("h3"), "HTTP/3.0");
        assert_eq!(tls_version_label("TLSv1.3"), "TLS1.3");
        assert_eq!(tls_version_label("TLSv1"), "TLS1.0");
    }
}
