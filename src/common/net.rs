use std::net::IpAddr;
use url::Url;

pub fn parse_target_url(input: &str) -> Option<Url> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.contains("://") {
        Url::parse(trimmed).ok()
    } else {
        Url::parse(&format!("https://{trimmed}")).ok()
    }
}

pub(crate) fn ip_family(ip: &IpAddr) -> &'static str {
    match ip {
        IpAddr::V4(_) => "ipv4",
        IpAddr::V6(_) => "ipv6",
    }
}

/// Host as written in the URL, without IPv6 brackets.
pub(crate) fn url_host(url: &Url) -> String {
    url.host_str()
        .unwrap_or_default()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string()
}

pub(crate) fn url_port(url: &Url) -> u16 {
    url.port_or_known_default()
        .unwrap_or(if url.scheme() == "https" { 443 } else { 80 })
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct EnvProxy {
    /// Proxy URL that applies to this request, empty when going direct.
    pub url: String,
    /// A proxy is configured but NO_PROXY (or a loopback host) excludes this URL.
    pub bypassed: bool,
}

pub(crate) fn env_proxy_for(url: &Url) -> EnvProxy {
    resolve_env_proxy(url, |key| std::env::var(key).ok())
}

pub(crate) fn resolve_env_proxy(url: &Url, lookup: impl Fn(&str) -> Option<String>) -> EnvProxy {
    let read = |upper: &str, lower: &str| {
        lookup(upper)
            .or_else(|| lookup(lower))
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    };

    let scheme_specific = if url.scheme() == "https" {
        read("HTTPS_PROXY", "https_proxy")
    } else {
        read("HTTP_PROXY", "http_proxy")
    };
    let Some(proxy) = scheme_specific.or_else(|| read("ALL_PROXY", "all_proxy")) else {
        return EnvProxy::default();
    };

    let host = url_host(url).to_ascii_lowercase();
    let no_proxy = read("NO_PROXY", "no_proxy").unwrap_or_default();
    if is_loopback_host(&host) || no_proxy_matches(&no_proxy, &host) {
        return EnvProxy {
            url: String::new(),
            bypassed: true,
        };
    }

    let url = if proxy.contains("://") {
        proxy
    } else {
        format!("http://{proxy}")
    };
    EnvProxy {
        url,
        bypassed: false,
    }
}

fn is_loopback_host(host: &str) -> bool {
    host == "localhost"
        || host
            .parse::<IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false)
}

fn no_proxy_matches(no_proxy: &str, host: &str) -> bool {
    no_proxy
        .split(',')
        .map(|entry| entry.trim().to_ascii_lowercase())
        .filter(|entry| !entry.is_empty())
        .any(|entry| {
            if entry == "*" {
                return true;
            }
            let entry = match entry.rsplit_once(':') {
                Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => {
                    name.to_string()
                }
                _ => entry,
            };
            let suffix = entry.trim_start_matches('.');
            host == suffix || host.ends_with(&format!(".{suffix}"))
        })
}

#[cfg(test)]
mod tests {
    use super::{ip_family, parse_target_url, resolve_env_proxy};
    use std::collections::HashMap;
    use std::net::IpAddr;
    use url::Url;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn parse_target_url_defaults_to_https() {
        let url = parse_target_url("example.com/file.bin").expect("url");
        assert_eq!(url.scheme(), "https");
        assert!(parse_target_url("   ").is_none());
    }

    #[test]
    fn ip_family_labels() {
        let v4: IpAddr = "192.0.2.1".parse().expect("ip");
        let v6: IpAddr = "2001:db8::1".parse().expect("ip");
        assert_eq!(ip_family(&v4), "ipv4");
        assert_eq!(ip_family(&v6), "ipv6");
    }

    #[test]
    fn https_proxy_applies_to_https_urls() {
        let url = Url::parse("https://example.com/").expect("url");
        let proxy = resolve_env_proxy(&url, lookup(&[("HTTPS_PROXY", "proxy.corp:3128")]));
        assert_eq!(proxy.url, "http://proxy.corp:3128");
        assert!(!proxy.bypassed);
    }

    #[test]
    fn no_proxy_suffix_marks_bypass() {
        let url = Url::parse("https://files.example.com/").expect("url");
        let proxy = resolve_env_proxy(
            &url,
            lookup(&[
                ("https_proxy", "http://proxy.corp:3128"),
                ("NO_PROXY", "localhost,.example.com"),
            ]),
        );
        assert!(proxy.url.is_empty());
        assert!(proxy.bypassed);
    }

    #[test]
    fn no_configured_proxy_is_direct() {
        let url = Url::parse("http://example.com/").expect("url");
        let proxy = resolve_env_proxy(&url, lookup(&[("HTTPS_PROXY", "proxy:1")]));
        assert!(proxy.url.is_empty());
        assert!(!proxy.bypassed);
    }
}
