/// Extensions that never lead to an HTML page: documents, media, archives
/// and image files.
const DEFAULT_EXCLUDED_EXTENSIONS: [&str; 29] = [
    "pdf", "doc", "docx", "xls", "xlsx", "ppt", "pptx", "odt", "zip", "rar", "7z", "gz", "tar",
    "txt", "rss", "xml", "json", "csv", "mp3", "mp4", "avi", "mov", "wav", "jpg", "jpeg", "png",
    "gif", "svg", "webp",
];

fn default_excluded_extensions() -> Vec<String> {
    DEFAULT_EXCLUDED_EXTENSIONS
        .iter()
        .map(|ext| ext.to_string())
        .collect()
}

/// The site under audit: where crawling starts and which registrable domain
/// counts as "same site".
#[derive(Debug, Clone)]
struct Site {
    start_url: Url,
    host_key: String,
    registrable_domain: String,
}

impl Site {
    fn parse(domain: &str) -> Result<Self, AppError> {
        let invalid = |reason: &str| AppError::InvalidDomain {
            domain: domain.to_string(),
            reason: reason.to_string(),
        };
        let trimmed = domain.trim();
        if trimmed.is_empty() {
            return Err(invalid("empty"));
        }

        let start_url = resolve_absolute(trimmed, None).ok_or_else(|| invalid("unparseable URL"))?;
        if !matches!(start_url.scheme(), "http" | "https") {
            return Err(invalid("only http and https sites can be scanned"));
        }
        let host = start_url
            .host_str()
            .ok_or_else(|| invalid("missing host"))?;
        let registrable_domain =
            registrable_domain(&start_url).ok_or_else(|| invalid("missing host"))?;

        Ok(Self {
            host_key: host_key(host),
            registrable_domain,
            start_url,
        })
    }

    fn origin(&self) -> String {
        let port = self
            .start_url
            .port()
            .map(|p| format!(":{p}"))
            .unwrap_or_default();
        format!(
            "{}://{}{}",
            self.start_url.scheme(),
            self.start_url.host_str().unwrap_or_default(),
            port
        )
    }

    /// `blog.example.com` and `www.example.com` belong to `example.com`;
    /// `example.co.uk` and `other.co.uk` do not share a site.
    fn is_same_site(&self, candidate: &str) -> bool {
        Url::parse(candidate)
            .ok()
            .and_then(|u| registrable_domain(&u))
            .is_some_and(|domain| domain == self.registrable_domain)
    }

    /// File-name friendly label, e.g. `example.com`.
    fn label(&self) -> String {
        self.host_key
            .chars()
            .map(|ch| {
                if ch.is_ascii_alphanumeric() || ch == '-' || ch == '.' {
                    ch
                } else {
                    '_'
                }
            })
            .collect()
    }
}

/// Public-suffix based registrable domain of `url`'s host. IP addresses and
/// single-label hosts stand for themselves.
fn registrable_domain(url: &Url) -> Option<String> {
    match url.host()? {
        url::Host::Domain(domain) => {
            let domain = domain.trim_end_matches('.').to_ascii_lowercase();
            let registrable = psl::domain_str(&domain).unwrap_or(domain.as_str()).to_string();
            Some(registrable)
        }
        url::Host::Ipv4(addr) => Some(addr.to_string()),
        url::Host::Ipv6(addr) => Some(addr.to_string()),
    }
}

fn host_key(host: &str) -> String {
    let mut host = host.trim_end_matches('.').to_ascii_lowercase();
    while let Some(stripped) = host.strip_prefix("www.") {
        if stripped.is_empty() {
            break;
        }
        host = stripped.to_string();
    }
    host
}

/// Resolves `raw` into an absolute URL. Scheme-less input is treated as
/// https: `//cdn.example.com/a.png` and, without a base, `example.com/x`.
fn resolve_absolute(raw: &str, base: Option<&Url>) -> Option<Url> {
    if let Some(rest) = raw.strip_prefix("//") {
        return Url::parse(&format!("https://{rest}")).ok();
    }
    if raw.contains("://") {
        return Url::parse(raw).ok();
    }
    match base {
        Some(base) => base.join(raw).ok(),
        None => Url::parse(&format!("https://{raw}")).ok(),
    }
}

/// Canonical form used for de-duplication of pages and images. Two URLs
/// with the same canonical form are the same resource.
fn normalize_url(raw: &str, base: Option<&Url>) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    let lower = trimmed.to_ascii_lowercase();
    if ["mailto:", "javascript:", "tel:", "data:"]
        .iter()
        .any(|prefix| lower.starts_with(prefix))
    {
        return None;
    }

    let mut url = resolve_absolute(trimmed, base)?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }

    let host = url.host_str()?.to_string();
    let canonical_host = host_key(&host);
    if canonical_host != host {
        url.set_host(Some(&canonical_host)).ok()?;
    }

    if url.query().is_some_and(str::is_empty) {
        url.set_query(None);
    } else if url.query_pairs().any(|(k, _)| is_tracking_query_param(&k)) {
        let kept_params = url
            .query_pairs()
            .filter(|(k, _)| !is_tracking_query_param(k))
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect::<Vec<_>>();
        if kept_params.is_empty() {
            url.set_query(None);
        } else {
            let mut serializer = url::form_urlencoded::Serializer::new(String::new());
            for (k, v) in kept_params {
                serializer.append_pair(&k, &v);
            }
            url.set_query(Some(&serializer.finish()));
        }
    }

    url.set_fragment(None);

    let path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        let trimmed_path = path.trim_end_matches('/');
        url.set_path(if trimmed_path.is_empty() { "/" } else { trimmed_path });
    }

    Some(url.to_string())
}

fn is_tracking_query_param(param: &str) -> bool {
    let name = param.to_ascii_lowercase();
    if name.starts_with("utm_") || name.starts_with("gad_") {
        return true;
    }
    matches!(
        name.as_str(),
        "gclid"
            | "fbclid"
            | "gbraid"
            | "wbraid"
            | "_gl"
            | "mc_cid"
            | "mc_eid"
            | "pk_campaign"
            | "pk_kwd"
            | "pk_source"
            | "pk_medium"
            | "pk_content"
    )
}

fn url_path_lowercase(url: &str) -> String {
    Url::parse(url)
        .map(|u| u.path().to_ascii_lowercase())
        .unwrap_or_else(|_| {
            url.split(['?', '#'])
                .next()
                .unwrap_or_default()
                .to_ascii_lowercase()
        })
}

fn has_excluded_extension(url: &str, excluded: &[String]) -> bool {
    let path = url_path_lowercase(url);
    let Some((_, ext)) = path.rsplit_once('.') else {
        return false;
    };
    if ext.contains('/') {
        return false;
    }
    excluded.iter().any(|candidate| candidate == ext)
}

fn is_svg_url(url: &str) -> bool {
    let path = url_path_lowercase(url);
    path.ends_with(".svg") || path.ends_with(".svgz")
}

#[cfg(test)]
mod normalize_tests {
    use super::*;

    fn norm(raw: &str) -> String {
        normalize_url(raw, None).unwrap_or_default()
    }

    #[test]
    fn canonicalizes_host_port_slash_and_fragment() {
        assert_eq!(norm("https://WWW.Example.COM:443/About/#team"), "https://example.com/About");
        assert_eq!(norm("http://example.com:80/"), "http://example.com/");
        assert_eq!(norm("https://example.com"), "https://example.com/");
        assert_eq!(norm("https://example.com:8443/a/"), "https://example.com:8443/a");
    }

    #[test]
    fn forces_https_when_scheme_missing() {
        assert_eq!(norm("example.com/blog/"), "https://example.com/blog");
        assert_eq!(norm("//cdn.example.com/a.png"), "https://cdn.example.com/a.png");
        assert_eq!(norm("http://example.com/x"), "http://example.com/x");
    }

    #[test]
    fn resolves_relative_urls_against_the_page() {
        let base = Url::parse("https://www.example.com/news/article/").unwrap();
        assert_eq!(
            normalize_url("../img/a.png", Some(&base)).as_deref(),
            Some("https://example.com/news/img/a.png")
        );
        assert_eq!(
            normalize_url("/logo.svg", Some(&base)).as_deref(),
            Some("https://example.com/logo.svg")
        );
    }

    #[test]
    fn drops_tracking_params_but_keeps_others() {
        assert_eq!(
            norm("https://example.com/p?utm_source=x&id=7&fbclid=abc"),
            "https://example.com/p?id=7"
        );
        assert_eq!(norm("https://example.com/p?gclid=1"), "https://example.com/p");
        assert_eq!(norm("https://example.com/p?"), "https://example.com/p");
    }

    #[test]
    fn rejects_non_http_references() {
        for raw in [
            "",
            "#top",
            "mailto:a@example.com",
            "javascript:void(0)",
            "tel:+1555",
            "data:image/png;base64,AAAA",
            "ftp://example.com/file",
        ] {
            assert_eq!(normalize_url(raw, None), None, "{raw}");
        }
    }

    #[test]
    fn normalization_is_idempotent() {
        let base = Url::parse("https://example.com/dir/page").unwrap();
        let inputs = [
            "https://WWW.www.example.com//a//",
            "example.com",
            "//www.cdn.example.com/x.png?utm_medium=y&b=a%20b",
            "img/photo one.jpg",
            "https://example.com/search?q=a+b&&x=",
            "http://example.com:80/path/?",
            "https://xn--bcher-kva.example/ä",
        ];
        for raw in inputs {
            let once = normalize_url(raw, Some(&base)).unwrap();
            let twice = normalize_url(&once, Some(&base)).unwrap();
            assert_eq!(once, twice, "{raw}");
        }
    }

    #[test]
    fn site_treats_www_variants_as_one_host() {
        let site = Site::parse("www.example.com").unwrap();
        assert_eq!(site.start_url.as_str(), "https://www.example.com/");
        assert_eq!(site.origin(), "https://www.example.com");
        assert_eq!(site.label(), "example.com");
        assert!(site.is_same_site("https://example.com/about"));
        assert!(site.is_same_site("https://WWW.EXAMPLE.COM/x"));
        assert!(Site::parse("  ").is_err());
        assert!(Site::parse("ftp://example.com").is_err());
    }

    #[test]
    fn same_site_means_same_registrable_domain() {
        let site = Site::parse("https://example.com").unwrap();
        assert!(site.is_same_site("https://blog.example.com/post"));
        assert!(site.is_same_site("http://shop.eu.example.com:8080/cart"));
        assert!(!site.is_same_site("https://example.org/"));
        assert!(!site.is_same_site("https://example.com.evil.test/"));
        assert!(!site.is_same_site("not a url"));

        let uk = Site::parse("www.shop.example.co.uk").unwrap();
        assert_eq!(uk.registrable_domain, "example.co.uk");
        assert!(uk.is_same_site("https://example.co.uk/"));
        assert!(!uk.is_same_site("https://other.co.uk/"));

        let local = Site::parse("http://127.0.0.1:8080/").unwrap();
        assert!(local.is_same_site("http://127.0.0.1:9090/a"));
        assert!(!local.is_same_site("http://127.0.0.2/"));
        assert!(!local.is_same_site("http://localhost/"));
    }

    #[test]
    fn excluded_extensions_match_the_path_only() {
        let excluded = default_excluded_extensions();
        assert!(has_excluded_extension("https://example.com/report.PDF", &excluded));
        assert!(has_excluded_extension("https://example.com/a.zip?dl=1", &excluded));
        assert!(!has_excluded_extension("https://example.com/page.html", &excluded));
        assert!(!has_excluded_extension("https://example.com/v1.2/docs", &excluded));
        assert!(!has_excluded_extension("https://example.com/?file=a.pdf", &excluded));
        assert!(is_svg_url("https://example.com/icons/logo.svg?v=3"));
        assert!(!is_svg_url("https://example.com/logo.png"));
    }
}
