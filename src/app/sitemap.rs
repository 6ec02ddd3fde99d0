/// Root sitemap is level 1; documents deeper than this are never requested.
const MAX_SITEMAP_DEPTH: usize = 3;
const MAX_SITEMAP_URLS: usize = 50_000;
const MAX_ROBOTS_SITEMAPS: usize = 8;
const KEY_PAGES: [&str; 7] = [
    "/",
    "/accessibility",
    "/search",
    "/privacy",
    "/security",
    "/contact",
    "/about-us",
];

#[derive(Debug, Clone, PartialEq, Eq)]
enum SitemapDocument {
    UrlSet(Vec<String>),
    Index(Vec<String>),
}

#[derive(Debug, Clone, Default)]
struct SitemapWalk {
    /// Absolute page URLs in document order, de-duplicated.
    pages: Vec<String>,
    documents_fetched: usize,
    max_depth_reached: usize,
    truncated: bool,
}

fn inflate_if_gzipped(url: &str, bytes: Vec<u8>) -> Result<Vec<u8>, SitemapError> {
    if !bytes.starts_with(&[0x1f, 0x8b]) {
        return Ok(bytes);
    }
    let mut decoder = flate2::read::GzDecoder::new(&bytes[..]);
    let mut inflated = Vec::new();
    decoder
        .read_to_end(&mut inflated)
        .map_err(|source| SitemapError::Gzip {
            url: url.to_string(),
            source,
        })?;
    Ok(inflated)
}

/// Reads `<loc>` values from a `urlset` or `sitemapindex` document.
fn parse_sitemap_document(url: &str, bytes: &[u8]) -> Result<SitemapDocument, SitemapError> {
    let malformed = |reason: String| SitemapError::Malformed {
        url: url.to_string(),
        reason,
    };

    let mut reader = XmlReader::from_reader(bytes);
    reader.config_mut().trim_text(true);

    let mut root: Option<String> = None;
    let mut depth = 0usize;
    let mut in_loc = false;
    let mut current = String::new();
    let mut locs = Vec::new();

    loop {
        match reader.read_event() {
            Ok(XmlEvent::Start(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).to_ascii_lowercase();
                if root.is_none() {
                    root = Some(name.clone());
                }
                depth += 1;
                if name == "loc" {
                    in_loc = true;
                    current.clear();
                }
            }
            Ok(XmlEvent::Empty(e)) => {
                if root.is_none() {
                    root = Some(String::from_utf8_lossy(e.local_name().as_ref()).to_ascii_lowercase());
                }
            }
            Ok(XmlEvent::End(e)) => {
                depth = depth.saturating_sub(1);
                if e.local_name().as_ref().eq_ignore_ascii_case(b"loc") && in_loc {
                    in_loc = false;
                    let loc = current.trim();
                    if !loc.is_empty() {
                        locs.push(loc.to_string());
                    }
                }
            }
            Ok(XmlEvent::Text(t)) if in_loc => {
                let text = t.unescape().map_err(|err| malformed(err.to_string()))?;
                current.push_str(&text);
            }
            Ok(XmlEvent::CData(c)) if in_loc => {
                current.push_str(&String::from_utf8_lossy(c.as_ref()));
            }
            Ok(XmlEvent::Eof) => break,
            Ok(_) => {}
            Err(err) => {
                return Err(malformed(format!(
                    "{err} at byte {}",
                    reader.buffer_position()
                )));
            }
        }
    }

    if depth > 0 {
        return Err(malformed("unexpected end of document".to_string()));
    }
    match root.as_deref() {
        Some("urlset") => Ok(SitemapDocument::UrlSet(locs)),
        Some("sitemapindex") => Ok(SitemapDocument::Index(locs)),
        Some(other) => Err(SitemapError::NotASitemap {
            url: url.to_string(),
            root: other.to_string(),
        }),
        None => Err(malformed("no root element".to_string())),
    }
}

async fn fetch_sitemap_document(
    fetcher: &PageFetcher,
    url: &str,
) -> Result<SitemapDocument, SitemapError> {
    let bytes = fetcher
        .fetch_bytes(url)
        .await
        .map_err(|source| SitemapError::Fetch {
            url: url.to_string(),
            source,
        })?;
    let bytes = inflate_if_gzipped(url, bytes)?;
    parse_sitemap_document(url, &bytes)
}

/// Walks a sitemap and its nested indexes depth-first, so pages come out in
/// document order. Only a failure of the root document is an error.
async fn walk_sitemap(
    fetcher: &PageFetcher,
    site: &Site,
    root_url: &str,
    excluded: &[String],
) -> Result<SitemapWalk, SitemapError> {
    let mut walk = SitemapWalk::default();
    let mut seen_pages = HashSet::<String>::new();
    let mut seen_documents = HashSet::<String>::new();
    let mut stack = vec![(root_url.to_string(), 1usize)];

    while let Some((document_url, level)) = stack.pop() {
        if walk.pages.len() >= MAX_SITEMAP_URLS {
            walk.truncated = true;
            break;
        }
        if !seen_documents.insert(normalize_url(&document_url, None).unwrap_or_else(|| document_url.clone())) {
            continue;
        }

        let document = match fetch_sitemap_document(fetcher, &document_url).await {
            Ok(document) => document,
            Err(err) if level == 1 => return Err(err),
            Err(err) => {
                warn!(sitemap = %document_url, "skipping nested sitemap: {err}");
                continue;
            }
        };
        walk.documents_fetched += 1;
        walk.max_depth_reached = walk.max_depth_reached.max(level);
        let document_base = Url::parse(&document_url).ok();

        match document {
            SitemapDocument::Index(children) => {
                if level >= MAX_SITEMAP_DEPTH {
                    debug!(
                        sitemap = %document_url,
                        skipped = children.len(),
                        "sitemap index at maximum depth, nested sitemaps ignored"
                    );
                    continue;
                }
                for child in children.iter().rev() {
                    if let Some(resolved) = resolve_absolute(child, document_base.as_ref()) {
                        stack.push((resolved.to_string(), level + 1));
                    }
                }
            }
            SitemapDocument::UrlSet(locs) => {
                for loc in locs {
                    if walk.pages.len() >= MAX_SITEMAP_URLS {
                        walk.truncated = true;
                        break;
                    }
                    let Some(resolved) = resolve_absolute(&loc, document_base.as_ref()) else {
                        continue;
                    };
                    let resolved = resolved.to_string();
                    let Some(key) = normalize_url(&resolved, None) else {
                        continue;
                    };
                    if !site.is_same_site(&resolved) || has_excluded_extension(&resolved, excluded) {
                        continue;
                    }
                    if seen_pages.insert(key) {
                        walk.pages.push(resolved);
                    }
                }
            }
        }
    }

    if walk.truncated {
        warn!(cap = MAX_SITEMAP_URLS, "sitemap URL cap reached, traversal stopped");
    }
    if walk.pages.is_empty() {
        return Err(SitemapError::Empty {
            url: root_url.to_string(),
        });
    }
    Ok(walk)
}

fn robots_sitemap_urls(robots: &str) -> Vec<String> {
    robots
        .lines()
        .map(str::trim)
        .filter(|line| line.to_ascii_lowercase().starts_with("sitemap:"))
        .filter_map(|line| line.split_once(':').map(|(_, rhs)| rhs.trim().to_string()))
        .filter(|url| !url.is_empty())
        .take(MAX_ROBOTS_SITEMAPS)
        .collect()
}

/// Finds the site's sitemap: an explicit URL when given, otherwise
/// `/sitemap.xml`, then any `Sitemap:` lines of `robots.txt`.
async fn discover_sitemap_pages(
    fetcher: &PageFetcher,
    site: &Site,
    explicit: Option<&str>,
    excluded: &[String],
) -> Result<SitemapWalk, SitemapError> {
    if let Some(explicit) = explicit {
        let url = resolve_absolute(explicit, Some(&site.start_url))
            .map(|u| u.to_string())
            .unwrap_or_else(|| explicit.to_string());
        return walk_sitemap(fetcher, site, &url, excluded).await;
    }

    let origin = site.origin();
    let default_url = format!("{origin}/sitemap.xml");
    let first_error = match walk_sitemap(fetcher, site, &default_url, excluded).await {
        Ok(walk) => return Ok(walk),
        Err(err) => err,
    };
    debug!("default sitemap unusable: {first_error}");

    let robots = match fetcher.fetch_text(&format!("{origin}/robots.txt")).await {
        Ok(text) => text,
        Err(err) => {
            debug!("robots.txt unavailable: {err}");
            return Err(first_error);
        }
    };
    for candidate in robots_sitemap_urls(&robots) {
        if candidate == default_url {
            continue;
        }
        match walk_sitemap(fetcher, site, &candidate, excluded).await {
            Ok(walk) => {
                info!(sitemap = %candidate, "using sitemap listed in robots.txt");
                return Ok(walk);
            }
            Err(err) => debug!("robots.txt sitemap unusable: {err}"),
        }
    }
    Err(first_error)
}

/// Appends the always-relevant pages that answer as HTML and are not
/// already in the population. Returns how many were added.
async fn add_key_pages(fetcher: &PageFetcher, site: &Site, pages: &mut Vec<String>) -> usize {
    let mut known = pages
        .iter()
        .filter_map(|page| normalize_url(page, None))
        .collect::<HashSet<_>>();
    let origin = site.origin();
    let mut added = 0usize;

    for path in KEY_PAGES {
        let url = if path == "/" {
            format!("{origin}/")
        } else {
            format!("{origin}{path}")
        };
        let Some(key) = normalize_url(&url, None) else {
            continue;
        };
        if known.contains(&key) {
            continue;
        }
        if fetcher.is_html_page(&url).await {
            known.insert(key);
            pages.push(url);
            added += 1;
        }
    }
    added
}

fn sampling_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

/// Picks exactly `sample_size` distinct URLs uniformly at random, keeping
/// the population order. Returns the input untouched when it is not larger.
fn sample_urls(urls: Vec<String>, sample_size: usize, rng: &mut StdRng) -> Vec<String> {
    if urls.len() <= sample_size {
        return urls;
    }
    let mut picked = rand::seq::index::sample(rng, urls.len(), sample_size).into_vec();
    picked.sort_unstable();
    let mut slots = urls.into_iter().map(Some).collect::<Vec<_>>();
    picked
        .into_iter()
        .filter_map(|idx| slots[idx].take())
        .collect()
}
