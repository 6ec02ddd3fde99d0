#[derive(Debug, Clone, PartialEq, Eq)]
struct ImageSighting {
    image_url: String,
    alt: Option<String>,
    title: Option<String>,
    decorative: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Upsert {
    Created,
    Appended,
    AlreadyListed,
}

/// Distinct images keyed by normalized URL, kept in first-sighting order.
#[derive(Debug, Default)]
struct ImageRegistry {
    records: Vec<ImageRecord>,
    index: HashMap<String, usize>,
}

impl ImageRegistry {
    fn len(&self) -> usize {
        self.records.len()
    }

    #[cfg(test)]
    fn get(&self, key: &str) -> Option<&ImageRecord> {
        self.index.get(key).map(|&idx| &self.records[idx])
    }

    fn records_mut(&mut self) -> &mut [ImageRecord] {
        &mut self.records
    }

    fn into_records(self) -> Vec<ImageRecord> {
        self.records
    }

    /// Attributes of the first sighting win; later sightings only add their
    /// page, once.
    fn upsert(&mut self, key: String, sighting: ImageSighting, page_url: &str) -> Upsert {
        if let Some(&idx) = self.index.get(&key) {
            let record = &mut self.records[idx];
            if record.source_pages.iter().any(|page| page == page_url) {
                return Upsert::AlreadyListed;
            }
            record.source_pages.push(page_url.to_string());
            record.occurrence_count += 1;
            return Upsert::Appended;
        }

        let alt_present = sighting.alt.is_some();
        self.records.push(ImageRecord {
            image_url: sighting.image_url,
            alt_text: sighting.alt.map(|alt| alt.trim().to_string()).unwrap_or_default(),
            alt_present,
            title_text: sighting
                .title
                .map(|title| title.trim().to_string())
                .unwrap_or_default(),
            decorative: sighting.decorative,
            occurrence_count: 1,
            source_pages: vec![page_url.to_string()],
            size_bytes: None,
            svg_title: None,
            suggestions: Vec::new(),
        });
        self.index.insert(key, self.records.len() - 1);
        Upsert::Created
    }
}

#[derive(Debug, Default)]
struct PageExtraction {
    images_seen: usize,
    images_created: usize,
    /// Same-site, crawlable links in page order.
    links: Vec<String>,
}

fn attr_is_true(value: Option<&str>) -> bool {
    value.is_some_and(|v| v.trim().eq_ignore_ascii_case("true"))
}

fn style_hides(style: Option<&str>) -> bool {
    let Some(style) = style else {
        return false;
    };
    let compact = style
        .chars()
        .filter(|ch| !ch.is_whitespace())
        .collect::<String>()
        .to_ascii_lowercase();
    compact.contains("display:none") || compact.contains("visibility:hidden")
}

fn is_hidden_element(element: &ElementRef) -> bool {
    let value = element.value();
    attr_is_true(value.attr("aria-hidden"))
        || value.attr("hidden").is_some()
        || style_hides(value.attr("style"))
}

fn is_decorative(element: &ElementRef) -> bool {
    let value = element.value();
    let empty_alt = value.attr("alt").is_some_and(|alt| alt.trim().is_empty());
    let has_title = value.attr("title").is_some_and(|title| !title.trim().is_empty());
    if empty_alt && !has_title {
        return true;
    }
    if value
        .attr("role")
        .is_some_and(|role| matches!(role.trim().to_ascii_lowercase().as_str(), "presentation" | "none"))
    {
        return true;
    }
    is_hidden_element(element)
        || element
            .ancestors()
            .filter_map(ElementRef::wrap)
            .any(|ancestor| is_hidden_element(&ancestor))
}

fn document_base_url(doc: &Html, page_url: &Url) -> Url {
    let Ok(selector) = Selector::parse("base[href]") else {
        return page_url.clone();
    };
    doc.select(&selector)
        .next()
        .and_then(|el| el.value().attr("href"))
        .and_then(|href| page_url.join(href.trim()).ok())
        .unwrap_or_else(|| page_url.clone())
}

fn image_source<'a>(element: &ElementRef<'a>) -> Option<&'a str> {
    let value = element.value();
    [value.attr("src"), value.attr("data-src")]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|src| !src.is_empty())
}

/// Records every image of `html` in `registry` and returns the page's
/// crawlable links. Malformed markup is parsed as far as the parser recovers.
fn extract_page(
    html: &str,
    page_url: &Url,
    site: &Site,
    excluded: &[String],
    registry: &mut ImageRegistry,
) -> PageExtraction {
    let doc = Html::parse_document(html);
    let base = document_base_url(&doc, page_url);
    let page = page_url.as_str();
    let mut extraction = PageExtraction::default();

    if let Ok(selector) = Selector::parse("img, input[type=\"image\"]") {
        for element in doc.select(&selector) {
            let Some(src) = image_source(&element) else {
                continue;
            };
            let Some(resolved) = resolve_absolute(src, Some(&base)) else {
                continue;
            };
            let Some(key) = normalize_url(resolved.as_str(), None) else {
                continue;
            };
            extraction.images_seen += 1;
            let sighting = ImageSighting {
                image_url: resolved.to_string(),
                alt: element.value().attr("alt").map(str::to_string),
                title: element.value().attr("title").map(str::to_string),
                decorative: is_decorative(&element),
            };
            if registry.upsert(key, sighting, page) == Upsert::Created {
                extraction.images_created += 1;
            }
        }
    }

    if let Ok(selector) = Selector::parse("a[href]") {
        let mut seen = HashSet::new();
        for element in doc.select(&selector) {
            let Some(href) = element.value().attr("href") else {
                continue;
            };
            let Some(key) = normalize_url(href, Some(&base)) else {
                continue;
            };
            let Some(mut resolved) = resolve_absolute(href.trim(), Some(&base)) else {
                continue;
            };
            resolved.set_fragment(None);
            let resolved = resolved.to_string();
            if !site.is_same_site(&resolved) || has_excluded_extension(&resolved, excluded) {
                continue;
            }
            if seen.insert(key) {
                extraction.links.push(resolved);
            }
        }
    }

    extraction
}

/// Whether an SVG document carries a `<title>` with text in it.
fn svg_document_has_title(bytes: &[u8]) -> bool {
    let mut inflated = Vec::new();
    let bytes = if bytes.starts_with(&[0x1f, 0x8b])
        && flate2::read::GzDecoder::new(bytes)
            .read_to_end(&mut inflated)
            .is_ok()
    {
        &inflated[..]
    } else {
        bytes
    };

    let mut reader = XmlReader::from_reader(bytes);
    reader.config_mut().trim_text(true);
    let mut in_title = false;
    loop {
        match reader.read_event() {
            Ok(XmlEvent::Start(e)) if e.local_name().as_ref().eq_ignore_ascii_case(b"title") => {
                in_title = true;
            }
            Ok(XmlEvent::End(e)) if e.local_name().as_ref().eq_ignore_ascii_case(b"title") => {
                in_title = false;
            }
            Ok(XmlEvent::Text(t)) if in_title => {
                if t.unescape().is_ok_and(|text| !text.trim().is_empty()) {
                    return true;
                }
            }
            Ok(XmlEvent::CData(c)) if in_title => {
                if !String::from_utf8_lossy(c.as_ref()).trim().is_empty() {
                    return true;
                }
            }
            Ok(XmlEvent::Eof) | Err(_) => return false,
            Ok(_) => {}
        }
    }
}

#[cfg(test)]
mod extract_tests {
    use super::*;

    fn site() -> Site {
        Site::parse("https://example.com").unwrap()
    }

    fn extract(html: &str, page: &str, registry: &mut ImageRegistry) -> PageExtraction {
        let page_url = Url::parse(page).unwrap();
        extract_page(html, &page_url, &site(), &default_excluded_extensions(), registry)
    }

    #[test]
    fn same_image_twice_on_one_page_is_one_sighting() {
        let mut registry = ImageRegistry::default();
        let html = r#"<html><body>
            <img src="/a.png" alt="Team photo at the 2024 summer picnic">
            <p><img src="a.png" alt="different alt ignored"></p>
        </body></html>"#;
        let extraction = extract(html, "https://example.com/", &mut registry);

        assert_eq!(extraction.images_seen, 2);
        assert_eq!(extraction.images_created, 1);
        assert_eq!(registry.len(), 1);
        let record = registry.get("https://example.com/a.png").unwrap();
        assert_eq!(record.occurrence_count, 1);
        assert_eq!(record.source_pages, vec!["https://example.com/"]);
        assert_eq!(record.alt_text, "Team photo at the 2024 summer picnic");
    }

    #[test]
    fn occurrences_track_distinct_pages() {
        let mut registry = ImageRegistry::default();
        let html = r#"<img src="https://www.example.com/logo.png?utm_source=x" alt="Acme">"#;
        for page in [
            "https://example.com/a",
            "https://example.com/b",
            "https://example.com/a",
            "https://example.com/c",
        ] {
            extract(html, page, &mut registry);
        }
        let record = registry.get("https://example.com/logo.png").unwrap();
        assert_eq!(record.occurrence_count, 3);
        assert_eq!(record.source_pages.len(), record.occurrence_count);
        assert_eq!(
            record.source_pages,
            vec![
                "https://example.com/a",
                "https://example.com/b",
                "https://example.com/c"
            ]
        );
    }

    #[test]
    fn lazy_images_inputs_and_base_href_are_resolved() {
        let mut registry = ImageRegistry::default();
        let html = r#"<html><head><base href="https://example.com/assets/"></head><body>
            <img data-src="lazy.jpg" alt="Lazy loaded harbor view at dusk">
            <input type="image" src="go.png" alt="Submit search">
            <img alt="no source at all">
            <img src="data:image/gif;base64,R0lGOD" alt="inline">
        </body></html>"#;
        let extraction = extract(html, "https://example.com/page", &mut registry);

        assert_eq!(extraction.images_seen, 2);
        assert!(registry.get("https://example.com/assets/lazy.jpg").is_some());
        assert!(registry.get("https://example.com/assets/go.png").is_some());
    }

    #[test]
    fn decorative_markers_are_detected_and_kept() {
        let mut registry = ImageRegistry::default();
        let html = r#"<body>
            <img src="/empty.png" alt="">
            <img src="/titled.png" alt="" title="Company founder">
            <img src="/role.png" alt="x" role="presentation">
            <img src="/aria.png" alt="x" aria-hidden="true">
            <div style="display: none"><span><img src="/nested.png" alt="x"></span></div>
            <section hidden><img src="/hidden.png" alt="x"></section>
            <img src="/plain.png" alt="A visible, described image">
            <img src="/missing.png">
        </body>"#;
        extract(html, "https://example.com/", &mut registry);

        let decorative = |path: &str| {
            registry
                .get(&format!("https://example.com{path}"))
                .unwrap()
                .decorative
        };
        assert!(decorative("/empty.png"));
        assert!(!decorative("/titled.png"));
        assert!(decorative("/role.png"));
        assert!(decorative("/aria.png"));
        assert!(decorative("/nested.png"));
        assert!(decorative("/hidden.png"));
        assert!(!decorative("/plain.png"));
        assert!(!decorative("/missing.png"));
        assert_eq!(registry.len(), 8);

        let missing = registry.get("https://example.com/missing.png").unwrap();
        assert!(!missing.alt_present);
        assert_eq!(missing.alt_text, "");
    }

    #[test]
    fn links_are_same_site_deduplicated_and_crawlable() {
        let mut registry = ImageRegistry::default();
        let html = r##"
            <a href="/about">About</a>
            <a href="/about/#team">About again</a>
            <a href="https://www.example.com/contact">Contact</a>
            <a href="https://other.test/">Elsewhere</a>
            <a href="/brochure.pdf">PDF</a>
            <a href="mailto:hi@example.com">Mail</a>
            <a href="#top">Top</a>
        "##;
        let extraction = extract(html, "https://example.com/", &mut registry);
        assert_eq!(
            extraction.links,
            vec![
                "https://example.com/about",
                "https://www.example.com/contact"
            ]
        );
    }

    #[test]
    fn malformed_markup_is_best_effort() {
        let mut registry = ImageRegistry::default();
        let extraction = extract(
            "<div><p><img src='/x.png' alt='Broken markup still parses'<span></div",
            "https://example.com/",
            &mut registry,
        );
        assert!(extraction.links.is_empty());
        assert_eq!(extraction.images_seen, 1);
        let record = registry.get("https://example.com/x.png").unwrap();
        assert_eq!(record.alt_text, "Broken markup still parses");
    }

    #[test]
    fn svg_titles_need_text() {
        assert!(svg_document_has_title(
            b"<svg xmlns=\"http://www.w3.org/2000/svg\"><title>Bar chart of sales</title><rect/></svg>"
        ));
        assert!(!svg_document_has_title(b"<svg><title>  </title></svg>"));
        assert!(!svg_document_has_title(b"<svg><rect width=\"1\"/></svg>"));
        assert!(!svg_document_has_title(b"not even xml"));
    }
}
