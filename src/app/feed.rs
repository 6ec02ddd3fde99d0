/// Item links of an RSS 2.0, RSS 1.0 or Atom feed in document order. Only
/// the first link of each `<item>`/`<entry>` counts; channel links are
/// ignored.
fn parse_feed_links(bytes: &[u8]) -> Result<Vec<String>, String> {
    let mut reader = XmlReader::from_reader(bytes);
    reader.config_mut().trim_text(true);

    let mut root: Option<String> = None;
    let mut in_item = false;
    let mut in_link = false;
    let mut current = String::new();
    let mut item_link: Option<String> = None;
    let mut links = Vec::new();

    loop {
        match reader.read_event() {
            Ok(XmlEvent::Start(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).to_ascii_lowercase();
                if root.is_none() {
                    root = Some(name.clone());
                }
                if name == "item" || name == "entry" {
                    in_item = true;
                    item_link = None;
                } else if in_item && name == "link" {
                    match atom_link_href(&e) {
                        Some(href) => {
                            item_link.get_or_insert(href);
                        }
                        None => {
                            in_link = true;
                            current.clear();
                        }
                    }
                }
            }
            Ok(XmlEvent::Empty(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).to_ascii_lowercase();
                if root.is_none() {
                    root = Some(name.clone());
                }
                if in_item
                    && name == "link"
                    && let Some(href) = atom_link_href(&e)
                {
                    item_link.get_or_insert(href);
                }
            }
            Ok(XmlEvent::End(e)) => {
                let name = e.local_name();
                let name = name.as_ref();
                if name.eq_ignore_ascii_case(b"link") && in_link {
                    in_link = false;
                    let link = current.trim();
                    if !link.is_empty() {
                        item_link.get_or_insert_with(|| link.to_string());
                    }
                } else if name.eq_ignore_ascii_case(b"item") || name.eq_ignore_ascii_case(b"entry")
                {
                    in_item = false;
                    if let Some(link) = item_link.take() {
                        links.push(link);
                    }
                }
            }
            Ok(XmlEvent::Text(t)) if in_link => {
                let text = t.unescape().map_err(|err| err.to_string())?;
                current.push_str(&text);
            }
            Ok(XmlEvent::CData(c)) if in_link => {
                current.push_str(&String::from_utf8_lossy(c.as_ref()));
            }
            Ok(XmlEvent::Eof) => break,
            Ok(_) => {}
            Err(err) => {
                return Err(format!("{err} at byte {}", reader.buffer_position()));
            }
        }
    }

    match root.as_deref() {
        Some("rss") | Some("feed") | Some("rdf") => Ok(links),
        Some(other) => Err(format!("root element <{other}> is not a feed")),
        None => Err("no root element".to_string()),
    }
}

/// `href` of an Atom `<link>`, unless its `rel` names something other than
/// the entry itself (enclosures, replies).
fn atom_link_href(element: &quick_xml::events::BytesStart<'_>) -> Option<String> {
    let mut href = None;
    for attr in element.attributes().flatten() {
        let value = attr.unescape_value().ok()?.trim().to_string();
        match attr.key.local_name().as_ref() {
            b"href" => href = Some(value),
            b"rel" if value != "alternate" => return None,
            _ => {}
        }
    }
    href.filter(|href| !href.is_empty())
}

/// Fetches the feed and returns its item links as absolute page URLs,
/// de-duplicated by canonical form.
async fn fetch_feed_urls(fetcher: &PageFetcher, feed_url: &str) -> Result<Vec<String>, AppError> {
    let feed_error = |reason: String| AppError::Feed {
        url: feed_url.to_string(),
        reason,
    };
    let base = Url::parse(feed_url).map_err(|err| feed_error(err.to_string()))?;
    let bytes = fetcher
        .fetch_bytes(feed_url)
        .await
        .map_err(|err| feed_error(err.to_string()))?;
    let links = parse_feed_links(&bytes).map_err(feed_error)?;

    let mut seen = HashSet::new();
    let urls = links
        .iter()
        .filter_map(|link| {
            let key = normalize_url(link, Some(&base))?;
            seen.insert(key).then(|| resolve_absolute(link.trim(), Some(&base)))?
        })
        .map(|url| url.to_string())
        .collect::<Vec<_>>();
    debug!(feed = feed_url, items = links.len(), pages = urls.len(), "feed read");
    Ok(urls)
}

#[cfg(test)]
mod feed_tests {
    use super::test_support::{MockServerExt, status, xml};
    use super::*;
    use wiremock::MockServer;

    #[test]
    fn rss_items_yield_their_links_but_the_channel_link_does_not() {
        let rss = r#"<?xml version="1.0"?>
            <rss version="2.0"><channel>
              <title>News</title>
              <link>https://example.com/</link>
              <item><title>One</title><link>https://example.com/one</link></item>
              <item><title>Two</title><link><![CDATA[https://example.com/two?a=1&b=2]]></link></item>
              <item><title>No link</title><guid>abc</guid></item>
              <item><link> https://example.com/three?x=1&amp;y=2 </link></item>
            </channel></rss>"#;
        assert_eq!(
            parse_feed_links(rss.as_bytes()).unwrap(),
            vec![
                "https://example.com/one",
                "https://example.com/two?a=1&b=2",
                "https://example.com/three?x=1&y=2",
            ]
        );
    }

    #[test]
    fn atom_entries_use_the_alternate_link() {
        let atom = r#"<feed xmlns="http://www.w3.org/2005/Atom">
              <link href="https://example.com/"/>
              <entry>
                <link rel="enclosure" href="https://example.com/a.mp3"/>
                <link rel="alternate" href="https://example.com/a"/>
              </entry>
              <entry><link href="/b"/></entry>
            </feed>"#;
        assert_eq!(
            parse_feed_links(atom.as_bytes()).unwrap(),
            vec!["https://example.com/a", "/b"]
        );
    }

    #[test]
    fn non_feed_documents_are_rejected() {
        let err = parse_feed_links(b"<urlset><url><loc>x</loc></url></urlset>").unwrap_err();
        assert!(err.contains("<urlset>"), "{err}");
        assert!(parse_feed_links(b"").is_err());
        assert!(parse_feed_links(b"<rss><channel><item></rss>").is_err());
    }

    #[tokio::test]
    async fn feed_links_are_resolved_and_deduplicated() {
        let server = MockServer::start().await;
        server
            .route(
                "/feed.xml",
                xml(r#"<rss><channel>
                    <item><link>/posts/1</link></item>
                    <item><link>/posts/1#comments</link></item>
                    <item><link>mailto:editor@example.com</link></item>
                    <item><link>/posts/2</link></item>
                </channel></rss>"#),
            )
            .await;
        server.route("/gone.xml", status(404)).await;
        let fetcher = PageFetcher::new(DEFAULT_USER_AGENT, Duration::ZERO).unwrap();

        let urls = fetch_feed_urls(&fetcher, &server.url("/feed.xml"))
            .await
            .unwrap();
        assert_eq!(
            urls,
            vec![server.url("/posts/1"), server.url("/posts/2")]
        );

        let err = fetch_feed_urls(&fetcher, &server.url("/gone.xml"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Feed { .. }), "{err}");
    }
}
