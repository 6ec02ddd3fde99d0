/// More consecutive failures than this start raising the throttle.
const AUTO_THROTTLE_AFTER_FAILURES: usize = 5;

fn send_status(tx: &UnboundedSender<CrawlEvent>, message: impl Into<String>) {
    let _ = tx.send(CrawlEvent::Status(message.into()));
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FailedPage {
    url: String,
    reason: String,
}

/// Everything a run accumulates. Created at start, consumed into the report.
#[derive(Debug, Default)]
struct CrawlState {
    /// Normalized keys of pages already fetched or attempted.
    visited_pages: HashSet<String>,
    pending_pages: VecDeque<String>,
    /// Normalized keys of every page ever queued.
    queued_pages: HashSet<String>,
    image_registry: ImageRegistry,
    failed_pages: Vec<FailedPage>,
    pages_fetched: usize,
    consecutive_failures: usize,
    aborted: bool,
}

impl CrawlState {
    fn enqueue(&mut self, url: String) -> bool {
        let Some(key) = normalize_url(&url, None) else {
            return false;
        };
        if self.visited_pages.contains(&key) || !self.queued_pages.insert(key) {
            return false;
        }
        self.pending_pages.push_back(url);
        true
    }

    fn seed(&mut self, urls: impl IntoIterator<Item = String>) {
        for url in urls {
            self.enqueue(url);
        }
    }

    /// Pops the next page that has not been visited yet and marks it visited.
    fn next_page(&mut self) -> Option<String> {
        while let Some(url) = self.pending_pages.pop_front() {
            let Some(key) = normalize_url(&url, None) else {
                continue;
            };
            if self.visited_pages.insert(key) {
                return Some(url);
            }
        }
        None
    }

    fn record_success(&mut self) {
        self.pages_fetched += 1;
        self.consecutive_failures = 0;
    }

    /// Returns the length of the current failure streak.
    fn record_failure(&mut self, url: String, reason: String) -> usize {
        self.failed_pages.push(FailedPage { url, reason });
        self.consecutive_failures += 1;
        self.consecutive_failures
    }
}

#[derive(Debug)]
struct CrawlReport {
    site_label: String,
    mode: DiscoveryMode,
    pages_discovered: usize,
    pages_visited: usize,
    pages_fetched: usize,
    pages_failed: usize,
    failed_pages: Vec<FailedPage>,
    aborted: bool,
    final_throttle: Duration,
    images: Vec<ImageRecord>,
}

/// Base URL for extracting a fetched page: where it ended up after
/// redirects. Pages that landed on another site are not extracted.
fn extraction_url(site: &Site, page: &FetchedPage) -> Option<Url> {
    let landed = Url::parse(&page.final_url)
        .or_else(|_| Url::parse(&page.url))
        .ok()?;
    site.is_same_site(landed.as_str()).then_some(landed)
}

/// Fetches pending pages in order until the queue drains, `max_pages`
/// pages have been visited, or the failure budget runs out. Links are only
/// followed in crawl mode.
async fn visit_pages(
    state: &mut CrawlState,
    fetcher: &mut PageFetcher,
    site: &Site,
    config: &CrawlConfig,
    max_pages: usize,
    follow_links: bool,
    tx: &UnboundedSender<CrawlEvent>,
) {
    while state.visited_pages.len() < max_pages {
        let Some(url) = state.next_page() else {
            break;
        };

        match fetcher.fetch_page(&url).await {
            PageFetch::Fetched(page) => {
                state.record_success();
                let mut images = 0usize;
                if let Some(body) = page.body.as_deref() {
                    let page_url = extraction_url(site, &page);
                    if page_url.is_none() {
                        debug!(url = %page.url, final_url = %page.final_url, "redirected off-site, not extracted");
                    }
                    if let Some(page_url) = page_url {
                        let extraction = extract_page(
                            body,
                            &page_url,
                            site,
                            &config.excluded_extensions,
                            &mut state.image_registry,
                        );
                        images = extraction.images_seen;
                        debug!(
                            url = %page.final_url,
                            images,
                            new_images = extraction.images_created,
                            links = extraction.links.len(),
                            "page extracted"
                        );
                        if follow_links {
                            for link in extraction.links {
                                state.enqueue(link);
                            }
                        }
                    }
                } else {
                    debug!(url = %page.url, content_type = %page.content_type, "no HTML body");
                }
                let _ = tx.send(CrawlEvent::Page {
                    url: page.url,
                    status: page.status,
                    elapsed_ms: page.elapsed.as_millis(),
                    images,
                });
            }
            PageFetch::Failed {
                url,
                error,
                elapsed,
            } => {
                debug!(url = %url, elapsed_ms = elapsed.as_millis(), "page fetch failed: {error}");
                let reason = error.to_string();
                let _ = tx.send(CrawlEvent::Unretrieved {
                    url: url.clone(),
                    reason: reason.clone(),
                });
                let streak = state.record_failure(url, reason);

                if config.auto_throttle && streak > AUTO_THROTTLE_AFTER_FAILURES {
                    let before = fetcher.throttle();
                    let after = fetcher.escalate_throttle();
                    if after != before {
                        send_status(
                            tx,
                            format!(
                                "{streak} consecutive failures, throttle raised to {}s",
                                after.as_secs()
                            ),
                        );
                    }
                }
                if config.max_consecutive_failures > 0 && streak >= config.max_consecutive_failures {
                    state.aborted = true;
                    let _ = tx.send(CrawlEvent::Error(format!(
                        "aborting after {streak} consecutive page failures; reporting partial results"
                    )));
                    break;
                }
            }
        }

        let _ = tx.send(CrawlEvent::Stats {
            discovered: state.queued_pages.len(),
        });
    }
}

/// Measures every image on a bounded worker pool and stores size and SVG
/// title data on the records. Failed measurements leave the fields empty.
async fn measure_images(
    fetcher: &PageFetcher,
    records: &mut [ImageRecord],
    concurrency: usize,
    tx: &UnboundedSender<CrawlEvent>,
) {
    let concurrency = sanitize_fetch_concurrency(concurrency);
    let mut queue = records
        .iter()
        .enumerate()
        .map(|(idx, record)| (idx, record.image_url.clone(), record.is_svg()))
        .collect::<VecDeque<_>>();
    if queue.is_empty() {
        return;
    }
    send_status(tx, format!("measuring {} images", queue.len()));

    let mut set = JoinSet::new();
    let mut failed = 0usize;
    loop {
        while set.len() < concurrency {
            let Some((idx, url, is_svg)) = queue.pop_front() else {
                break;
            };
            let fetcher = fetcher.clone();
            set.spawn(async move {
                let measured = fetcher.measure_image(&url, is_svg).await;
                (idx, url, measured)
            });
        }

        let Some(joined) = set.join_next().await else {
            break;
        };
        match joined {
            Ok((idx, _, Ok(measured))) => {
                if let Some(record) = records.get_mut(idx) {
                    record.size_bytes = measured.size_bytes;
                    record.svg_title = measured.svg_title;
                }
            }
            Ok((_, url, Err(err))) => {
                failed += 1;
                debug!(url = %url, "image measurement failed: {err}");
            }
            Err(err) => {
                failed += 1;
                let _ = tx.send(CrawlEvent::Error(format!("image measurement worker failed: {err}")));
            }
        }
    }

    if failed > 0 {
        send_status(tx, format!("{failed} images could not be measured"));
    }
}

/// Runs one scan end to end: discovery, page visits, image measurements and
/// scoring. Per-page failures are reported as events; only setup problems
/// are errors.
async fn run_crawler(
    config: CrawlConfig,
    tx: UnboundedSender<CrawlEvent>,
) -> Result<CrawlReport, AppError> {
    let site = Site::parse(&config.domain)?;
    let mut fetcher = PageFetcher::new(&config.user_agent, config.throttle)?;
    let mut state = CrawlState::default();
    let mut rng = sampling_rng(config.seed);

    let listed = match (config.urls_file.as_deref(), config.rss_url.as_deref()) {
        (Some(path), _) => Some((
            path,
            DiscoveryMode::UrlList,
            load_urls_from_file(Path::new(path))?,
        )),
        (None, Some(feed)) => Some((
            feed,
            DiscoveryMode::Feed,
            fetch_feed_urls(&fetcher, feed).await?,
        )),
        (None, None) => None,
    };

    let mode = if let Some((source, mode, urls)) = listed {
        let population = urls
            .into_iter()
            .filter(|url| !has_excluded_extension(url, &config.excluded_extensions))
            .collect::<Vec<_>>();
        if population.is_empty() {
            return Err(AppError::NoUrls(source.to_string()));
        }
        send_status(&tx, format!("{} URLs loaded from {source}", population.len()));
        state.seed(sample_urls(population, config.sample_size, &mut rng));
        mode
    } else if config.crawl_only {
        DiscoveryMode::Crawl
    } else {
        match discover_sitemap_pages(
            &fetcher,
            &site,
            config.sitemap_url.as_deref(),
            &config.excluded_extensions,
        )
        .await
        {
            Ok(walk) => {
                let mut pages = walk.pages;
                send_status(
                    &tx,
                    format!(
                        "sitemap: {} pages from {} documents (depth {})",
                        pages.len(),
                        walk.documents_fetched,
                        walk.max_depth_reached
                    ),
                );
                if config.check_key_pages {
                    let added = add_key_pages(&fetcher, &site, &mut pages).await;
                    if added > 0 {
                        send_status(&tx, format!("{added} key pages added"));
                    }
                }
                let population = pages.len();
                let sample = sample_urls(pages, config.sample_size, &mut rng);
                if sample.len() < population {
                    send_status(
                        &tx,
                        format!("sampled {} of {population} pages", sample.len()),
                    );
                }
                state.seed(sample);
                DiscoveryMode::Sitemap
            }
            Err(err) => {
                send_status(&tx, format!("{err}; falling back to crawling"));
                DiscoveryMode::Crawl
            }
        }
    };

    let (max_pages, follow_links) = match mode {
        DiscoveryMode::Crawl => {
            state.enqueue(site.start_url.to_string());
            (config.sample_size.max(1), true)
        }
        DiscoveryMode::Sitemap | DiscoveryMode::UrlList | DiscoveryMode::Feed => {
            (state.pending_pages.len(), false)
        }
    };
    let _ = tx.send(CrawlEvent::Stats {
        discovered: state.queued_pages.len(),
    });
    info!(mode = mode.label(), max_pages, "visiting pages");

    visit_pages(
        &mut state,
        &mut fetcher,
        &site,
        &config,
        max_pages,
        follow_links,
        &tx,
    )
    .await;
    info!(
        pages = state.visited_pages.len(),
        images = state.image_registry.len(),
        "page visits complete"
    );

    measure_images(
        &fetcher,
        state.image_registry.records_mut(),
        config.fetch_concurrency,
        &tx,
    )
    .await;
    score_registry(state.image_registry.records_mut(), &config.score);

    let report = CrawlReport {
        site_label: site.label(),
        mode,
        pages_discovered: state.queued_pages.len(),
        pages_visited: state.visited_pages.len(),
        pages_fetched: state.pages_fetched,
        pages_failed: state.failed_pages.len(),
        failed_pages: state.failed_pages,
        aborted: state.aborted,
        final_throttle: fetcher.throttle(),
        images: state.image_registry.into_records(),
    };
    let _ = tx.send(CrawlEvent::Finished);
    Ok(report)
}
