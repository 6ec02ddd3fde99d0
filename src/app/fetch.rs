const DEFAULT_USER_AGENT: &str = concat!(
    "altscan/",
    env!("CARGO_PKG_VERSION"),
    " (+image accessibility audit)"
);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_AUTO_THROTTLE: Duration = Duration::from_secs(10);
const HTML_ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";

#[derive(Debug, Clone)]
struct FetchedPage {
    url: String,
    final_url: String,
    status: u16,
    content_type: String,
    /// Only present for HTML documents.
    body: Option<String>,
    elapsed: Duration,
}

#[derive(Debug, Clone)]
enum PageFetch {
    Fetched(FetchedPage),
    Failed {
        url: String,
        error: FetchError,
        elapsed: Duration,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct ImageMeasurement {
    size_bytes: Option<u64>,
    svg_title: Option<bool>,
}

/// HTTP access for the whole run. Clones share one request gate, so request
/// starts stay at least `throttle` apart across all of them.
#[derive(Debug, Clone)]
struct PageFetcher {
    client: reqwest::Client,
    throttle: Duration,
    last_request: Arc<tokio::sync::Mutex<Option<tokio::time::Instant>>>,
}

impl PageFetcher {
    fn new(user_agent: &str, throttle: Duration) -> Result<Self, AppError> {
        let builder = reqwest::Client::builder()
            .user_agent(user_agent)
            .connect_timeout(Duration::from_secs(10))
            .timeout(REQUEST_TIMEOUT)
            .pool_max_idle_per_host(8);
        #[cfg(test)]
        let builder = builder.no_proxy();
        Ok(Self {
            client: builder.build()?,
            throttle,
            last_request: Arc::new(tokio::sync::Mutex::new(None)),
        })
    }

    fn throttle(&self) -> Duration {
        self.throttle
    }

    /// Adds one second to the delay, up to the auto-throttle ceiling.
    /// Returns the new delay.
    fn escalate_throttle(&mut self) -> Duration {
        self.throttle = (self.throttle + Duration::from_secs(1)).min(MAX_AUTO_THROTTLE);
        self.throttle
    }

    /// Waits for this request's slot: `throttle` after the previous
    /// request started, from whichever clone it came.
    async fn pause(&self) {
        if self.throttle.is_zero() {
            return;
        }
        let slot = {
            let mut last = self.last_request.lock().await;
            let now = tokio::time::Instant::now();
            let slot = last.map_or(now, |previous| (previous + self.throttle).max(now));
            *last = Some(slot);
            slot
        };
        tokio::time::sleep_until(slot).await;
    }

    async fn fetch_page(&self, url: &str) -> PageFetch {
        self.pause().await;
        let started = Instant::now();
        let failed = |error: FetchError, started: Instant| PageFetch::Failed {
            url: url.to_string(),
            error,
            elapsed: started.elapsed(),
        };

        let response = match self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, HTML_ACCEPT)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => return failed(FetchError::Network(err.to_string()), started),
        };

        let status = response.status();
        if !status.is_success() {
            return failed(FetchError::Status(status.as_u16()), started);
        }
        let final_url = response.url().to_string();
        let content_type = header_string(response.headers(), reqwest::header::CONTENT_TYPE);
        let declared_html = content_type.to_ascii_lowercase().contains("html");

        let body = if declared_html || content_type.is_empty() {
            match response.text().await {
                Ok(text) if declared_html || looks_like_html(&text) => Some(text),
                Ok(_) => None,
                Err(err) => return failed(FetchError::Body(err.to_string()), started),
            }
        } else {
            None
        };

        PageFetch::Fetched(FetchedPage {
            url: url.to_string(),
            final_url,
            status: status.as_u16(),
            content_type,
            body,
            elapsed: started.elapsed(),
        })
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        self.pause().await;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| FetchError::Network(err.to_string()))?;
        if !response.status().is_success() {
            return Err(FetchError::Status(response.status().as_u16()));
        }
        response
            .bytes()
            .await
            .map(|bytes| bytes.to_vec())
            .map_err(|err| FetchError::Body(err.to_string()))
    }

    async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        let bytes = self.fetch_bytes(url).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// True when `url` answers a HEAD with 200 and an HTML content type.
    async fn is_html_page(&self, url: &str) -> bool {
        self.pause().await;
        match self.client.head(url).send().await {
            Ok(response) => {
                response.status().as_u16() == 200
                    && header_string(response.headers(), reqwest::header::CONTENT_TYPE)
                        .to_ascii_lowercase()
                        .contains("text/html")
            }
            Err(err) => {
                debug!(url, error = %err, "HEAD check failed");
                false
            }
        }
    }

    /// Measures an image. HEAD is enough when the server reports a length;
    /// otherwise, and always for SVGs, the body is downloaded.
    async fn measure_image(&self, url: &str, is_svg: bool) -> Result<ImageMeasurement, FetchError> {
        if !is_svg {
            self.pause().await;
            if let Ok(response) = self.client.head(url).send().await
                && response.status().is_success()
                && let Some(length) = declared_content_length(response.headers())
            {
                return Ok(ImageMeasurement {
                    size_bytes: Some(length),
                    svg_title: None,
                });
            }
        }

        let bytes = self.fetch_bytes(url).await?;
        Ok(ImageMeasurement {
            size_bytes: Some(bytes.len() as u64),
            svg_title: is_svg.then(|| svg_document_has_title(&bytes)),
        })
    }
}

fn header_string(headers: &reqwest::header::HeaderMap, name: reqwest::header::HeaderName) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .unwrap_or_default()
}

// `Response::content_length` reports the body hint, which is 0 for HEAD.
fn declared_content_length(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}

fn looks_like_html(body: &str) -> bool {
    let head = body
        .chars()
        .take(2048)
        .collect::<String>()
        .to_ascii_lowercase();
    head.contains("<html") || head.contains("<!doctype html") || head.contains("<body")
}

#[cfg(test)]
mod fetch_tests {
    use super::test_support::{MockServerExt, bytes, html};
    use super::*;
    use wiremock::MockServer;

    fn fetcher() -> PageFetcher {
        PageFetcher::new(DEFAULT_USER_AGENT, Duration::ZERO).unwrap()
    }

    #[tokio::test]
    async fn fetch_page_returns_html_body_and_timing() {
        let server = MockServer::start().await;
        server.route("/", html("<html><body>hi</body></html>")).await;
        match fetcher().fetch_page(&server.url("/")).await {
            PageFetch::Fetched(page) => {
                assert_eq!(page.status, 200);
                assert!(page.content_type.starts_with("text/html"));
                assert_eq!(page.body.as_deref(), Some("<html><body>hi</body></html>"));
                assert_eq!(page.url, server.url("/"));
            }
            PageFetch::Failed { error, .. } => panic!("unexpected failure: {error}"),
        }
    }

    #[tokio::test]
    async fn non_success_and_unreachable_urls_are_failures_not_errors() {
        let server = MockServer::start().await;
        match fetcher().fetch_page(&server.url("/missing")).await {
            PageFetch::Failed { error, .. } => assert_eq!(error, FetchError::Status(404)),
            PageFetch::Fetched(_) => panic!("404 must not count as fetched"),
        }
        match fetcher().fetch_page("http://127.0.0.1:9/").await {
            PageFetch::Failed { error, .. } => {
                assert!(matches!(error, FetchError::Network(_)))
            }
            PageFetch::Fetched(_) => panic!("closed port must fail"),
        }
    }

    #[tokio::test]
    async fn non_html_content_yields_no_body() {
        let server = MockServer::start().await;
        server
            .route("/data.bin", bytes("application/octet-stream", vec![1, 2, 3]))
            .await;
        match fetcher().fetch_page(&server.url("/data.bin")).await {
            PageFetch::Fetched(page) => assert!(page.body.is_none()),
            PageFetch::Failed { error, .. } => panic!("unexpected failure: {error}"),
        }
    }

    #[tokio::test]
    async fn image_measurement_uses_declared_length_and_reads_svg_titles() {
        let server = MockServer::start().await;
        server.route("/a.png", bytes("image/png", vec![0u8; 2048])).await;
        server
            .route(
                "/logo.svg",
                bytes(
                    "image/svg+xml",
                    b"<svg xmlns=\"http://www.w3.org/2000/svg\"><title>Acme logo</title></svg>".to_vec(),
                ),
            )
            .await;
        let fetcher = fetcher();

        let png = fetcher.measure_image(&server.url("/a.png"), false).await.unwrap();
        assert_eq!(png.size_bytes, Some(2048));
        assert_eq!(png.svg_title, None);
        assert_eq!(server.hit_count("HEAD", "/a.png").await, 1);
        assert_eq!(server.hit_count("GET", "/a.png").await, 0);

        let svg = fetcher.measure_image(&server.url("/logo.svg"), true).await.unwrap();
        assert_eq!(svg.svg_title, Some(true));
        assert_eq!(server.hit_count("GET", "/logo.svg").await, 1);

        assert_eq!(
            fetcher.measure_image(&server.url("/gone.png"), false).await,
            Err(FetchError::Status(404))
        );
    }

    #[tokio::test]
    async fn sequential_requests_wait_for_the_throttle() {
        let server = MockServer::start().await;
        server.route("/", html("<html></html>")).await;
        let fetcher = PageFetcher::new(DEFAULT_USER_AGENT, Duration::from_millis(150)).unwrap();

        let started = Instant::now();
        for _ in 0..3 {
            assert!(matches!(
                fetcher.fetch_page(&server.url("/")).await,
                PageFetch::Fetched(_)
            ));
        }
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn cloned_fetchers_share_one_throttle() {
        let server = MockServer::start().await;
        server.route("/a.bin", bytes("application/octet-stream", vec![1])).await;
        let fetcher = PageFetcher::new(DEFAULT_USER_AGENT, Duration::from_millis(200)).unwrap();

        let started = Instant::now();
        let mut set = JoinSet::new();
        for _ in 0..4 {
            let fetcher = fetcher.clone();
            let url = server.url("/a.bin");
            set.spawn(async move { fetcher.fetch_bytes(&url).await });
        }
        while let Some(joined) = set.join_next().await {
            assert!(joined.unwrap().is_ok());
        }
        assert!(started.elapsed() >= Duration::from_millis(600));
    }

    #[tokio::test]
    async fn throttle_escalation_is_capped() {
        let mut fetcher = PageFetcher::new(DEFAULT_USER_AGENT, Duration::from_secs(8)).unwrap();
        assert_eq!(fetcher.escalate_throttle(), Duration::from_secs(9));
        assert_eq!(fetcher.escalate_throttle(), Duration::from_secs(10));
        assert_eq!(fetcher.escalate_throttle(), Duration::from_secs(10));
        assert_eq!(fetcher.throttle(), Duration::from_secs(10));
    }
}
