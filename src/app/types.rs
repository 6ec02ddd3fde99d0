#[derive(Debug, Parser, Clone)]
#[command(
    name = "altscan",
    version,
    about = "Image alt-text auditor: sitemap walking, crawling and WCAG heuristics with CSV output"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Raise log verbosity (-v debug, -vv trace). RUST_LOG wins when set.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[arg(short, long, default_value_t = false, global = true)]
    quiet: bool,
}

#[derive(Debug, Subcommand, Clone)]
enum Command {
    /// Discover pages of a site, collect its images and score their alt text
    Run(RunArgs),
    /// Draft alt text for every image of a report through a vision model endpoint
    Draft(DraftArgs),
}

#[derive(Debug, Args, Clone)]
struct RunArgs {
    #[arg(value_name = "DOMAIN")]
    domain: String,

    #[arg(
        short = 's',
        long = "sample_size",
        alias = "sample-size",
        value_name = "N",
        default_value_t = 100
    )]
    sample_size: usize,

    #[arg(short = 't', long, value_name = "SECONDS", default_value_t = 1)]
    throttle: u64,

    #[arg(long = "crawl_only", alias = "crawl-only", default_value_t = false)]
    crawl_only: bool,

    #[arg(short, long, value_name = "FILE")]
    output: Option<String>,

    #[arg(long, value_enum, default_value_t = FileFormatArg::Csv)]
    format: FileFormatArg,

    #[arg(long, value_name = "URL", conflicts_with = "crawl_only")]
    sitemap: Option<String>,

    #[arg(long, value_name = "FILE", conflicts_with_all = ["crawl_only", "sitemap"])]
    urls_file: Option<String>,

    /// Take the pages to scan from the item links of an RSS or Atom feed
    #[arg(
        short = 'r',
        long,
        value_name = "URL",
        conflicts_with_all = ["crawl_only", "sitemap", "urls_file"]
    )]
    rss: Option<String>,

    #[arg(long, value_name = "N", default_value_t = 10)]
    max_consecutive_failures: usize,

    #[arg(long, value_name = "GRADE", default_value_t = DEFAULT_READABILITY_GRADE)]
    readability_threshold: f64,

    #[arg(long, value_name = "N", default_value_t = 4)]
    fetch_concurrency: usize,

    #[arg(long, value_name = "LIST", value_delimiter = ',')]
    exclude_ext: Option<Vec<String>>,

    #[arg(long, value_name = "N")]
    seed: Option<u64>,

    #[arg(long, value_name = "UA")]
    user_agent: Option<String>,

    #[arg(long, default_value_t = false)]
    no_auto_throttle: bool,

    #[arg(long, default_value_t = false)]
    no_key_pages: bool,
}

#[derive(Debug, Args, Clone)]
struct DraftArgs {
    #[arg(value_name = "CSV")]
    input: String,

    #[arg(short, long, value_name = "FILE")]
    output: Option<String>,

    #[arg(
        long,
        env = "OLLAMA_HOST",
        value_name = "URL",
        default_value = "http://localhost:11434"
    )]
    ollama_url: String,

    #[arg(long, value_name = "NAME", default_value = "llava")]
    model: String,

    #[arg(long, value_name = "TEXT", default_value = DEFAULT_DRAFT_INSTRUCTIONS)]
    instructions: String,

    #[arg(long, default_value_t = false)]
    only_flagged: bool,

    #[arg(short = 't', long, value_name = "SECONDS", default_value_t = 0)]
    throttle: u64,

    #[arg(long, value_name = "UA")]
    user_agent: Option<String>,
}

#[derive(Debug, Copy, Clone, ValueEnum, PartialEq, Eq)]
enum FileFormatArg {
    Csv,
    Json,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum DataFormat {
    Csv,
    Json,
}

impl From<FileFormatArg> for DataFormat {
    fn from(value: FileFormatArg) -> Self {
        match value {
            FileFormatArg::Csv => DataFormat::Csv,
            FileFormatArg::Json => DataFormat::Json,
        }
    }
}

const DEFAULT_READABILITY_GRADE: f64 = 8.0;
const MAX_FETCH_CONCURRENCY: usize = 64;

fn sanitize_fetch_concurrency(value: usize) -> usize {
    value.clamp(1, MAX_FETCH_CONCURRENCY)
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct ScoreConfig {
    readability_threshold: f64,
}

impl Default for ScoreConfig {
    fn default() -> Self {
        Self {
            readability_threshold: DEFAULT_READABILITY_GRADE,
        }
    }
}

/// Everything a scan needs, resolved from the command line once and then
/// handed to each component explicitly.
#[derive(Debug, Clone)]
struct CrawlConfig {
    domain: String,
    sample_size: usize,
    throttle: Duration,
    crawl_only: bool,
    sitemap_url: Option<String>,
    urls_file: Option<String>,
    rss_url: Option<String>,
    /// 0 disables the early abort.
    max_consecutive_failures: usize,
    fetch_concurrency: usize,
    excluded_extensions: Vec<String>,
    seed: Option<u64>,
    user_agent: String,
    auto_throttle: bool,
    check_key_pages: bool,
    score: ScoreConfig,
}

impl CrawlConfig {
    #[cfg(test)]
    fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            sample_size: 100,
            throttle: Duration::from_secs(1),
            crawl_only: false,
            sitemap_url: None,
            urls_file: None,
            rss_url: None,
            max_consecutive_failures: 10,
            fetch_concurrency: 4,
            excluded_extensions: default_excluded_extensions(),
            seed: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            auto_throttle: true,
            check_key_pages: true,
            score: ScoreConfig::default(),
        }
    }
}

impl From<&RunArgs> for CrawlConfig {
    fn from(args: &RunArgs) -> Self {
        let excluded_extensions = args
            .exclude_ext
            .as_ref()
            .map(|list| {
                list.iter()
                    .map(|ext| ext.trim().trim_start_matches('.').to_ascii_lowercase())
                    .filter(|ext| !ext.is_empty())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_else(default_excluded_extensions);

        Self {
            domain: args.domain.clone(),
            sample_size: args.sample_size.max(1),
            throttle: Duration::from_secs(args.throttle),
            crawl_only: args.crawl_only,
            sitemap_url: args.sitemap.clone(),
            urls_file: args.urls_file.clone(),
            rss_url: args.rss.clone(),
            max_consecutive_failures: args.max_consecutive_failures,
            fetch_concurrency: sanitize_fetch_concurrency(args.fetch_concurrency),
            excluded_extensions,
            seed: args.seed,
            user_agent: args
                .user_agent
                .clone()
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            auto_throttle: !args.no_auto_throttle,
            check_key_pages: !args.no_key_pages,
            score: ScoreConfig {
                readability_threshold: args.readability_threshold,
            },
        }
    }
}

/// One row of the report: a distinct image and everything observed about it.
#[derive(Debug, Clone, PartialEq)]
struct ImageRecord {
    /// Absolute URL as first resolved on a page; the registry key is its
    /// normalized form.
    image_url: String,
    alt_text: String,
    alt_present: bool,
    title_text: String,
    decorative: bool,
    occurrence_count: usize,
    source_pages: Vec<String>,
    size_bytes: Option<u64>,
    /// Whether the fetched SVG document carries a non-empty `<title>`.
    svg_title: Option<bool>,
    suggestions: Vec<Suggestion>,
}

impl ImageRecord {
    fn is_svg(&self) -> bool {
        is_svg_url(&self.image_url)
    }

    fn size_kb(&self) -> Option<f64> {
        self.size_bytes.map(|bytes| bytes as f64 / 1024.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Suggestion {
    MissingAlt,
    DecorativeCheck,
    AltTooShort,
    AltTooVerbose,
    GenericPhrasing,
    HardToRead,
    LargeFile,
    SvgMissingTitle,
}

impl Suggestion {
    fn label(self) -> &'static str {
        match self {
            Suggestion::MissingAlt => "missing_alt",
            Suggestion::DecorativeCheck => "decorative_check",
            Suggestion::AltTooShort => "alt_too_short",
            Suggestion::AltTooVerbose => "alt_too_verbose",
            Suggestion::GenericPhrasing => "generic_phrasing",
            Suggestion::HardToRead => "hard_to_read",
            Suggestion::LargeFile => "large_file",
            Suggestion::SvgMissingTitle => "svg_missing_title",
        }
    }

    fn message(self) -> &'static str {
        match self {
            Suggestion::MissingAlt => "No alt text provided.",
            Suggestion::DecorativeCheck => "Decorative image — verify intentional.",
            Suggestion::AltTooShort => "Alt text may be too short.",
            Suggestion::AltTooVerbose => "Alt text is too verbose.",
            Suggestion::GenericPhrasing => "Avoid generic phrasing.",
            Suggestion::HardToRead => "Consider simplifying for readability.",
            Suggestion::LargeFile => "Large image file — consider optimizing.",
            Suggestion::SvgMissingTitle => "Check if the SVG includes a descriptive title.",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DiscoveryMode {
    Sitemap,
    Crawl,
    UrlList,
    Feed,
}

impl DiscoveryMode {
    fn label(self) -> &'static str {
        match self {
            DiscoveryMode::Sitemap => "sitemap",
            DiscoveryMode::Crawl => "crawl",
            DiscoveryMode::UrlList => "url_list",
            DiscoveryMode::Feed => "rss",
        }
    }
}

#[derive(Debug)]
enum CrawlEvent {
    Page {
        url: String,
        status: u16,
        elapsed_ms: u128,
        images: usize,
    },
    Unretrieved {
        url: String,
        reason: String,
    },
    Stats {
        discovered: usize,
    },
    Finished,
    Status(String),
    Error(String),
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("invalid domain '{domain}': {reason}")]
    InvalidDomain { domain: String, reason: String },

    #[error("failed to write report for {domain} to {path}")]
    OutputWrite {
        domain: String,
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to read {path}")]
    Input {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("feed {url} unusable: {reason}")]
    Feed { url: String, reason: String },

    #[error("no usable URLs in {0}")]
    NoUrls(String),

    #[error("HTTP client setup failed")]
    Client(#[from] reqwest::Error),

    #[error("CSV error")]
    Csv(#[from] csv::Error),

    #[error("JSON error")]
    Json(#[from] serde_json::Error),

    #[error("crawler task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
enum FetchError {
    #[error("request failed: {0}")]
    Network(String),

    #[error("http {0}")]
    Status(u16),

    #[error("body read failed: {0}")]
    Body(String),
}

#[derive(Debug, thiserror::Error)]
enum SitemapError {
    #[error("sitemap {url} unreachable: {source}")]
    Fetch {
        url: String,
        #[source]
        source: FetchError,
    },

    #[error("sitemap {url} could not be inflated: {source}")]
    Gzip {
        url: String,
        #[source]
        source: io::Error,
    },

    #[error("sitemap {url} is not well-formed XML: {reason}")]
    Malformed { url: String, reason: String },

    #[error("{url} is not a sitemap (root element <{root}>)")]
    NotASitemap { url: String, root: String },

    #[error("sitemap {url} resolved no page URLs")]
    Empty { url: String },
}

/// Per-row failure while drafting; written into the output cell.
#[derive(Debug, thiserror::Error)]
enum DraftError {
    #[error("missing image URL")]
    MissingImageUrl,

    #[error("image download failed: {0}")]
    Image(FetchError),

    #[error("vision endpoint unreachable: {0}")]
    Endpoint(String),

    #[error("vision endpoint answered http {0}")]
    Status(u16),

    #[error("vision endpoint returned no text")]
    EmptyResponse,
}

pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}
