#[derive(Debug, Default)]
struct ProgressState {
    pages_ok: usize,
    pages_failed: usize,
    images_seen: usize,
    discovered: usize,
    errors: usize,
    done: bool,
}

impl ProgressState {
    fn visited(&self) -> usize {
        self.pages_ok + self.pages_failed
    }
}

fn handle_crawl_event(state: &mut ProgressState, event: CrawlEvent) {
    match event {
        CrawlEvent::Page {
            url,
            status,
            elapsed_ms,
            images,
        } => {
            state.pages_ok += 1;
            state.images_seen += images;
            info!(
                status,
                elapsed_ms = elapsed_ms as u64,
                images,
                "[{}/{}] {url}",
                state.visited(),
                state.discovered.max(state.visited())
            );
        }
        CrawlEvent::Unretrieved { url, reason } => {
            state.pages_failed += 1;
            warn!("unretrieved {url}: {reason}");
        }
        CrawlEvent::Stats { discovered } => {
            state.discovered = state.discovered.max(discovered);
        }
        CrawlEvent::Finished => state.done = true,
        CrawlEvent::Status(message) => info!("{message}"),
        CrawlEvent::Error(err) => {
            state.errors += 1;
            warn!("{err}");
        }
    }
}

fn init_tracing(verbose: u8, quiet: bool) {
    let level = if quiet {
        "warn"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("warn,altscan={level}").into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(io::stderr),
        )
        .try_init();
}

pub async fn run() -> Result<(), AppError> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);
    match cli.command {
        Command::Run(args) => run_scan(args).await,
        Command::Draft(args) => run_draft_command(args).await,
    }
}

fn scan_summary(report: &CrawlReport, output_path: &str) -> String {
    let flagged = report
        .images
        .iter()
        .filter(|image| !image.suggestions.is_empty())
        .count();
    format!(
        "{} scan of {} finished: {} pages visited ({} fetched, {} failed), {} images ({} flagged), report written to {}",
        report.mode.label(),
        report.site_label,
        report.pages_visited,
        report.pages_fetched,
        report.pages_failed,
        report.images.len(),
        flagged,
        output_path
    )
}

async fn run_scan(args: RunArgs) -> Result<(), AppError> {
    let config = CrawlConfig::from(&args);
    let site = Site::parse(&config.domain)?;
    let configured_format: DataFormat = args.format.into();
    let output_format = args
        .output
        .as_deref()
        .map(|path| detect_data_format(path, configured_format))
        .unwrap_or(configured_format);
    let output_path = args
        .output
        .clone()
        .unwrap_or_else(|| default_output_path(&site.label(), output_format));
    let domain = config.domain.clone();
    info!(
        site = %site.start_url,
        sample_size = config.sample_size,
        throttle_secs = config.throttle.as_secs(),
        crawl_only = config.crawl_only,
        "starting scan"
    );

    let (tx, mut rx) = mpsc::unbounded_channel::<CrawlEvent>();
    let crawl_handle = tokio::spawn(run_crawler(config, tx));
    let mut progress = ProgressState::default();
    while let Some(event) = rx.recv().await {
        handle_crawl_event(&mut progress, event);
    }
    let report = crawl_handle
        .await
        .map_err(|err| AppError::Task(err.to_string()))??;
    debug!(
        pages_discovered = report.pages_discovered,
        images_seen = progress.images_seen,
        errors = progress.errors,
        finished = progress.done,
        "event stream closed"
    );

    write_report(
        Path::new(&output_path),
        output_format,
        &report.images,
        &domain,
    )?;

    for failed in &report.failed_pages {
        debug!(url = %failed.url, "failed page: {}", failed.reason);
    }
    if report.aborted {
        warn!(
            "scan stopped early after {} consecutive failures; the report is partial",
            args.max_consecutive_failures
        );
    }
    if report.final_throttle > Duration::from_secs(args.throttle) {
        info!(
            "throttle ended at {}s after automatic slow-down",
            report.final_throttle.as_secs()
        );
    }
    info!("{}", scan_summary(&report, &output_path));
    Ok(())
}

async fn run_draft_command(args: DraftArgs) -> Result<(), AppError> {
    let (tx, mut rx) = mpsc::unbounded_channel::<CrawlEvent>();
    let draft_handle = tokio::spawn(async move { run_draft(&args, &tx).await });
    let mut progress = ProgressState::default();
    while let Some(event) = rx.recv().await {
        match event {
            CrawlEvent::Status(message) => debug!("{message}"),
            other => handle_crawl_event(&mut progress, other),
        }
    }
    let summary = draft_handle
        .await
        .map_err(|err| AppError::Task(err.to_string()))??;
    info!(
        "drafted {} of {} rows ({} skipped, {} failed), written to {}",
        summary.drafted,
        summary.rows,
        summary.skipped,
        summary.failed,
        summary.output.display()
    );
    Ok(())
}
