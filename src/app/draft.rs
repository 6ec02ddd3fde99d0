const DEFAULT_DRAFT_INSTRUCTIONS: &str = "Provide meaningful, concise alternative text for images, adhering to accessibility standards (WCAG 1.1.1).";
const VISION_TIMEOUT: Duration = Duration::from_secs(120);

/// Boilerplate models like to open with. Removed wherever it appears.
const UNHELPFUL_PHRASES: [&str; 6] = [
    "The image is",
    "This is an image of",
    "The alt text is",
    "file with",
    "a jpg file",
    "a png file",
];

/// Client for an Ollama-compatible `/api/generate` endpoint.
#[derive(Debug, Clone)]
struct VisionClient {
    client: reqwest::Client,
    generate_url: String,
    model: String,
}

impl VisionClient {
    fn new(endpoint: &str, model: &str) -> Result<Self, AppError> {
        let builder = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(VISION_TIMEOUT);
        #[cfg(test)]
        let builder = builder.no_proxy();
        Ok(Self {
            client: builder.build()?,
            generate_url: generate_endpoint(endpoint),
            model: model.to_string(),
        })
    }

    async fn describe(&self, prompt: &str, image: &[u8]) -> Result<String, DraftError> {
        let payload = json!({
            "model": self.model,
            "prompt": prompt,
            "images": [BASE64_STANDARD.encode(image)],
            "stream": false,
        });
        let response = self
            .client
            .post(&self.generate_url)
            .json(&payload)
            .send()
            .await
            .map_err(|err| DraftError::Endpoint(err.to_string()))?;
        if !response.status().is_success() {
            return Err(DraftError::Status(response.status().as_u16()));
        }
        let body = response
            .json::<Value>()
            .await
            .map_err(|err| DraftError::Endpoint(err.to_string()))?;
        body.get("response")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(str::to_string)
            .ok_or(DraftError::EmptyResponse)
    }
}

fn generate_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim().trim_end_matches('/');
    let base = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    };
    if base.ends_with("/api/generate") {
        base
    } else {
        format!("{base}/api/generate")
    }
}

fn build_draft_prompt(row: &ReportRow, instructions: &str) -> String {
    let pages = if row.source_pages.is_empty() {
        "no associated pages".to_string()
    } else {
        row.source_pages
            .iter()
            .take(10)
            .cloned()
            .collect::<Vec<_>>()
            .join(", ")
    };
    let alt = if row.alt_text.is_empty() {
        "none"
    } else {
        row.alt_text.as_str()
    };
    let title = if row.title.is_empty() {
        "none"
    } else {
        row.title.as_str()
    };

    format!(
        "Write alternative text for the attached image that complies with WCAG 1.1.1.\n\
         Image URL: {url}\n\
         Current alt text: '{alt}'\n\
         Current title text: '{title}'\n\
         If the current alt text is accurate and sufficient, return it unchanged. \
         Otherwise describe the visual content and what it adds to the page in one concise sentence.\n\
         Do not mention file names. Avoid phrases such as 'image of', 'picture of', 'photo of', \
         'graphic of', and placeholder words such as 'spacer', 'tbd' or 'todo'.\n\
         The image appears on: {pages}\n\
         Instructions: {instructions}\n",
        url = row.image_url,
    )
}

fn remove_ascii_case_insensitive(text: &str, phrase: &str) -> String {
    let needle = phrase.to_ascii_lowercase();
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.to_ascii_lowercase().find(&needle) {
        out.push_str(&rest[..pos]);
        rest = &rest[pos + needle.len()..];
    }
    out.push_str(rest);
    out
}

fn clean_generated_alt(text: &str) -> String {
    let mut cleaned = text.to_string();
    for phrase in UNHELPFUL_PHRASES {
        cleaned = remove_ascii_case_insensitive(&cleaned, phrase);
    }
    cleaned
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_matches(|ch| ch == '.' || ch == ' ')
        .to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct DraftSummary {
    output: PathBuf,
    rows: usize,
    drafted: usize,
    skipped: usize,
    failed: usize,
}

async fn draft_row(
    row: &ReportRow,
    fetcher: &PageFetcher,
    vision: &VisionClient,
    instructions: &str,
) -> Result<String, DraftError> {
    if row.image_url.is_empty() {
        return Err(DraftError::MissingImageUrl);
    }
    let image = fetcher
        .fetch_bytes(&row.image_url)
        .await
        .map_err(DraftError::Image)?;
    let generated = vision
        .describe(&build_draft_prompt(row, instructions), &image)
        .await?;
    let cleaned = clean_generated_alt(&generated);
    if cleaned.is_empty() {
        return Err(DraftError::EmptyResponse);
    }
    Ok(cleaned)
}

/// Drafts alt text for each row of a report and writes the table back out
/// with a `generated_alt_text` column. Row failures become `error: …` cells.
async fn run_draft(args: &DraftArgs, tx: &UnboundedSender<CrawlEvent>) -> Result<DraftSummary, AppError> {
    let input = Path::new(&args.input);
    let table = load_report_rows(input)?;
    let output = args
        .output
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(|| drafted_output_path(input));
    let user_agent = args.user_agent.as_deref().unwrap_or(DEFAULT_USER_AGENT);
    let fetcher = PageFetcher::new(user_agent, Duration::from_secs(args.throttle))?;
    let vision = VisionClient::new(&args.ollama_url, &args.model)?;
    info!(
        rows = table.rows.len(),
        endpoint = %vision.generate_url,
        model = %vision.model,
        "drafting alt text"
    );

    let mut summary = DraftSummary {
        output: output.clone(),
        rows: table.rows.len(),
        drafted: 0,
        skipped: 0,
        failed: 0,
    };
    let mut generated = Vec::with_capacity(table.rows.len());
    for (idx, row) in table.rows.iter().enumerate() {
        if args.only_flagged && row.suggestions.is_empty() {
            summary.skipped += 1;
            generated.push(String::new());
            continue;
        }
        match draft_row(row, &fetcher, &vision, &args.instructions).await {
            Ok(text) => {
                summary.drafted += 1;
                debug!(row = idx + 1, image = %row.image_url, "drafted: {text}");
                generated.push(text);
            }
            Err(err) => {
                summary.failed += 1;
                let _ = tx.send(CrawlEvent::Unretrieved {
                    url: row.image_url.clone(),
                    reason: err.to_string(),
                });
                generated.push(format!("error: {err}"));
            }
        }
        send_status(
            tx,
            format!("drafted {}/{} rows", idx + 1, table.rows.len()),
        );
    }

    write_drafted_report(&output, &table, &generated)?;
    let _ = tx.send(CrawlEvent::Finished);
    Ok(summary)
}

#[cfg(test)]
mod draft_tests {
    use super::test_support::{MockServerExt, bytes, json as json_body, status};
    use super::*;
    use wiremock::MockServer;

    fn draft_args(input: &Path, server: &MockServer) -> DraftArgs {
        DraftArgs {
            input: input.to_string_lossy().into_owned(),
            output: None,
            ollama_url: server.url(""),
            model: "llava".to_string(),
            instructions: DEFAULT_DRAFT_INSTRUCTIONS.to_string(),
            only_flagged: false,
            throttle: 0,
            user_agent: None,
        }
    }

    #[test]
    fn generated_text_loses_boilerplate() {
        assert_eq!(
            clean_generated_alt("The image is a red bicycle leaning on a wall."),
            "a red bicycle leaning on a wall"
        );
        assert_eq!(
            clean_generated_alt("This is an image of  two hikers on a ridge. "),
            "two hikers on a ridge"
        );
        assert_eq!(clean_generated_alt("Team logo, a PNG file"), "Team logo,");
        assert_eq!(clean_generated_alt("Harbor at dusk"), "Harbor at dusk");
    }

    #[test]
    fn endpoints_gain_scheme_and_path() {
        assert_eq!(generate_endpoint("localhost:11434"), "http://localhost:11434/api/generate");
        assert_eq!(
            generate_endpoint("http://gpu-box:11434/"),
            "http://gpu-box:11434/api/generate"
        );
        assert_eq!(
            generate_endpoint("https://vision.internal/api/generate"),
            "https://vision.internal/api/generate"
        );
    }

    #[test]
    fn prompt_carries_row_context() {
        let row = ReportRow {
            fields: Vec::new(),
            image_url: "https://example.com/cat.png".to_string(),
            alt_text: String::new(),
            title: "Tom".to_string(),
            source_pages: vec!["https://example.com/pets".to_string()],
            suggestions: "No alt text provided.".to_string(),
        };
        let prompt = build_draft_prompt(&row, "Keep it short.");
        assert!(prompt.contains("https://example.com/cat.png"));
        assert!(prompt.contains("Current alt text: 'none'"));
        assert!(prompt.contains("Current title text: 'Tom'"));
        assert!(prompt.contains("https://example.com/pets"));
        assert!(prompt.contains("Instructions: Keep it short."));
    }

    #[tokio::test]
    async fn drafts_rows_through_the_vision_endpoint() {
        let server = MockServer::start().await;
        server.route("/cat.png", bytes("image/png", vec![7, 7, 7])).await;
        server
            .route(
                "/api/generate",
                json_body(json!({
                    "model": "llava",
                    "response": "The image is a red bicycle leaning on a wall.",
                    "done": true
                })),
            )
            .await;

        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("site_images.csv");
        fs::write(
            &input,
            format!(
                "image_url,alt_text,title,occurrence_count,source_pages,size_kb,suggestions\n\
                 {cat},,,1,https://example.com/,,No alt text provided.\n\
                 {gone},Harbor at dusk with boats,,1,https://example.com/,,\n\
                 {gone},,,1,https://example.com/,,No alt text provided.\n",
                cat = server.url("/cat.png"),
                gone = server.url("/gone.png"),
            ),
        )
        .unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        let mut args = draft_args(&input, &server);
        args.only_flagged = true;
        let summary = run_draft(&args, &tx).await.unwrap();

        assert_eq!(summary.output, dir.path().join("site_images_with_alt_text.csv"));
        assert_eq!((summary.drafted, summary.skipped, summary.failed), (1, 1, 1));

        let mut reader = csv::Reader::from_path(&summary.output).unwrap();
        let generated = reader
            .records()
            .map(|r| r.unwrap().get(7).unwrap_or_default().to_string())
            .collect::<Vec<_>>();
        assert_eq!(generated[0], "a red bicycle leaning on a wall");
        assert_eq!(generated[1], "");
        assert!(generated[2].starts_with("error: image download failed"));

        let request = server
            .received_requests()
            .await
            .unwrap()
            .into_iter()
            .find(|req| req.url.path() == "/api/generate")
            .unwrap();
        let body: Value = serde_json::from_slice(&request.body).unwrap();
        assert_eq!(body["model"], "llava");
        assert_eq!(body["stream"], false);
        assert_eq!(body["images"][0], BASE64_STANDARD.encode([7u8, 7, 7]));
        assert_eq!(server.hit_count("POST", "/api/generate").await, 1);
    }

    #[tokio::test]
    async fn endpoint_errors_become_error_cells() {
        let server = MockServer::start().await;
        server.route("/cat.png", bytes("image/png", vec![1])).await;
        server.route("/api/generate", status(500)).await;

        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("report.csv");
        fs::write(
            &input,
            format!("image_url,alt_text\n{},\n,\n", server.url("/cat.png")),
        )
        .unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        let summary = run_draft(&draft_args(&input, &server), &tx).await.unwrap();
        assert_eq!(summary.failed, 2);

        let content = fs::read_to_string(&summary.output).unwrap();
        assert!(content.contains("error: vision endpoint answered http 500"));
        assert!(content.contains("error: missing image URL"));
    }
}
