const CSV_HEADERS: [&str; 7] = [
    "image_url",
    "alt_text",
    "title",
    "occurrence_count",
    "source_pages",
    "size_kb",
    "suggestions",
];
const SOURCE_PAGE_SEPARATOR: &str = "|";
const SUGGESTION_SEPARATOR: &str = "; ";
const GENERATED_ALT_COLUMN: &str = "generated_alt_text";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct ExportRecord {
    image_url: String,
    alt_text: String,
    alt_present: bool,
    title: String,
    occurrence_count: usize,
    source_pages: Vec<String>,
    size_kb: Option<f64>,
    suggestions: Vec<String>,
}

fn image_to_export_record(record: &ImageRecord) -> ExportRecord {
    ExportRecord {
        image_url: record.image_url.clone(),
        alt_text: record.alt_text.clone(),
        alt_present: record.alt_present,
        title: record.title_text.clone(),
        occurrence_count: record.occurrence_count,
        source_pages: record.source_pages.clone(),
        size_kb: record.size_kb().map(|kb| (kb * 100.0).round() / 100.0),
        suggestions: record
            .suggestions
            .iter()
            .map(|suggestion| suggestion.message().to_string())
            .collect(),
    }
}

fn format_size_kb(size_kb: Option<f64>) -> String {
    size_kb.map(|kb| format!("{kb:.2}")).unwrap_or_default()
}

struct CsvSink<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> CsvSink<W> {
    fn new(inner: W) -> io::Result<Self> {
        let mut writer = csv::Writer::from_writer(inner);
        writer.write_record(CSV_HEADERS)?;
        Ok(Self { writer })
    }

    fn write_record(&mut self, record: &ImageRecord) -> io::Result<()> {
        let rec = image_to_export_record(record);
        self.writer.write_record([
            rec.image_url,
            rec.alt_text,
            rec.title,
            rec.occurrence_count.to_string(),
            rec.source_pages.join(SOURCE_PAGE_SEPARATOR),
            format_size_kb(record.size_kb()),
            rec.suggestions.join(SUGGESTION_SEPARATOR),
        ])?;
        Ok(())
    }

    fn finalize(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

struct JsonSink<W: Write> {
    inner: W,
    first: bool,
}

impl<W: Write> JsonSink<W> {
    fn new(mut inner: W) -> io::Result<Self> {
        inner.write_all(b"[\n")?;
        Ok(Self { inner, first: true })
    }

    fn write_record(&mut self, record: &ImageRecord) -> io::Result<()> {
        if !self.first {
            self.inner.write_all(b",\n")?;
        }
        self.first = false;
        serde_json::to_writer(&mut self.inner, &image_to_export_record(record))
            .map_err(io::Error::other)
    }

    fn finalize(&mut self) -> io::Result<()> {
        if self.first {
            self.inner.write_all(b"]\n")?;
        } else {
            self.inner.write_all(b"\n]\n")?;
        }
        self.inner.flush()
    }
}

enum ReportSink<W: Write> {
    Csv(CsvSink<W>),
    Json(JsonSink<W>),
}

impl<W: Write> ReportSink<W> {
    fn new(inner: W, format: DataFormat) -> io::Result<Self> {
        match format {
            DataFormat::Csv => Ok(ReportSink::Csv(CsvSink::new(inner)?)),
            DataFormat::Json => Ok(ReportSink::Json(JsonSink::new(inner)?)),
        }
    }

    fn write_record(&mut self, record: &ImageRecord) -> io::Result<()> {
        match self {
            ReportSink::Csv(sink) => sink.write_record(record),
            ReportSink::Json(sink) => sink.write_record(record),
        }
    }

    fn finalize(&mut self) -> io::Result<()> {
        match self {
            ReportSink::Csv(sink) => sink.finalize(),
            ReportSink::Json(sink) => sink.finalize(),
        }
    }
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    path.with_file_name(name)
}

fn write_records_to(path: &Path, format: DataFormat, records: &[ImageRecord]) -> io::Result<()> {
    let file = io::BufWriter::new(File::create(path)?);
    let mut sink = ReportSink::new(file, format)?;
    for record in records {
        sink.write_record(record)?;
    }
    sink.finalize()
}

/// Writes the report next to its final location and renames it into place,
/// so a failure never leaves a half-written file at `path`.
fn write_report(
    path: &Path,
    format: DataFormat,
    records: &[ImageRecord],
    domain: &str,
) -> Result<(), AppError> {
    let output_error = |source: io::Error| AppError::OutputWrite {
        domain: domain.to_string(),
        path: path.display().to_string(),
        source,
    };

    let temp = partial_path(path);
    let written = write_records_to(&temp, format, records).and_then(|()| fs::rename(&temp, path));
    if let Err(err) = written {
        let _ = fs::remove_file(&temp);
        return Err(output_error(err));
    }
    debug!(path = %path.display(), records = records.len(), "report written");
    Ok(())
}

fn detect_data_format(path: &str, fallback: DataFormat) -> DataFormat {
    let lower = path.to_ascii_lowercase();
    if lower.ends_with(".json") {
        DataFormat::Json
    } else if lower.ends_with(".csv") {
        DataFormat::Csv
    } else {
        fallback
    }
}

fn default_output_path(site_label: &str, format: DataFormat) -> String {
    match format {
        DataFormat::Csv => format!("{site_label}_images.csv"),
        DataFormat::Json => format!("{site_label}_images.json"),
    }
}

fn input_error(path: &Path, source: io::Error) -> AppError {
    AppError::Input {
        path: path.display().to_string(),
        source,
    }
}

/// Page URLs from a CSV file (column `url`, any case) or a JSON file (an
/// array of strings or `{"urls": [...]}`). Blank and duplicate entries are
/// dropped.
fn load_urls_from_file(path: &Path) -> Result<Vec<String>, AppError> {
    let display = path.display().to_string();
    let urls = match detect_data_format(&display, DataFormat::Csv) {
        DataFormat::Json => {
            let content = fs::read_to_string(path).map_err(|err| input_error(path, err))?;
            let value = serde_json::from_str::<Value>(&content)?;
            let items: &[Value] = match &value {
                Value::Array(items) => items.as_slice(),
                Value::Object(map) => map
                    .get("urls")
                    .and_then(Value::as_array)
                    .map(Vec::as_slice)
                    .unwrap_or_default(),
                _ => &[],
            };
            items
                .iter()
                .filter_map(|item| match item {
                    Value::String(url) => Some(url.clone()),
                    Value::Object(map) => map.get("url").and_then(Value::as_str).map(str::to_string),
                    _ => None,
                })
                .collect::<Vec<_>>()
        }
        DataFormat::Csv => {
            let mut reader = csv::Reader::from_path(path)?;
            let headers = reader.headers()?.clone();
            let Some(column) = headers
                .iter()
                .position(|header| header.trim().eq_ignore_ascii_case("url"))
            else {
                return Err(AppError::NoUrls(format!("{display} (no url column)")));
            };
            let mut urls = Vec::new();
            for record in reader.records() {
                if let Some(value) = record?.get(column) {
                    urls.push(value.to_string());
                }
            }
            urls
        }
    };

    let mut seen = HashSet::new();
    Ok(urls
        .into_iter()
        .map(|url| url.trim().to_string())
        .filter(|url| !url.is_empty())
        .filter(|url| seen.insert(normalize_url(url, None).unwrap_or_else(|| url.clone())))
        .collect())
}

/// One row of a report read back for drafting. `fields` keeps every column
/// of the input so it can be written out unchanged.
#[derive(Debug, Clone, PartialEq)]
struct ReportRow {
    fields: Vec<String>,
    image_url: String,
    alt_text: String,
    title: String,
    source_pages: Vec<String>,
    suggestions: String,
}

#[derive(Debug, Clone, PartialEq)]
struct ReportTable {
    headers: Vec<String>,
    rows: Vec<ReportRow>,
}

/// Reads a report CSV. Both the current headers and the legacy
/// `Image_url`/`Alt_text`/`Title`/`Source_URLs`/`Suggestions` ones are
/// understood.
fn load_report_rows(path: &Path) -> Result<ReportTable, AppError> {
    let mut reader = csv::Reader::from_path(path)?;
    let headers = reader
        .headers()?
        .iter()
        .map(str::to_string)
        .collect::<Vec<_>>();
    let mut index = HashMap::<String, usize>::new();
    for (idx, header) in headers.iter().enumerate() {
        index.insert(header.trim().to_ascii_lowercase(), idx);
    }

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let get = |names: &[&str]| -> String {
            for name in names {
                if let Some(idx) = index.get(&name.to_ascii_lowercase())
                    && let Some(value) = record.get(*idx)
                {
                    return value.trim().to_string();
                }
            }
            String::new()
        };

        let image_url = get(&["image_url", "image url"]);
        let source_pages = get(&["source_pages", "source_urls", "source urls"])
            .split(['|', ','])
            .map(str::trim)
            .filter(|page| !page.is_empty())
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        rows.push(ReportRow {
            image_url,
            alt_text: get(&["alt_text", "alt text"]),
            title: get(&["title", "title_text"]),
            source_pages,
            suggestions: get(&["suggestions"]),
            fields: record.iter().map(str::to_string).collect(),
        });
    }

    Ok(ReportTable { headers, rows })
}

/// `report.csv` → `report_with_alt_text.csv`, in the same directory.
fn drafted_output_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "report".to_string());
    input.with_file_name(format!("{stem}_with_alt_text.csv"))
}

fn write_drafted_report(
    path: &Path,
    table: &ReportTable,
    generated: &[String],
) -> Result<(), AppError> {
    let output_error = |source: io::Error| AppError::OutputWrite {
        domain: "draft".to_string(),
        path: path.display().to_string(),
        source,
    };

    let temp = partial_path(path);
    let written = (|| -> io::Result<()> {
        let mut writer = csv::Writer::from_writer(io::BufWriter::new(File::create(&temp)?));
        let mut headers = table.headers.clone();
        headers.push(GENERATED_ALT_COLUMN.to_string());
        writer.write_record(&headers)?;
        for (row, text) in table.rows.iter().zip(generated) {
            let mut fields = row.fields.clone();
            fields.resize(table.headers.len(), String::new());
            fields.push(text.clone());
            writer.write_record(&fields)?;
        }
        writer.flush()
    })()
    .and_then(|()| fs::rename(&temp, path));

    if let Err(err) = written {
        let _ = fs::remove_file(&temp);
        return Err(output_error(err));
    }
    Ok(())
}
