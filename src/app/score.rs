const MIN_ALT_LENGTH: usize = 25;
const MAX_ALT_LENGTH: usize = 250;
const LARGE_IMAGE_BYTES: u64 = 250 * 1024;

/// Matched on word boundaries anywhere in the alt text.
const GENERIC_PHRASES: [&str; 9] = [
    "image of",
    "graphic of",
    "picture of",
    "photo of",
    "placeholder",
    "spacer",
    "tbd",
    "todo",
    "to do",
];

/// Matched against the whole alt text.
const MEANINGLESS_VALUES: [&str; 11] = [
    "alt",
    "alt text",
    "chart",
    "decorative",
    "image",
    "graphic",
    "photo",
    "placeholder image",
    "null",
    "none",
    "undefined",
];

const IMAGE_FILE_EXTENSIONS: [&str; 12] = [
    "jpg", "jpeg", "png", "gif", "svg", "webp", "bmp", "tif", "tiff", "avif", "ico", "heic",
];
const CAMERA_FILE_PREFIXES: [&str; 4] = ["img_", "img-", "dsc_", "dscn"];

/// Runs every rule in order and returns all that match.
fn score_image(record: &ImageRecord, config: &ScoreConfig) -> Vec<Suggestion> {
    let alt = record.alt_text.trim();
    let length = alt.chars().count();
    let mut suggestions = Vec::new();

    if alt.is_empty() && !record.decorative {
        suggestions.push(Suggestion::MissingAlt);
    }
    if alt.is_empty() && record.decorative {
        suggestions.push(Suggestion::DecorativeCheck);
    }
    if length > 0 && length < MIN_ALT_LENGTH {
        suggestions.push(Suggestion::AltTooShort);
    }
    if length > MAX_ALT_LENGTH {
        suggestions.push(Suggestion::AltTooVerbose);
    }
    if !alt.is_empty() && is_generic_alt(alt) {
        suggestions.push(Suggestion::GenericPhrasing);
    }
    if length >= MIN_ALT_LENGTH && flesch_kincaid_grade(alt) > config.readability_threshold {
        suggestions.push(Suggestion::HardToRead);
    }
    if record.size_bytes.is_some_and(|bytes| bytes > LARGE_IMAGE_BYTES) {
        suggestions.push(Suggestion::LargeFile);
    }
    if record.is_svg() && record.svg_title == Some(false) {
        suggestions.push(Suggestion::SvgMissingTitle);
    }

    suggestions
}

fn score_registry(records: &mut [ImageRecord], config: &ScoreConfig) {
    for record in records.iter_mut() {
        record.suggestions = score_image(record, config);
    }
}

fn alt_words(alt: &str) -> Vec<String> {
    alt.split(|ch: char| !ch.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn is_generic_alt(alt: &str) -> bool {
    let trimmed = alt.trim();
    let whole = trimmed
        .trim_end_matches(['.', '!', '?', ':'])
        .trim()
        .to_lowercase();
    if MEANINGLESS_VALUES.contains(&whole.as_str()) || looks_like_file_name(trimmed) {
        return true;
    }

    let padded = format!(" {} ", alt_words(trimmed).join(" "));
    GENERIC_PHRASES
        .iter()
        .any(|phrase| padded.contains(&format!(" {phrase} ")))
}

/// `IMG_0042.jpg`, `hero-banner.webp`, `DSCN1234` and similar.
fn looks_like_file_name(alt: &str) -> bool {
    if alt.is_empty() || alt.chars().any(char::is_whitespace) {
        return false;
    }
    let lower = alt.to_ascii_lowercase();
    if let Some((stem, ext)) = lower.rsplit_once('.')
        && !stem.is_empty()
        && IMAGE_FILE_EXTENSIONS.contains(&ext)
    {
        return true;
    }
    CAMERA_FILE_PREFIXES.iter().any(|prefix| {
        lower
            .strip_prefix(prefix)
            .is_some_and(|rest| !rest.is_empty() && rest.chars().all(|ch| ch.is_ascii_digit()))
    })
}

/// Flesch–Kincaid grade level:
/// `0.39 * words/sentences + 11.8 * syllables/words - 15.59`.
fn flesch_kincaid_grade(text: &str) -> f64 {
    let words = text
        .split_whitespace()
        .map(|token| {
            token
                .chars()
                .filter(|ch| ch.is_alphabetic())
                .collect::<String>()
        })
        .filter(|word| !word.is_empty())
        .collect::<Vec<_>>();
    if words.is_empty() {
        return 0.0;
    }
    let sentences = text
        .split(['.', '!', '?'])
        .filter(|segment| segment.chars().any(char::is_alphanumeric))
        .count()
        .max(1);
    let syllables: usize = words.iter().map(|word| count_syllables(word)).sum();

    let words = words.len() as f64;
    0.39 * (words / sentences as f64) + 11.8 * (syllables as f64 / words) - 15.59
}

/// Vowel-group estimate with a silent trailing `e`. Never below one.
fn count_syllables(word: &str) -> usize {
    let lower = word.to_lowercase();
    let chars = lower.chars().collect::<Vec<_>>();
    let is_vowel = |ch: char| matches!(ch, 'a' | 'e' | 'i' | 'o' | 'u' | 'y');

    let mut groups = 0usize;
    let mut previous_vowel = false;
    for &ch in &chars {
        let vowel = is_vowel(ch);
        if vowel && !previous_vowel {
            groups += 1;
        }
        previous_vowel = vowel;
    }

    let len = chars.len();
    if groups > 1
        && len > 2
        && chars[len - 1] == 'e'
        && !is_vowel(chars[len - 2])
        && !(chars[len - 2] == 'l' && !is_vowel(chars[len - 3]))
    {
        groups -= 1;
    }
    groups.max(1)
}
