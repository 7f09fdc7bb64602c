//! PGN movetext utilities: lightweight regex-based cleanup.

use std::sync::LazyLock;

use regex::Regex;

static HEADER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*\[[^\]]*\]\s*$").expect("valid header regex"));
static COMMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{[^}]*\}|;[^\n]*").expect("valid comment regex"));
static VARIATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\([^()]*\)").expect("valid variation regex"));
static NAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\$\d+").expect("valid NAG regex"));
static MOVE_NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+\.+").expect("valid move number regex"));

const RESULT_TOKENS: [&str; 4] = ["1-0", "0-1", "1/2-1/2", "*"];

/// Strip tag pairs, comments (including clock annotations), variations and
/// NAGs, and collapse whitespace. What remains is bare movetext.
pub fn normalize_movetext(pgn: &str) -> String {
    let no_headers = HEADER_RE.replace_all(pgn, " ");
    let no_comments = COMMENT_RE.replace_all(&no_headers, " ");

    // Variations can nest; peel innermost first.
    let mut text = no_comments.into_owned();
    while VARIATION_RE.is_match(&text) {
        text = VARIATION_RE.replace_all(&text, " ").into_owned();
    }

    let no_nags = NAG_RE.replace_all(&text, " ");
    no_nags.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Split movetext into SAN tokens, dropping move numbers ("12." / "12...")
/// and the game result. Annotation glyphs like `!` and `?` are trimmed.
pub fn san_tokens(pgn: &str) -> Vec<String> {
    normalize_movetext(pgn)
        .split_whitespace()
        .filter_map(|raw| {
            let token = MOVE_NUMBER_RE.replace(raw, "");
            let token = token.trim_end_matches(['!', '?']);
            if token.is_empty() || RESULT_TOKENS.contains(&token) {
                None
            } else {
                Some(token.to_string())
            }
        })
        .collect()
}

/// Extract a string value from a PGN header (e.g. FEN, White, Link).
pub fn extract_header(pgn: &str, header_name: &str) -> Option<String> {
    let pattern = format!(r#"\[{}\s+"([^"]*)"\]"#, regex::escape(header_name));
    let re = Regex::new(&pattern).ok()?;
    let value = re.captures(pgn)?.get(1)?.as_str().to_string();
    if value.is_empty() { None } else { Some(value) }
}
