use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;
use uuid::Uuid;

static INVITE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"/invite/([A-Za-z0-9-]+)").unwrap());

/// Build a fully qualified invite link for a token.
pub fn invite_url(origin: &Url, token: &Uuid) -> String {
    format!("{}/invite/{}", origin.as_str().trim_end_matches('/'), token)
}

/// Extract the opaque token from a pasted invite link or bare token.
/// Accepts full URLs, path fragments and raw tokens; trailing slashes are
/// stripped. Returns `None` for empty input.
pub fn extract_token(input: &str) -> Option<String> {
    let trimmed = input.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    if let Some(cap) = INVITE_RE.captures(trimmed) {
        return Some(cap[1].to_string());
    }
    Some(trimmed.to_string())
}
