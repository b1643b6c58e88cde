/// Number of leading characters of an API key that may appear in logs and
/// admin output.
const VISIBLE_PREFIX_LEN: usize = 8;

/// Mask an API key for display: keep the first eight characters and append
/// `...`. Keys of eight characters or fewer are returned unchanged.
pub fn mask_api_key(api_key: &str) -> String {
    match api_key.char_indices().nth(VISIBLE_PREFIX_LEN) {
        Some((cut, _)) => format!("{}...", &api_key[..cut]),
        None => api_key.to_string(),
    }
}
