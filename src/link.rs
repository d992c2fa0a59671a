use url::Url;

/// Pulls the dataset id out of a shared link such as
/// `https://curtain.proteo.info/#/f4b009f3-ac3c-470a-a68b-55fcadf68d0f`.
///
/// The id is the first segment of the URL fragment. Anything that is not a
/// URL with a non-empty fragment yields `None`.
pub fn extract_record_id(raw: &str) -> Option<String> {
    let url = Url::parse(raw.trim()).ok()?;
    let fragment = url.fragment()?;
    let id = fragment
        .trim_start_matches('/')
        .split(['/', '&', '?'])
        .next()?
        .trim();

    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_id_from_fragment() {
        assert_eq!(
            extract_record_id("https://curtain.proteo.info/#/f4b009f3-ac3c-470a-a68b-55fcadf68d0f"),
            Some("f4b009f3-ac3c-470a-a68b-55fcadf68d0f".to_string())
        );
    }

    #[test]
    fn ignores_trailing_parts() {
        assert_eq!(
            extract_record_id("https://curtain.proteo.info/#/abc123&token=xyz"),
            Some("abc123".to_string())
        );
        assert_eq!(
            extract_record_id("  https://curtain.proteo.info/#/abc123/extra\n"),
            Some("abc123".to_string())
        );
    }

    #[test]
    fn malformed_input_has_no_id() {
        assert_eq!(extract_record_id("not a link"), None);
        assert_eq!(extract_record_id("https://curtain.proteo.info/"), None);
        assert_eq!(extract_record_id("https://curtain.proteo.info/#/"), None);
        assert_eq!(extract_record_id(""), None);
    }
}
