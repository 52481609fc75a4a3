//! URL helpers for the remote track API and its file-serving endpoint.

fn strip_trailing_slash(base: &str) -> String {
    base.trim().trim_end_matches('/').to_string()
}

/// Root of the REST resources, e.g. `http://host/api`.
pub fn api_root(api_base: &str) -> String {
    format!("{}/api", strip_trailing_slash(api_base))
}

/// URL the player fetches media bytes from, given a track's opaque
/// `audioFile` reference.
pub fn media_file_url(api_base: &str, audio_file: &str) -> Option<String> {
    let audio_file = audio_file.trim();
    if audio_file.is_empty() {
        return None;
    }
    Some(format!(
        "{}/files/{}",
        api_root(api_base),
        urlencoding::encode(audio_file)
    ))
}

#[cfg(test)]
mod tests {
    use super::{api_root, media_file_url};

    #[test]
    fn test_media_file_url_joins_base_and_reference() {
        assert_eq!(
            media_file_url("http://test-api", "track-123.mp3").as_deref(),
            Some("http://test-api/api/files/track-123.mp3")
        );
        assert_eq!(
            media_file_url("http://test-api/", "my song.mp3").as_deref(),
            Some("http://test-api/api/files/my%20song.mp3")
        );
    }

    #[test]
    fn test_blank_reference_has_no_url() {
        assert_eq!(media_file_url("http://test-api", "  "), None);
    }

    #[test]
    fn test_api_root_trims_whitespace_and_slash() {
        assert_eq!(api_root(" https://tracks.example/ "), "https://tracks.example/api");
    }
}
