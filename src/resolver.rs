use serde::Serialize;
use serde_json::Value;
use tracing::warn;
use url::Url;

use crate::error::ApiError;

pub const RESOLVER_TIMEOUT_SECONDS: u64 = 60;

const VIDEO_ID_LENGTH: usize = 11;

#[derive(Debug, Clone, Serialize)]
pub struct VideoInfo {
    pub title: String,
    pub author: Option<String>,
    pub duration: Option<u64>,
    pub thumbnail: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResolvedMedia {
    pub download_url: String,
    pub suggested_filename: String,
}

/// Client for the external resolution API. Pure adapter: it shapes requests,
/// tolerates the loosely versioned response payload, and maps failures to a
/// generic user-facing error while the upstream detail goes to the log.
#[derive(Clone)]
pub struct Resolver {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl Resolver {
    pub fn new(client: reqwest::Client, endpoint: String, api_key: Option<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    pub async fn fetch_info(&self, video_id: &str) -> Result<VideoInfo, ApiError> {
        let payload = self
            .request(&format!("{}/info", self.endpoint), video_id, None)
            .await
            .map_err(|detail| {
                warn!("Resolver info lookup failed for {video_id}: {detail}");
                ApiError::bad_request("Could not retrieve video information.")
            })?;

        parse_info(&payload).ok_or_else(|| {
            warn!("Resolver returned malformed info payload for {video_id}");
            ApiError::bad_request("Could not retrieve video information.")
        })
    }

    pub async fn resolve_download(
        &self,
        video_id: &str,
        quality: Option<&str>,
    ) -> Result<ResolvedMedia, ApiError> {
        let payload = self
            .request(&format!("{}/dl", self.endpoint), video_id, quality)
            .await
            .map_err(|detail| {
                warn!("Resolver download lookup failed for {video_id}: {detail}");
                conversion_failed()
            })?;

        parse_resolved(&payload).ok_or_else(|| {
            warn!("Resolver returned no usable download link for {video_id}");
            conversion_failed()
        })
    }

    /// One GET against the resolution API. Never retries; a failed call is
    /// surfaced to the caller immediately.
    async fn request(
        &self,
        url: &str,
        video_id: &str,
        quality: Option<&str>,
    ) -> Result<Value, String> {
        let mut request = self.client.get(url).query(&[("id", video_id)]);
        if let Some(quality) = quality {
            request = request.query(&[("quality", quality)]);
        }
        if let Some(key) = &self.api_key {
            request = request.header("x-api-key", key);
        }

        let response = request
            .send()
            .await
            .map_err(|error| format!("request error: {error}"))?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("upstream status {status}"));
        }

        let payload = response
            .json::<Value>()
            .await
            .map_err(|error| format!("invalid JSON body: {error}"))?;

        if upstream_reported_failure(&payload) {
            return Err(format!(
                "upstream reported failure: {}",
                payload.get("msg").and_then(Value::as_str).unwrap_or("?")
            ));
        }

        Ok(payload)
    }
}

fn conversion_failed() -> ApiError {
    ApiError::resolution(
        "Conversion failed. The video may be private, age-restricted, or a live stream.",
    )
}

fn upstream_reported_failure(payload: &Value) -> bool {
    matches!(
        payload.get("status").and_then(Value::as_str),
        Some("fail") | Some("error")
    )
}

// The upstream contract is loosely specified; field names vary between
// deployments and versions. All of the shape-sniffing lives in the two
// adapters below so the rest of the crate depends on one stable shape.

fn parse_info(payload: &Value) -> Option<VideoInfo> {
    let title = payload
        .get("title")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())?
        .to_string();

    Some(VideoInfo {
        title,
        author: first_string(payload, &["author", "channel", "uploader"]),
        duration: parse_duration(payload),
        thumbnail: first_string(payload, &["thumbnail", "thumb"]),
    })
}

fn parse_resolved(payload: &Value) -> Option<ResolvedMedia> {
    let download_url = first_string(payload, &["link", "url", "dlink", "download_url"])?;
    if Url::parse(&download_url).is_err() {
        return None;
    }

    let suggested_filename = payload
        .get("title")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|title| format!("{title}.mp3"))
        .unwrap_or_else(|| "audio.mp3".to_string());

    Some(ResolvedMedia {
        download_url,
        suggested_filename,
    })
}

fn first_string(payload: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| payload.get(key))
        .filter_map(Value::as_str)
        .map(str::trim)
        .find(|value| !value.is_empty())
        .map(ToString::to_string)
}

fn parse_duration(payload: &Value) -> Option<u64> {
    let value = payload.get("duration")?;
    value
        .as_u64()
        .or_else(|| value.as_f64().map(|secs| secs.max(0.0) as u64))
        .or_else(|| value.as_str().and_then(|raw| raw.trim().parse().ok()))
}

/// Pulls the 11-character video ID out of a watch URL, a `youtu.be` short
/// URL, an embed URL, or a bare ID. The match is anchored: an ID buried in an
/// unrelated string is rejected.
pub fn extract_video_id(input: &str) -> Option<String> {
    let input = input.trim();

    if is_video_id(input) {
        return Some(input.to_string());
    }

    let parsed = Url::parse(input).ok()?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return None;
    }

    let host = parsed.host_str()?.to_ascii_lowercase();
    let mut segments = parsed.path_segments()?;

    let candidate = if host == "youtu.be" {
        segments.next().map(ToString::to_string)
    } else if is_youtube_host(&host) {
        match segments.next()? {
            "watch" => parsed
                .query_pairs()
                .find(|(key, _)| key == "v")
                .map(|(_, value)| value.into_owned()),
            "embed" | "shorts" | "v" => segments.next().map(ToString::to_string),
            _ => None,
        }
    } else {
        None
    }?;

    is_video_id(&candidate).then_some(candidate)
}

pub fn is_youtube_host(host: &str) -> bool {
    matches!(
        host,
        "youtube.com"
            | "www.youtube.com"
            | "m.youtube.com"
            | "music.youtube.com"
            | "youtube-nocookie.com"
            | "www.youtube-nocookie.com"
            | "youtu.be"
    )
}

fn is_video_id(value: &str) -> bool {
    value.len() == VIDEO_ID_LENGTH
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ID: &str = "dQw4w9WgXcQ";

    #[test]
    fn extracts_id_from_every_supported_form() {
        let forms = [
            format!("https://www.youtube.com/watch?v={ID}"),
            format!("https://m.youtube.com/watch?v={ID}&t=42"),
            format!("https://music.youtube.com/watch?v={ID}"),
            format!("https://youtu.be/{ID}"),
            format!("https://youtu.be/{ID}?si=abcdef"),
            format!("https://www.youtube.com/embed/{ID}"),
            format!("https://www.youtube.com/shorts/{ID}"),
            format!("https://www.youtube.com/v/{ID}"),
            ID.to_string(),
            format!("  {ID}  "),
        ];

        for form in forms {
            assert_eq!(extract_video_id(&form).as_deref(), Some(ID), "{form}");
        }
    }

    #[test]
    fn rejects_unrecognized_input() {
        let junk = [
            "not-a-url",
            "https://example.com/watch?v=dQw4w9WgXcQ",
            "https://vimeo.com/12345",
            "ftp://youtube.com/watch?v=dQw4w9WgXcQ",
            "https://www.youtube.com/watch?v=tooshort",
            "https://www.youtube.com/watch",
            "dQw4w9WgXc",
            "dQw4w9WgXcQQ",
            "prefix dQw4w9WgXcQ",
            "dQw4w9WgXc!",
            "",
        ];

        for input in junk {
            assert_eq!(extract_video_id(input), None, "{input:?}");
        }
    }

    #[test]
    fn resolved_payload_accepts_alternate_link_fields() {
        for key in ["link", "url", "dlink", "download_url"] {
            let payload = json!({ key: "https://cdn.example.com/a.mp3", "title": "Song" });
            let resolved = parse_resolved(&payload).unwrap();
            assert_eq!(resolved.download_url, "https://cdn.example.com/a.mp3");
            assert_eq!(resolved.suggested_filename, "Song.mp3");
        }
    }

    #[test]
    fn resolved_payload_without_link_is_rejected() {
        assert!(parse_resolved(&json!({ "title": "Song" })).is_none());
        assert!(parse_resolved(&json!({ "link": "" })).is_none());
        assert!(parse_resolved(&json!({ "link": "not a url" })).is_none());
    }

    #[test]
    fn resolved_payload_without_title_gets_generic_filename() {
        let payload = json!({ "link": "https://cdn.example.com/a.mp3" });
        assert_eq!(parse_resolved(&payload).unwrap().suggested_filename, "audio.mp3");
    }

    #[test]
    fn info_payload_accepts_alternate_field_names() {
        let payload = json!({
            "title": "Song",
            "uploader": "Artist",
            "duration": "212",
            "thumb": "https://i.example.com/t.jpg",
        });
        let info = parse_info(&payload).unwrap();
        assert_eq!(info.title, "Song");
        assert_eq!(info.author.as_deref(), Some("Artist"));
        assert_eq!(info.duration, Some(212));
        assert_eq!(info.thumbnail.as_deref(), Some("https://i.example.com/t.jpg"));
    }

    #[test]
    fn info_payload_without_title_is_rejected() {
        assert!(parse_info(&json!({ "duration": 10 })).is_none());
        assert!(parse_info(&json!({ "title": "   " })).is_none());
    }

    #[test]
    fn upstream_failure_status_is_detected() {
        assert!(upstream_reported_failure(&json!({ "status": "fail", "msg": "nope" })));
        assert!(!upstream_reported_failure(&json!({ "status": "ok" })));
        assert!(!upstream_reported_failure(&json!({ "title": "Song" })));
    }
}
