use std::{
    path::{Path, PathBuf},
    pin::Pin,
    task::{Context, Poll},
};

use axum::{
    body::{Body, Bytes},
    http::{
        HeaderMap, HeaderValue,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE, LOCATION},
    },
    response::{IntoResponse, Response},
};
use futures_util::{Stream, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::warn;
use url::Url;

use crate::{
    error::ApiError,
    resolver::{Resolver, extract_video_id, is_youtube_host},
    tempstore::TempStore,
};

const MAX_REDIRECTS: usize = 5;
const MAX_FILENAME_CHARS: usize = 100;
const FALLBACK_FILENAME: &str = "audio.mp3";

/// Runs the whole conversion: validate, resolve, download to a temp file,
/// then hand back a streaming `audio/mpeg` attachment whose temp file is
/// deleted once the stream finishes, whether the client read it all or hung
/// up halfway.
pub async fn convert(
    resolver: &Resolver,
    store: &TempStore,
    media_client: &reqwest::Client,
    input: &str,
    quality: Option<&str>,
) -> Result<Response, ApiError> {
    let video_id = validate_and_extract(input)?;
    let resolved = resolver.resolve_download(&video_id, quality).await?;

    let temp_path = store.allocate();
    let content_length = match download_to_file(media_client, &resolved.download_url, &temp_path).await
    {
        Ok(length) => length,
        Err(error) => {
            // A partial file may be on disk; reclaim it before surfacing.
            store.remove(&temp_path).await;
            return Err(error);
        }
    };

    let filename = sanitize_filename(&resolved.suggested_filename);
    match build_attachment_response(&temp_path, &filename, content_length).await {
        Ok(response) => Ok(response),
        Err(error) => {
            store.remove(&temp_path).await;
            Err(error)
        }
    }
}

/// Scheme and host checks for the submitted URL, then the anchored ID
/// extraction. A bare 11-character ID is accepted as-is.
pub fn validate_and_extract(input: &str) -> Result<String, ApiError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(ApiError::invalid_url("Invalid YouTube URL"));
    }

    if let Ok(parsed) = Url::parse(input) {
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ApiError::invalid_url("Invalid YouTube URL"));
        }
        let host = parsed
            .host_str()
            .map(str::to_ascii_lowercase)
            .ok_or_else(|| ApiError::invalid_url("Invalid YouTube URL"))?;
        if !is_youtube_host(&host) {
            return Err(ApiError::invalid_url("Invalid YouTube URL"));
        }
    }

    extract_video_id(input).ok_or_else(|| ApiError::invalid_url("Invalid YouTube URL"))
}

/// Streams the resolved media into `path` with constant memory. Redirects are
/// followed by an explicit loop with a hard ceiling rather than client-level
/// redirect handling, so the bound is visible here.
async fn download_to_file(
    client: &reqwest::Client,
    download_url: &str,
    path: &Path,
) -> Result<u64, ApiError> {
    let mut current = Url::parse(download_url)
        .map_err(|error| ApiError::download(format!("Unusable download link: {error}")))?;

    for _ in 0..=MAX_REDIRECTS {
        let response = client.get(current.clone()).send().await.map_err(|error| {
            warn!("Media download request failed: {error}");
            ApiError::download("Could not download the converted audio.")
        })?;

        let status = response.status();
        if status.is_redirection() {
            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|value| value.to_str().ok())
                .ok_or_else(|| {
                    ApiError::download("Could not download the converted audio.")
                })?;
            current = current.join(location).map_err(|error| {
                warn!("Invalid redirect location {location:?}: {error}");
                ApiError::download("Could not download the converted audio.")
            })?;
            continue;
        }

        if !status.is_success() {
            warn!("Media host answered {status} for the download URL");
            return Err(ApiError::download("Could not download the converted audio."));
        }

        let mut file = tokio::fs::File::create(path).await.map_err(|error| {
            ApiError::internal(format!("Could not create temp file: {error}"))
        })?;

        let mut written: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|error| {
                warn!("Media download interrupted: {error}");
                ApiError::download("The download was interrupted.")
            })?;
            file.write_all(&chunk).await.map_err(|error| {
                ApiError::internal(format!("Could not write temp file: {error}"))
            })?;
            written += chunk.len() as u64;
        }

        file.flush().await.map_err(|error| {
            ApiError::internal(format!("Could not flush temp file: {error}"))
        })?;

        if written == 0 {
            return Err(ApiError::download("The media host returned an empty file."));
        }
        return Ok(written);
    }

    warn!("Download URL exceeded {MAX_REDIRECTS} redirects");
    Err(ApiError::download(
        "The download location redirected too many times.",
    ))
}

async fn build_attachment_response(
    path: &Path,
    filename: &str,
    content_length: u64,
) -> Result<Response, ApiError> {
    let file = tokio::fs::File::open(path).await.map_err(|error| {
        ApiError::internal(format!("Could not read back temp file: {error}"))
    })?;

    let body = Body::from_stream(CleanupStream {
        inner: ReaderStream::new(file),
        _cleanup: RemoveOnDrop {
            path: Some(path.to_path_buf()),
        },
    });

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("audio/mpeg"));
    headers.insert(
        CONTENT_LENGTH,
        HeaderValue::from_str(&content_length.to_string())
            .map_err(|_| ApiError::internal("Could not build the Content-Length header."))?,
    );
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&build_content_disposition(filename))
            .map_err(|_| ApiError::internal("Could not build the download header."))?,
    );

    Ok((headers, body).into_response())
}

/// File stream that unlinks its backing temp file when dropped. Dropping
/// happens both when the client reads to the end and when it disconnects
/// mid-stream, so cleanup runs on every exit path.
struct CleanupStream {
    inner: ReaderStream<tokio::fs::File>,
    _cleanup: RemoveOnDrop,
}

impl Stream for CleanupStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().inner).poll_next(cx)
    }
}

struct RemoveOnDrop {
    path: Option<PathBuf>,
}

impl Drop for RemoveOnDrop {
    fn drop(&mut self) {
        // A single unlink is cheap enough to do inline on the runtime thread.
        if let Some(path) = self.path.take()
            && let Err(error) = std::fs::remove_file(&path)
            && error.kind() != std::io::ErrorKind::NotFound
        {
            warn!("Could not remove streamed temp file {:?}: {error}", path);
        }
    }
}

/// Strips path separators and control characters, caps the name at 100
/// characters, and guarantees a `.mp3` name comes out the other end.
pub fn sanitize_filename(suggested: &str) -> String {
    let cleaned: String = suggested
        .chars()
        .filter(|c| !c.is_control() && *c != '/' && *c != '\\')
        .collect();

    let mut name: String = cleaned.trim().chars().take(MAX_FILENAME_CHARS).collect();
    let trimmed_len = name.trim_end().len();
    name.truncate(trimmed_len);

    if name.is_empty() || name == ".mp3" {
        return FALLBACK_FILENAME.to_string();
    }

    if !name.to_ascii_lowercase().ends_with(".mp3") {
        name.push_str(".mp3");
    }
    name
}

fn build_content_disposition(filename: &str) -> String {
    let safe_ascii = sanitize_ascii_filename(filename);
    format!(
        "attachment; filename=\"{safe_ascii}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}

/// ASCII fallback for the quoted `filename=` parameter; anything a header
/// cannot carry becomes an underscore.
fn sanitize_ascii_filename(value: &str) -> String {
    let mut sanitized = String::with_capacity(value.len());

    for character in value.chars() {
        if character.is_ascii_alphanumeric()
            || matches!(character, '.' | '-' | '_' | ' ' | '(' | ')')
        {
            sanitized.push(character);
        } else {
            sanitized.push('_');
        }
    }

    let compact = sanitized.trim();
    if compact.is_empty() {
        FALLBACK_FILENAME.to_string()
    } else {
        compact.to_string()
    }
}
