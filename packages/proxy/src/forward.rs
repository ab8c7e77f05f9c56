//! Replays a forwarded HTTP request against the local target.

use bytes::BytesMut;
use portunnel_models::{Headers, RequestMessage, ResponseMessage};
use reqwest::{
    Method,
    header::{HeaderMap, HeaderName, HeaderValue},
};
use thiserror::Error;
use url::Url;

/// Headers that describe the hop between caller and host rather than the request itself.
const HOP_BY_HOP_HEADERS: [&str; 6] = [
    "host",
    "content-length",
    "connection",
    "transfer-encoding",
    "upgrade",
    "keep-alive",
];

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("Response body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },
    #[error("Invalid method '{0}'")]
    InvalidMethod(String),
    #[error(transparent)]
    Request(#[from] reqwest::Error),
}

/// Resolves a forwarded `path?query` below `target`.
///
/// The forwarded path is appended to the target's own path and never parsed as a URL, so it
/// cannot change the scheme, host or port.
#[must_use]
pub fn target_url(target: &Url, path_and_query: &str) -> Url {
    let (path, query) = match path_and_query.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (path_and_query, None),
    };

    let mut url = target.clone();
    url.set_path(&format!(
        "{}/{}",
        target.path().trim_end_matches('/'),
        path.trim_start_matches(['/', '\\'])
    ));
    url.set_query(query.filter(|query| !query.is_empty()));
    url.set_fragment(None);

    url
}

/// Sends `request` to `target` and packages the answer.
///
/// A non-success status from the target yields an empty response carrying only the request id.
///
/// # Errors
///
/// * If the method cannot be used to build a request
/// * If the target cannot be reached or its body cannot be read
/// * If the body is larger than `body_limit`
pub async fn forward_http(
    client: &reqwest::Client,
    target: &Url,
    request: &RequestMessage,
    body_limit: usize,
) -> Result<ResponseMessage, ForwardError> {
    let url = target_url(target, &request.path_and_query());
    let method = Method::from_bytes(request.method.as_bytes())
        .map_err(|_| ForwardError::InvalidMethod(request.method.clone()))?;

    let mut builder = client.request(method, url.clone());

    for (name, value) in &request.headers {
        if HOP_BY_HOP_HEADERS
            .iter()
            .any(|hop| name.eq_ignore_ascii_case(hop))
        {
            continue;
        }

        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => builder = builder.header(name, value),
            _ => log::debug!("Skipping invalid header '{name}'"),
        }
    }

    if !request.body.is_empty() {
        builder = builder.body(request.body.clone());
    }

    let mut response = builder.send().await?;
    let status = response.status();

    if !status.is_success() {
        log::debug!("Target answered {status} for {} {url}", request.method);
        return Ok(ResponseMessage::empty(request.request_id.clone()));
    }

    let headers = join_headers(response.headers());

    if response
        .content_length()
        .is_some_and(|length| length > u64::try_from(body_limit).unwrap_or(u64::MAX))
    {
        return Err(ForwardError::BodyTooLarge { limit: body_limit });
    }

    let mut body = BytesMut::new();
    while let Some(chunk) = response.chunk().await? {
        if body.len() + chunk.len() > body_limit {
            return Err(ForwardError::BodyTooLarge { limit: body_limit });
        }
        body.extend_from_slice(&chunk);
    }

    Ok(ResponseMessage {
        request_id: request.request_id.clone(),
        status: Some(status.as_u16()),
        headers,
        body: body.freeze(),
    })
}

fn join_headers(headers: &HeaderMap) -> Headers {
    let mut joined = Headers::new();

    for (name, value) in headers {
        let Ok(value) = value.to_str() else {
            log::debug!("Skipping non-text response header {name}");
            continue;
        };

        joined
            .entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push(',');
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }

    joined
}
