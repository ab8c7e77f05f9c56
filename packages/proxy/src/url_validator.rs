use thiserror::Error;
use url::Url;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UrlValidationError {
    #[error("Invalid URL '{url}': {reason}")]
    Malformed { url: String, reason: String },
    #[error("{}", .0.join("\n"))]
    Invalid(Vec<String>),
}

/// Parses `url` as an absolute `http`/`https` URL with a host. Every failed check is reported.
///
/// # Errors
///
/// * If `url` is not an absolute URL
/// * If the scheme is not `http` or `https`, or the host is empty
pub fn validate_url(url: &str) -> Result<Url, UrlValidationError> {
    let parsed = Url::parse(url.trim()).map_err(|e| UrlValidationError::Malformed {
        url: url.to_string(),
        reason: e.to_string(),
    })?;

    let mut errors = vec![];

    if !matches!(parsed.scheme(), "http" | "https") {
        errors.push(format!("URL scheme is not valid: '{}'", parsed.scheme()));
    }

    if parsed.host_str().is_none_or(str::is_empty) {
        errors.push(format!(
            "URL host is empty: '{}'",
            parsed.host_str().unwrap_or_default()
        ));
    }

    if errors.is_empty() {
        Ok(parsed)
    } else {
        Err(UrlValidationError::Invalid(errors))
    }
}

/// Same location with the scheme switched to `ws`/`wss`.
///
/// # Errors
///
/// * If the URL is not `http`/`https`
pub fn to_websocket_url(url: &Url) -> Result<Url, UrlValidationError> {
    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        other => {
            return Err(UrlValidationError::Invalid(vec![format!(
                "URL scheme is not valid: '{other}'"
            )]));
        }
    };

    let mut url = url.clone();
    url.set_scheme(scheme)
        .map_err(|()| UrlValidationError::Malformed {
            url: url.to_string(),
            reason: format!("cannot switch scheme to {scheme}"),
        })?;

    Ok(url)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test_log::test]
    fn accepts_http_and_https() {
        assert_eq!(
            validate_url("http://localhost:5000").unwrap().as_str(),
            "http://localhost:5000/"
        );
        assert!(validate_url("https://gateway.example.com/portunnel").is_ok());
    }

    #[test_log::test]
    fn rejects_relative_urls() {
        assert!(matches!(
            validate_url("/portunnel"),
            Err(UrlValidationError::Malformed { .. })
        ));
    }

    #[test_log::test]
    fn reports_every_failed_check() {
        assert_eq!(
            validate_url("mailto:someone@example.com"),
            Err(UrlValidationError::Invalid(vec![
                "URL scheme is not valid: 'mailto'".to_string(),
                "URL host is empty: ''".to_string(),
            ]))
        );
    }

    #[test_log::test]
    fn rejects_other_schemes_with_a_host() {
        assert_eq!(
            validate_url("ftp://files.example.com"),
            Err(UrlValidationError::Invalid(vec![
                "URL scheme is not valid: 'ftp'".to_string()
            ]))
        );
    }

    #[test_log::test]
    fn websocket_url_keeps_host_and_path() {
        let http = Url::parse("http://localhost:8000/portunnel").unwrap();
        let https = Url::parse("https://gateway.example.com/portunnel").unwrap();

        assert_eq!(
            to_websocket_url(&http).unwrap().as_str(),
            "ws://localhost:8000/portunnel"
        );
        assert_eq!(
            to_websocket_url(&https).unwrap().as_str(),
            "wss://gateway.example.com/portunnel"
        );
    }
}
