use thiserror::Error;
use url::Url;

pub const BLOCKS_PATH: &str = "/ws/blocks";

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("invalid hub origin {origin:?}: {source}")]
    Parse {
        origin: String,
        #[source]
        source: url::ParseError,
    },
    #[error("unsupported origin scheme {0:?}; expected http, https, ws or wss")]
    Scheme(String),
}

/// Derives the block stream websocket URL from the origin the dashboard was served from.
pub fn hub_endpoint(origin: &str) -> Result<Url, EndpointError> {
    let mut url = Url::parse(origin.trim()).map_err(|source| EndpointError::Parse {
        origin: origin.to_string(),
        source,
    })?;

    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => return Err(EndpointError::Scheme(other.to_string())),
    };
    if url.set_scheme(scheme).is_err() {
        return Err(EndpointError::Scheme(url.scheme().to_string()));
    }

    url.set_path(BLOCKS_PATH);
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}
