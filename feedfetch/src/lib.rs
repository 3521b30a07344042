use std::pin::Pin;

use async_compression::tokio::bufread::GzipDecoder;
use futures::TryStreamExt;
use log::debug;
use miette::Diagnostic;
use reqwest::StatusCode;
use reqwest::header;
use thiserror::Error;
use tokio::io::{AsyncBufRead, BufReader};
use tokio_util::io::StreamReader;

/// Byte stream of a fetched feed file, already decompressed if the server
/// sent it compressed. Dropping it releases the underlying HTTP response.
pub type FeedStream = Pin<Box<dyn AsyncBufRead + Send>>;

#[derive(Debug, Error, Diagnostic)]
pub enum FetchError {
    #[error("can't get http response")]
    Request(#[source] reqwest::Error),

    #[error("response status is not 200 OK")]
    StatusNotOk(StatusCode),

    #[error("response content type not supported")]
    ContentTypeNotSupported(String),
}

/// Fetches feed files over http.
pub struct Fetcher {
    client: reqwest::Client,
    user_agent: String,
}

impl Fetcher {
    pub fn new(client: reqwest::Client, user_agent: impl Into<String>) -> Self {
        Self {
            client,
            user_agent: user_agent.into(),
        }
    }

    /// Fetches the feed file at `url` and returns its byte stream.
    ///
    /// `application/xml` responses are returned as-is; `application/zip`
    /// responses are decompressed on the fly. Any other content type is
    /// rejected with [`FetchError::ContentTypeNotSupported`].
    pub async fn fetch_file(&self, url: &str) -> Result<FeedStream, FetchError> {
        debug!("Fetching feed file from {url}");

        let response = self
            .client
            .get(url)
            .header(header::ACCEPT, "application/xml")
            .header(header::ACCEPT_ENCODING, "gzip")
            .header(header::USER_AGENT, &self.user_agent)
            .send()
            .await
            .map_err(FetchError::Request)?;

        if response.status() != StatusCode::OK {
            return Err(FetchError::StatusNotOk(response.status()));
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(essence)
            .unwrap_or_default()
            .to_owned();

        let body = StreamReader::new(response.bytes_stream().map_err(std::io::Error::other));

        match content_type.as_str() {
            "application/xml" => Ok(Box::pin(body)),
            "application/zip" => Ok(Box::pin(BufReader::new(GzipDecoder::new(body)))),
            _ => Err(FetchError::ContentTypeNotSupported(content_type)),
        }
    }
}

/// Strips `;`-delimited parameters (charset and the like) from a
/// content-type header value.
fn essence(content_type: &str) -> &str {
    content_type
        .split(';')
        .next()
        .unwrap_or(content_type)
        .trim()
}
