//! HTTP transport to the upstream webhook API.

use std::time::Duration;

use axum::http::header::CONTENT_TYPE;
use futures_util::future::BoxFuture;

use crate::config::UpstreamConfig;
use crate::upstream::{Upstream, UpstreamError, UpstreamRequest, UpstreamResponse};

/// `reqwest`-backed upstream.
#[derive(Clone)]
pub struct HttpUpstream {
    client: reqwest::Client,
    base_url: String,
}

impl HttpUpstream {
    pub fn new(config: &UpstreamConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .user_agent(config.user_agent.as_str())
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }
}

// reqwest errors embed the request URL, which contains the webhook token.
fn network_error(e: reqwest::Error) -> UpstreamError {
    UpstreamError::Network(e.without_url().to_string())
}

impl Upstream for HttpUpstream {
    fn execute(
        &self,
        request: UpstreamRequest,
    ) -> BoxFuture<'_, Result<UpstreamResponse, UpstreamError>> {
        Box::pin(async move {
            let url = format!(
                "{}{}",
                self.base_url,
                request.target.upstream_path_and_query()
            );

            let mut builder = self.client.post(url).body(request.body);
            if let Some(content_type) = request.content_type {
                builder = builder.header(CONTENT_TYPE, content_type);
            }

            let response = builder.send().await.map_err(network_error)?;
            let status = response.status();
            let headers = response.headers().clone();
            let body = response.bytes().await.map_err(network_error)?;

            Ok(UpstreamResponse {
                status,
                headers,
                body,
            })
        })
    }
}
