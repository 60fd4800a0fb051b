//! HTTP client construction and request/response helpers shared by the
//! adapters, with wire traffic logged through `tracing`.

use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::error::Error;
use crate::options::TransportOptions;

/// Build a configured HTTP client from transport options.
pub fn build_http_client(transport: &TransportOptions) -> Result<Client, reqwest::Error> {
    let mut builder = Client::builder();

    if let Some(timeout) = transport.timeout {
        builder = builder.timeout(timeout);
    }

    if let Some(proxy_url) = &transport.proxy {
        if let Ok(proxy) = reqwest::Proxy::all(proxy_url) {
            builder = builder.proxy(proxy);
        }
    }

    builder.build()
}

/// Add extra headers to a request if specified in transport options.
pub fn add_extra_headers(
    mut request: RequestBuilder,
    transport: &TransportOptions,
) -> RequestBuilder {
    if let Some(headers) = &transport.extra_headers {
        for (key, value) in headers {
            request = request.header(key, value);
        }
    }
    request
}

/// Attach a JSON body to a request, logging it first.
pub trait RequestBuilderExt {
    fn json_logged<T: Serialize + ?Sized>(self, body: &T) -> RequestBuilder;
}

impl RequestBuilderExt for RequestBuilder {
    fn json_logged<T: Serialize + ?Sized>(self, body: &T) -> RequestBuilder {
        if let Ok(rendered) = serde_json::to_string(body) {
            debug!(body = %rendered, "sending request");
        }
        self.json(body)
    }
}

/// Read a response body, logging it before handing it back.
pub trait ResponseExt: Sized {
    fn text_logged(self) -> impl std::future::Future<Output = Result<String, reqwest::Error>> + Send;

    fn json_logged<T: DeserializeOwned>(
        self,
    ) -> impl std::future::Future<Output = Result<T, Error>> + Send;
}

impl ResponseExt for reqwest::Response {
    async fn text_logged(self) -> Result<String, reqwest::Error> {
        let body = self.text().await?;
        debug!(body = %body, "received response");
        Ok(body)
    }

    async fn json_logged<T: DeserializeOwned>(self) -> Result<T, Error> {
        let body = self.text_logged().await?;
        Ok(serde_json::from_str(&body)?)
    }
}
