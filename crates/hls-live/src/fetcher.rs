// HTTP loader: one reqwest request per load, completion published on the bus.

use std::time::Duration;

use bytes::Bytes;
use reqwest::Client;
use tracing::{debug, trace, warn};
use url::Url;

use crate::collaborators::{LoadRequest, Loader};
use crate::error::LoadError;
use crate::events::{EventBus, LoaderEvent};

#[derive(Debug, Clone)]
pub struct HttpLoaderConfig {
    pub timeout: Duration,
    /// Extra query parameters appended to every request.
    pub params: Vec<(String, String)>,
}

impl Default for HttpLoaderConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            params: Vec::new(),
        }
    }
}

/// [`Loader`] backed by a shared `reqwest::Client`.
///
/// `load()` spawns the request on the current tokio runtime and returns
/// immediately. Retries are the controller's business, not the loader's.
#[derive(Clone)]
pub struct HttpLoader {
    client: Client,
    bus: EventBus,
    config: HttpLoaderConfig,
}

impl HttpLoader {
    pub fn new(client: Client, bus: EventBus, config: HttpLoaderConfig) -> Self {
        Self {
            client,
            bus,
            config,
        }
    }
}

fn classify(url: &str, error: &reqwest::Error) -> LoadError {
    if error.is_timeout() {
        LoadError::Timeout {
            url: url.to_string(),
        }
    } else if let Some(status) = error.status() {
        LoadError::http_status(status.as_u16(), url)
    } else {
        LoadError::network(url, error.to_string())
    }
}

async fn fetch(client: &Client, config: &HttpLoaderConfig, url: &str) -> Result<Bytes, LoadError> {
    let parsed = Url::parse(url).map_err(|e| LoadError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;

    let response = client
        .get(parsed)
        .query(&config.params)
        .timeout(config.timeout)
        .send()
        .await
        .map_err(|e| classify(url, &e))?;

    let status = response.status();
    if !status.is_success() {
        return Err(LoadError::http_status(status.as_u16(), url));
    }
    trace!(%url, http_version = ?response.version(), "Response received");

    response.bytes().await.map_err(|e| LoadError::Body {
        url: url.to_string(),
        reason: e.to_string(),
    })
}

impl Loader for HttpLoader {
    fn load(&mut self, request: LoadRequest) {
        let LoadRequest { loader, url } = request;

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(%loader, %url, "No async runtime available for fetch");
            self.bus.publish(LoaderEvent::FetchError {
                loader,
                error: LoadError::network(url.as_str(), "no async runtime"),
                url,
            });
            return;
        };

        let client = self.client.clone();
        let config = self.config.clone();
        let bus = self.bus.clone();
        handle.spawn(async move {
            match fetch(&client, &config, &url).await {
                Ok(data) => {
                    debug!(%loader, %url, bytes = data.len(), "Fetch complete");
                    bus.publish(LoaderEvent::FetchComplete { loader, url, data });
                }
                Err(error) => {
                    debug!(%loader, %url, %error, "Fetch failed");
                    bus.publish(LoaderEvent::FetchError { loader, url, error });
                }
            }
        });
    }
}
