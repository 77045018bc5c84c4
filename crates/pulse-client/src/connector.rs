//! HTTP implementation of [`StreamConnector`] on top of reqwest.

use anyhow::{Context, Result};
use futures_util::StreamExt;
use reqwest::header::ACCEPT;
use reqwest::RequestBuilder;
use tokio::task::JoinHandle;
use tracing::debug;

use pulse_types::wire::{FrameDecoder, STREAM_CONTENT_TYPE};

use crate::transport::{StreamConnector, StreamHandle, TransportLink};

pub struct HttpStreamConnector {
    client: reqwest::Client,
    token: Option<String>,
}

impl HttpStreamConnector {
    pub fn new(token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            token,
        }
    }
}

impl StreamConnector for HttpStreamConnector {
    fn open(&self, url: &str, link: TransportLink) -> Box<dyn StreamHandle> {
        let mut request = self.client.get(url).header(ACCEPT, STREAM_CONTENT_TYPE);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let task = tokio::spawn(async move {
            match read_stream(request, &link).await {
                Ok(()) => link.failed("stream ended"),
                Err(e) => link.failed(&format!("{e:#}")),
            }
        });
        Box::new(HttpStreamHandle { task: Some(task) })
    }
}

async fn read_stream(request: RequestBuilder, link: &TransportLink) -> Result<()> {
    let response = request.send().await.context("Stream request failed")?;
    let status = response.status();
    if !status.is_success() {
        anyhow::bail!("Stream rejected with {status}");
    }
    link.opened();

    let mut decoder = FrameDecoder::new();
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.context("Stream read failed")?;
        for frame in decoder.push_bytes(&chunk) {
            if frame.retry.is_some() {
                debug!(retry_ms = ?frame.retry, "Server advertised retry delay");
            }
            link.frame(frame);
        }
        if !link.is_current() {
            break;
        }
    }
    Ok(())
}

struct HttpStreamHandle {
    task: Option<JoinHandle<()>>,
}

impl StreamHandle for HttpStreamHandle {
    fn close(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for HttpStreamHandle {
    fn drop(&mut self) {
        self.close();
    }
}
