//! HTTP client for the dispatcher's worker and operator routes.

use std::pin::Pin;
use std::sync::Arc;

use axum::body::Bytes;
use futures::{Stream, TryStreamExt};
use reqwest::header::ACCEPT;
use reqwest::{Method, RequestBuilder};
use secrecy::{ExposeSecret, SecretString};
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio_util::io::StreamReader;

use crate::error::{Error, Result};
use crate::model::{AckRequest, ConnectParams, Evidence, Job, JobDescriptor, PushJobRequest};
use crate::server::API_KEY_HEADER;

type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// Cheap to clone; clones share the connection pool.
#[derive(Clone)]
pub struct DispatcherClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<Arc<SecretString>>,
}

impl DispatcherClient {
    pub fn new(
        base_url: &str,
        api_key: Option<SecretString>,
        skip_verify_tls: bool,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(skip_verify_tls)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.map(Arc::new),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let request = self.http.request(method, format!("{}{path}", self.base_url));
        match &self.api_key {
            Some(key) => request.header(API_KEY_HEADER, key.expose_secret()),
            None => request,
        }
    }

    /// Open the job stream, declaring `modules` and `concurrency`.
    pub async fn open_stream(&self, modules: &[String], concurrency: usize) -> Result<JobStream> {
        let response = self
            .request(Method::GET, "/internal/jobs")
            .query(&ConnectParams::new(modules, concurrency))
            .header(ACCEPT, "application/x-ndjson")
            .send()
            .await?
            .error_for_status()?;

        let bytes: ByteStream = Box::pin(response.bytes_stream().map_err(std::io::Error::other));
        Ok(JobStream {
            lines: BufReader::new(StreamReader::new(bytes)).lines(),
        })
    }

    /// Report a job's outcome. Returns whether the dispatcher applied it.
    pub async fn ack(&self, ack: &AckRequest) -> Result<bool> {
        let body: serde_json::Value = self
            .request(Method::POST, "/internal/jobs/ack")
            .json(ack)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(body["applied"].as_bool().unwrap_or(false))
    }

    /// Register an artifact as new evidence in its case.
    pub async fn register_evidence(&self, evidence: &Evidence) -> Result<()> {
        self.request(
            Method::POST,
            &format!("/api/cases/{}/evidences", evidence.case_id),
        )
        .json(evidence)
        .send()
        .await?
        .error_for_status()?;
        Ok(())
    }

    pub async fn push_job(&self, request: &PushJobRequest) -> Result<Job> {
        Ok(self
            .request(Method::POST, "/api/jobs")
            .json(request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }
}

/// Decoded view of an open job stream.
pub struct JobStream {
    lines: Lines<BufReader<StreamReader<ByteStream, Bytes>>>,
}

impl JobStream {
    /// Next descriptor, keep-alives included. `None` when the server closed
    /// the stream.
    pub async fn next(&mut self) -> Result<Option<JobDescriptor>> {
        loop {
            let Some(line) = self
                .lines
                .next_line()
                .await
                .map_err(|e| Error::Transport(format!("job stream read failed: {e}")))?
            else {
                return Ok(None);
            };
            if line.trim().is_empty() {
                continue;
            }
            let descriptor = serde_json::from_str(&line)
                .map_err(|e| Error::Transport(format!("undecodable job descriptor: {e}")))?;
            return Ok(Some(descriptor));
        }
    }
}
