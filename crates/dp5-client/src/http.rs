//! HTTP transport talking to the DP5 server routes

use reqwest::Client;
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;

use dp5_core::{Epoch, Track};

use crate::config::{ClientConfig, TrackConfig};
use crate::error::{ClientError, Result};
use crate::transport::{NetworkError, ReplyHandle, Transport};

/// Response from the status endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct ServerStatus {
    pub epoch: Epoch,
    pub register: bool,
}

struct TrackServers {
    reg_server: String,
    lookup_servers: Vec<String>,
}

impl TrackServers {
    fn from_config(config: &TrackConfig) -> Self {
        Self {
            reg_server: base_url(&config.reg_server),
            lookup_servers: config.lookup_servers.iter().map(|s| base_url(s)).collect(),
        }
    }
}

fn base_url(server: &str) -> String {
    let server = server.trim_end_matches('/');
    if server.starts_with("http://") || server.starts_with("https://") {
        server.to_string()
    } else {
        format!("https://{}", server)
    }
}

/// Decrements the in-flight count when a send finishes
struct InFlightGuard(Arc<AtomicUsize>);

impl InFlightGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Transport posting octet-stream bodies with reqwest
///
/// Registration goes to `{reg}/register?epoch={E-1}` (the server names the
/// epoch it is in, one before the one being registered for); lookups go
/// to `{lookup[shard]}/lookup?epoch={E}`.
pub struct HttpTransport {
    http: Client,
    runtime: Handle,
    standard: TrackServers,
    combined: TrackServers,
    in_flight: Arc<AtomicUsize>,
}

impl HttpTransport {
    /// Must be called from within a tokio runtime
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| ClientError::NoRuntime)?;
        let http = Client::builder().timeout(config.request_timeout()).build()?;
        Ok(Self {
            http,
            runtime,
            standard: TrackServers::from_config(&config.standard),
            combined: TrackServers::from_config(&config.combined),
            in_flight: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn servers(&self, track: Track) -> &TrackServers {
        match track {
            Track::Standard => &self.standard,
            Track::Combined => &self.combined,
        }
    }

    /// Current epoch and role of the registration server of `track`
    pub async fn server_status(&self, track: Track) -> Result<ServerStatus> {
        let url = format!("{}/", self.servers(track).reg_server);
        let resp = self.http.get(&url).send().await?;

        if !resp.status().is_success() {
            return Err(ClientError::Server {
                status: resp.status().as_u16(),
                message: resp.text().await.unwrap_or_default(),
            });
        }

        Ok(resp.json().await?)
    }

    fn spawn_post(&self, url: String, message: Vec<u8>, reply: ReplyHandle) {
        let http = self.http.clone();
        let guard = InFlightGuard::new(&self.in_flight);
        self.runtime.spawn(async move {
            match post(&http, &url, message).await {
                Ok(body) => reply.succeed(body),
                Err(e) => {
                    tracing::debug!(url = %url, error = %e, "Request failed");
                    reply.fail(e)
                }
            }
            drop(guard);
        });
    }
}

async fn post(http: &Client, url: &str, message: Vec<u8>) -> std::result::Result<Vec<u8>, NetworkError> {
    let resp = http
        .post(url)
        .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
        .body(message)
        .send()
        .await
        .map_err(|e| NetworkError::Request(e.to_string()))?;

    let status = resp.status();
    if !status.is_success() {
        return Err(NetworkError::Status {
            status: status.as_u16(),
            message: resp.text().await.unwrap_or_default(),
        });
    }

    let body = resp
        .bytes()
        .await
        .map_err(|e| NetworkError::Request(e.to_string()))?;
    Ok(body.to_vec())
}

impl Transport for HttpTransport {
    fn send_registration(&mut self, epoch: Epoch, track: Track, message: Vec<u8>, reply: ReplyHandle) {
        let url = format!(
            "{}/register?epoch={}",
            self.servers(track).reg_server,
            epoch.saturating_sub(1)
        );
        tracing::debug!(track = %track, epoch, bytes = message.len(), "Sending registration");
        self.spawn_post(url, message, reply);
    }

    fn send_lookup(
        &mut self,
        epoch: Epoch,
        track: Track,
        shard: usize,
        message: Vec<u8>,
        reply: ReplyHandle,
    ) {
        if message.is_empty() {
            reply.succeed(Vec::new());
            return;
        }
        let Some(server) = self.servers(track).lookup_servers.get(shard) else {
            reply.fail(NetworkError::NoServer { track, shard });
            return;
        };
        let url = format!("{}/lookup?epoch={}", server, epoch);
        tracing::debug!(track = %track, epoch, shard, bytes = message.len(), "Sending lookup");
        self.spawn_post(url, message, reply);
    }

    fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url() {
        assert_eq!(base_url("reg.example:8443"), "https://reg.example:8443");
        assert_eq!(base_url("http://127.0.0.1:9000/"), "http://127.0.0.1:9000");
    }

    #[test]
    fn test_new_requires_runtime() {
        assert!(matches!(
            HttpTransport::new(&ClientConfig::default()),
            Err(ClientError::NoRuntime)
        ));
    }

    #[tokio::test]
    async fn test_empty_lookup_answers_immediately() {
        use crate::transport::{Continuation, Step};
        use dp5_core::{ProtocolKind, RequestLabel};

        let mut transport = HttpTransport::new(&ClientConfig::default()).unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let continuation = Continuation {
            label: RequestLabel::new(ProtocolKind::Lookup, 1),
            request: 1,
            action: 0,
            step: Step::Shard(0),
        };
        transport.send_lookup(1, Track::Standard, 0, Vec::new(), ReplyHandle::new(continuation, tx));

        assert_eq!(rx.try_recv().unwrap().result, Ok(Vec::new()));
        assert_eq!(transport.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_stalled_server_times_out() {
        use crate::transport::{Continuation, Step};
        use dp5_core::{ProtocolKind, RequestLabel};
        use std::time::Duration;

        // accepts connections and never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let config = ClientConfig::new(
            TrackConfig::new(url.clone(), vec![url.clone(); 3]),
            TrackConfig::new(url.clone(), vec![url]),
        )
        .with_request_timeout(Duration::from_secs(1));
        let mut transport = HttpTransport::new(&config).unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let continuation = Continuation {
            label: RequestLabel::new(ProtocolKind::Lookup, 1),
            request: 1,
            action: 0,
            step: Step::Metadata,
        };
        transport.send_lookup(1, Track::Standard, 0, vec![1], ReplyHandle::new(continuation, tx));
        assert_eq!(transport.in_flight(), 1);

        let completion = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("reply within the timeout")
            .unwrap();
        assert!(matches!(completion.result, Err(NetworkError::Request(_))));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(transport.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_missing_shard_server_fails() {
        use crate::transport::{Continuation, Step};
        use dp5_core::{ProtocolKind, RequestLabel};

        let mut transport = HttpTransport::new(&ClientConfig::default()).unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let continuation = Continuation {
            label: RequestLabel::new(ProtocolKind::LookupCombined, 1),
            request: 1,
            action: 0,
            step: Step::Shard(4),
        };
        transport.send_lookup(1, Track::Combined, 4, vec![1], ReplyHandle::new(continuation, tx));

        assert!(matches!(
            rx.try_recv().unwrap().result,
            Err(NetworkError::NoServer { shard: 4, .. })
        ));
    }
}
