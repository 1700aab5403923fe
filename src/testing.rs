//! Fakes shared by the unit tests

use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use crate::error::Result;
use crate::host::{HostUpdater, IpResolver, Notifier};
use crate::store::KeyValueStore;

/// A WFIREX4 stand-in on localhost
///
/// Each connection gets the next canned response (the last one repeats),
/// after which the socket is closed. Requests are recorded in order.
pub struct FakeDevice {
    pub port: u16,
    requests: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl FakeDevice {
    pub async fn start(responses: Vec<Vec<u8>>) -> Self {
        Self::start_on("127.0.0.1", responses).await
    }

    pub async fn start_on(host: &str, responses: Vec<Vec<u8>>) -> Self {
        Self::serve(host, responses, false).await
    }

    /// Serves `responses` once each, then accepts further requests but
    /// never answers them
    pub async fn start_then_hang(responses: Vec<Vec<u8>>) -> Self {
        Self::serve("127.0.0.1", responses, true).await
    }

    async fn serve(host: &str, responses: Vec<Vec<u8>>, hang_when_done: bool) -> Self {
        let listener = TcpListener::bind((host, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let requests = Arc::new(Mutex::new(Vec::new()));

        let recorded = Arc::clone(&requests);
        tokio::spawn(async move {
            let mut served = 0usize;
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let mut buf = vec![0u8; 1024];
                let n = socket.read(&mut buf).await.unwrap_or(0);
                buf.truncate(n);
                recorded.lock().unwrap().push(buf);

                if hang_when_done && served >= responses.len() {
                    tokio::spawn(async move {
                        tokio::time::sleep(std::time::Duration::from_secs(30)).await;
                        drop(socket);
                    });
                    continue;
                }

                let response = responses
                    .get(served)
                    .or_else(|| responses.last())
                    .cloned()
                    .unwrap_or_default();
                served += 1;
                if !response.is_empty() {
                    let _ = socket.write_all(&response).await;
                }
                let _ = socket.shutdown().await;
            }
        });

        Self { port, requests }
    }

    pub fn requests(&self) -> Vec<Vec<u8>> {
        self.requests.lock().unwrap().clone()
    }

    pub fn connections(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// IR codes carried by the recorded send-command frames
    pub fn codes_sent(&self) -> Vec<Vec<u8>> {
        self.requests()
            .into_iter()
            .filter(|req| req.len() >= 8 && req[3..5] == [0x11, 0x00])
            .map(|req| req[7..req.len() - 1].to_vec())
            .collect()
    }
}

/// In-memory store that records every save
#[derive(Default)]
pub struct MemoryStore {
    initial: Option<Value>,
    saves: Mutex<Vec<Value>>,
}

impl MemoryStore {
    pub fn with(initial: Value) -> Self {
        Self {
            initial: Some(initial),
            saves: Mutex::new(Vec::new()),
        }
    }

    pub fn saved(&self) -> Vec<Value> {
        self.saves.lock().unwrap().clone()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn load(&self) -> Result<Option<Value>> {
        Ok(self.initial.clone())
    }

    async fn save(&self, data: &Value) -> Result<()> {
        self.saves.lock().unwrap().push(data.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Shown(String, String),
    Dismissed(String),
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub notices: Mutex<Vec<Notice>>,
}

impl RecordingNotifier {
    pub fn notices(&self) -> Vec<Notice> {
        self.notices.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, id: &str, _title: &str, message: &str) {
        self.notices
            .lock()
            .unwrap()
            .push(Notice::Shown(id.to_string(), message.to_string()));
    }

    fn dismiss(&self, id: &str) {
        self.notices
            .lock()
            .unwrap()
            .push(Notice::Dismissed(id.to_string()));
    }
}

/// Resolves every MAC to a fixed address (or nothing)
pub struct StaticResolver(pub Option<String>);

#[async_trait]
impl IpResolver for StaticResolver {
    async fn resolve_ip(&self, _mac: &str) -> Option<String> {
        self.0.clone()
    }
}

#[derive(Default)]
pub struct RecordingHostUpdater {
    pub hosts: Mutex<Vec<String>>,
}

impl RecordingHostUpdater {
    pub fn hosts(&self) -> Vec<String> {
        self.hosts.lock().unwrap().clone()
    }
}

#[async_trait]
impl HostUpdater for RecordingHostUpdater {
    async fn update_host(&self, host: &str) -> Result<()> {
        self.hosts.lock().unwrap().push(host.to_string());
        Ok(())
    }
}
