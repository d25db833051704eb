//! Scripted browser double shared by the integration tests

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pagefleet::config::{BackoffConfig, BackoffKind, BrowserConfig, Config};
use pagefleet::domain::{CommandKind, ContentBlob, Payload, ResultRecord, WorkerId};
use pagefleet::worker::{Browser, BrowserFactory, BrowserIdentity, ExecError, WorkerCrashError};
use pagestore::{MemoryStore, StorageError, StorageProvider, StoredRecord};
use serde_json::json;

/// What the scripted browser does on one visit of a URL
#[derive(Debug, Clone)]
pub enum Step {
    Ok,
    Crash,
    Fail(String),
    Hang,
}

/// Shared script and observations for every browser a factory creates
#[derive(Default)]
pub struct Script {
    steps: Mutex<HashMap<String, VecDeque<Step>>>,
    visits: Mutex<Vec<(WorkerId, String)>>,
    pub launches: AtomicU32,
    pub fail_launches: AtomicBool,
    running: AtomicUsize,
    pub peak_running: AtomicUsize,
}

impl Script {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Steps for successive visits of `url`; visits past the list succeed
    pub fn on(&self, url: &str, steps: Vec<Step>) {
        self.steps.lock().unwrap().insert(url.to_string(), steps.into());
    }

    pub fn visits(&self) -> Vec<(WorkerId, String)> {
        self.visits.lock().unwrap().clone()
    }

    fn next_step(&self, url: &str) -> Step {
        self.steps
            .lock()
            .unwrap()
            .get_mut(url)
            .and_then(|steps| steps.pop_front())
            .unwrap_or(Step::Ok)
    }
}

pub struct ScriptedFactory {
    pub script: Arc<Script>,
}

impl ScriptedFactory {
    pub fn new(script: Arc<Script>) -> Arc<Self> {
        Arc::new(Self { script })
    }
}

impl BrowserFactory for ScriptedFactory {
    fn create(&self, worker_id: WorkerId, _config: &BrowserConfig) -> Box<dyn Browser> {
        Box::new(ScriptedBrowser {
            worker_id,
            script: self.script.clone(),
            alive: false,
        })
    }
}

struct ScriptedBrowser {
    worker_id: WorkerId,
    script: Arc<Script>,
    alive: bool,
}

struct RunningGuard<'a>(&'a Script);

impl<'a> RunningGuard<'a> {
    fn enter(script: &'a Script) -> Self {
        let now = script.running.fetch_add(1, Ordering::SeqCst) + 1;
        script.peak_running.fetch_max(now, Ordering::SeqCst);
        Self(script)
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.running.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Browser for ScriptedBrowser {
    async fn launch(&mut self) -> Result<BrowserIdentity, WorkerCrashError> {
        self.script.launches.fetch_add(1, Ordering::SeqCst);
        if self.script.fail_launches.load(Ordering::SeqCst) {
            return Err(WorkerCrashError::Launch("scripted launch failure".to_string()));
        }
        self.alive = true;
        Ok(BrowserIdentity {
            pid: None,
            label: format!("scripted-{}", self.worker_id.0),
        })
    }

    async fn execute(&mut self, command: &CommandKind) -> Result<Payload, ExecError> {
        let script = self.script.clone();
        let _running = RunningGuard::enter(&script);
        match command {
            CommandKind::Visit { url } => {
                script.visits.lock().unwrap().push((self.worker_id, url.clone()));
                tokio::time::sleep(Duration::from_millis(5)).await;
                match script.next_step(url) {
                    Step::Ok => Ok(Payload {
                        data: json!({ "url": url, "worker": self.worker_id.0 }),
                        content: vec![ContentBlob {
                            name: "source.html".to_string(),
                            body: format!("<html>{}</html>", url),
                        }],
                    }),
                    Step::Crash => {
                        self.alive = false;
                        Err(WorkerCrashError::ProcessExited("scripted crash".to_string()).into())
                    }
                    Step::Fail(message) => Err(ExecError::Command(message)),
                    Step::Hang => std::future::pending().await,
                }
            }
            CommandKind::Sleep { duration_ms } => {
                tokio::time::sleep(Duration::from_millis(*duration_ms)).await;
                Ok(Payload::default())
            }
        }
    }

    fn is_alive(&mut self) -> bool {
        self.alive
    }

    async fn terminate(&mut self, _grace: Duration) {
        self.alive = false;
    }
}

/// Storage that can be switched into failing every save
#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemoryStore,
    pub failing: AtomicBool,
}

#[async_trait]
impl StorageProvider for FlakyStore {
    async fn save(&self, records: Vec<StoredRecord>) -> Result<usize, StorageError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Io(std::io::Error::other("disk full")));
        }
        self.inner.save(records).await
    }

    async fn save_content(&self, key: &str, content: &[u8]) -> Result<(), StorageError> {
        self.inner.save_content(key, content).await
    }

    async fn flush(&self) -> Result<(), StorageError> {
        self.inner.flush().await
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.inner.close().await
    }
}

/// Fast timeouts and a near-zero backoff
pub fn test_config(dir: &Path, workers: usize) -> Config {
    let mut config = Config::load_default_params(workers).with_directories(dir);
    config.manager.command_timeout_ms = 500;
    config.manager.shutdown_timeout_ms = 1_000;
    config.manager.backoff = BackoffConfig {
        kind: BackoffKind::Fixed,
        initial_ms: 5,
        max_ms: 10,
        jitter: false,
    };
    config
}

/// Decode the stored result records, in save order
pub fn result_records(store: &MemoryStore) -> Vec<ResultRecord> {
    store
        .collection("results")
        .into_iter()
        .map(|stored| serde_json::from_value(stored.body).unwrap())
        .collect()
}
