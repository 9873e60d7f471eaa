//! Real-time agent output streaming.
//!
//! One tailer task per project log file, started on the first subscription
//! and torn down when the last subscriber leaves. Appended bytes are
//! scrubbed before multicast; subscribers never see pre-subscription
//! content (history is `get_logs`' job).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::constants::TAILER_POLL_INTERVAL_MS;
use crate::scrubber::Scrubber;

type Subscribers = Arc<Mutex<HashMap<Uuid, mpsc::UnboundedSender<String>>>>;

struct ProjectStream {
    subscribers: Subscribers,
    tailer: tokio::task::JoinHandle<()>,
}

pub struct StreamManager {
    home: PathBuf,
    scrubber: Arc<Scrubber>,
    streams: Mutex<HashMap<String, ProjectStream>>,
}

impl StreamManager {
    pub fn new(home: &Path, scrubber: Arc<Scrubber>) -> Self {
        Self {
            home: home.to_path_buf(),
            scrubber,
            streams: Mutex::new(HashMap::new()),
        }
    }

    pub fn log_path(&self, project: &str) -> PathBuf {
        self.home.join("logs").join("agents").join(format!("{project}.log"))
    }

    /// Subscribe to a project's appended output. Starts the tailer on the
    /// first subscription.
    pub fn subscribe(&self, project: &str) -> (Uuid, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();

        let mut streams = self.streams.lock().unwrap();
        if let Some(stream) = streams.get(project) {
            stream.subscribers.lock().unwrap().insert(id, tx);
            return (id, rx);
        }

        let subscribers: Subscribers = Arc::new(Mutex::new(HashMap::new()));
        subscribers.lock().unwrap().insert(id, tx);

        let tailer = tokio::spawn(tail_loop(
            self.log_path(project),
            Arc::clone(&subscribers),
            Arc::clone(&self.scrubber),
        ));
        streams.insert(
            project.to_string(),
            ProjectStream {
                subscribers,
                tailer,
            },
        );
        (id, rx)
    }

    /// Remove a subscriber; the tailer stops when none remain.
    pub fn unsubscribe(&self, project: &str, id: Uuid) {
        let mut streams = self.streams.lock().unwrap();
        let Some(stream) = streams.get(project) else {
            return;
        };
        let empty = {
            let mut subs = stream.subscribers.lock().unwrap();
            subs.remove(&id);
            subs.is_empty()
        };
        if empty {
            if let Some(stream) = streams.remove(project) {
                stream.tailer.abort();
            }
        }
    }

    pub fn active_streams(&self) -> usize {
        self.streams.lock().unwrap().len()
    }

    pub fn stop_all(&self) {
        let mut streams = self.streams.lock().unwrap();
        for (_, stream) in streams.drain() {
            stream.tailer.abort();
        }
    }
}

/// Poll the file size; forward appended bytes, scrubbed. Truncation resets
/// the offset to 0.
async fn tail_loop(path: PathBuf, subscribers: Subscribers, scrubber: Arc<Scrubber>) {
    let mut offset: u64 = tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
    let mut interval = tokio::time::interval(Duration::from_millis(TAILER_POLL_INTERVAL_MS));

    loop {
        interval.tick().await;

        let Ok(metadata) = tokio::fs::metadata(&path).await else {
            continue;
        };
        let size = metadata.len();

        if size < offset {
            offset = 0;
        }
        if size == offset {
            continue;
        }

        let Ok(mut file) = tokio::fs::File::open(&path).await else {
            continue;
        };
        if file.seek(std::io::SeekFrom::Start(offset)).await.is_err() {
            continue;
        }
        let mut buf = Vec::with_capacity((size - offset) as usize);
        if file.read_to_end(&mut buf).await.is_err() {
            continue;
        }
        offset += buf.len() as u64;

        let content = scrubber.scrub(&String::from_utf8_lossy(&buf));
        if content.is_empty() {
            continue;
        }

        let mut dead = Vec::new();
        {
            let subs = subscribers.lock().unwrap();
            for (id, tx) in subs.iter() {
                if tx.send(content.clone()).is_err() {
                    dead.push(*id);
                }
            }
        }
        if !dead.is_empty() {
            let mut subs = subscribers.lock().unwrap();
            for id in dead {
                subs.remove(&id);
            }
        }
    }
}
