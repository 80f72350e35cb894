//! Relation event delivery
//!
//! The controller does not care how relation changes reach it. Anything that
//! can hand out [`RelationEvent`]s implements [`EventSource`]:
//! - [`ChannelEventSource`] is fed over an mpsc channel (the REST API uses this)
//! - [`DirectoryEventSource`] polls a directory of relation files

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::types::{describe_errors, ServiceRequirement};
use crate::error::{Error, Result};

/// A change to the set of related consumers
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RelationEvent {
    Upsert(ServiceRequirement),
    Remove(String),
}

impl RelationEvent {
    pub fn service_name(&self) -> &str {
        match self {
            RelationEvent::Upsert(req) => &req.service_name,
            RelationEvent::Remove(name) => name,
        }
    }
}

/// Source of relation events; `None` means the source is closed
#[async_trait]
pub trait EventSource: Send {
    async fn next_event(&mut self) -> Option<RelationEvent>;
}

/// Event source backed by an mpsc channel
pub struct ChannelEventSource {
    rx: mpsc::Receiver<RelationEvent>,
}

impl ChannelEventSource {
    pub fn new(rx: mpsc::Receiver<RelationEvent>) -> Self {
        Self { rx }
    }

    /// Create a bounded channel and wrap its receiving half
    pub fn channel(buffer: usize) -> (mpsc::Sender<RelationEvent>, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        (tx, Self::new(rx))
    }
}

#[async_trait]
impl EventSource for ChannelEventSource {
    async fn next_event(&mut self) -> Option<RelationEvent> {
        self.rx.recv().await
    }
}

#[derive(Debug)]
struct KnownFile {
    content: String,
    /// Service declared by the last valid content of the file
    service_name: Option<String>,
    /// The content declares a service another file already owns
    conflict: bool,
}

/// Polls a directory where each `*.yaml`, `*.yml` or `*.json` file holds one
/// [`ServiceRequirement`].
///
/// New or changed files produce `Upsert`, deleted files produce `Remove`.
/// A file that stops parsing keeps its last valid relation in place. Each
/// service belongs to one file; a second file declaring it is ignored until
/// the owner goes away.
pub struct DirectoryEventSource {
    dir: PathBuf,
    poll_interval: Duration,
    ticker: Option<Interval>,
    known: BTreeMap<PathBuf, KnownFile>,
    pending: VecDeque<RelationEvent>,
}

impl DirectoryEventSource {
    pub fn new(dir: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            dir: dir.into(),
            poll_interval,
            ticker: None,
            known: BTreeMap::new(),
            pending: VecDeque::new(),
        }
    }

    /// Scan the directory once and queue the resulting events
    pub async fn poll_once(&mut self) -> Result<()> {
        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !is_relation_file(&path) || !entry.file_type().await?.is_file() {
                continue;
            }
            match tokio::fs::read_to_string(&path).await {
                Ok(content) => files.push((path, Some(content))),
                Err(e) => {
                    warn!("Failed to read relation file {}: {}", path.display(), e);
                    files.push((path, None));
                }
            }
        }

        // Removals first, so a file waiting on a taken name can claim it below
        let gone: Vec<PathBuf> = self
            .known
            .keys()
            .filter(|path| !files.iter().any(|(seen, _)| seen == *path))
            .cloned()
            .collect();
        for path in gone {
            if let Some(KnownFile {
                service_name: Some(name),
                ..
            }) = self.known.remove(&path)
            {
                info!("Relation file {} removed, dropping {}", path.display(), name);
                self.pending.push_back(RelationEvent::Remove(name));
            }
        }

        for (path, content) in files {
            if let Some(content) = content {
                self.scan_file(path, content);
            }
        }

        Ok(())
    }

    fn scan_file(&mut self, path: PathBuf, content: String) {
        let known = self.known.get(&path);
        let changed = known.map_or(true, |known| known.content != content);
        if known.is_some_and(|known| !changed && !known.conflict) {
            return;
        }

        let previous = known.and_then(|k| k.service_name.clone());
        let mut conflict = false;
        let service_name = match parse_relation_file(&path, &content) {
            Ok(requirement) => match self.owner_of(&requirement.service_name, &path) {
                Some(owner) => {
                    if changed {
                        warn!(
                            "Ignoring relation file {}: service {} is already declared by {}",
                            path.display(),
                            requirement.service_name,
                            owner.display()
                        );
                    }
                    conflict = true;
                    previous
                }
                None => {
                    if let Some(old) = previous.filter(|old| *old != requirement.service_name) {
                        info!("Relation file {} renamed service {}", path.display(), old);
                        self.pending.push_back(RelationEvent::Remove(old));
                    }
                    debug!(
                        "Relation file {} declares service {}",
                        path.display(),
                        requirement.service_name
                    );
                    let name = requirement.service_name.clone();
                    self.pending.push_back(RelationEvent::Upsert(requirement));
                    Some(name)
                }
            },
            Err(e) => {
                warn!("Ignoring relation file {}: {}", path.display(), e);
                previous
            }
        };

        self.known.insert(
            path,
            KnownFile {
                content,
                service_name,
                conflict,
            },
        );
    }

    /// Another file whose last valid content declares `service`
    fn owner_of(&self, service: &str, except: &Path) -> Option<PathBuf> {
        self.known
            .iter()
            .find(|(path, known)| {
                path.as_path() != except && known.service_name.as_deref() == Some(service)
            })
            .map(|(path, _)| path.clone())
    }
}

#[async_trait]
impl EventSource for DirectoryEventSource {
    async fn next_event(&mut self) -> Option<RelationEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }

            let period = self.poll_interval;
            let ticker = self.ticker.get_or_insert_with(|| {
                let mut ticker = interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker
            });
            ticker.tick().await;

            if let Err(e) = self.poll_once().await {
                warn!(
                    "Failed to scan relation directory {}: {}",
                    self.dir.display(),
                    e
                );
            }
        }
    }
}

fn is_relation_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml" | "yml" | "json")
    )
}

/// Parse and validate a single relation file
pub fn parse_relation_file(path: &Path, content: &str) -> Result<ServiceRequirement> {
    let requirement: ServiceRequirement = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(content)?,
        _ => serde_yaml::from_str(content)?,
    };
    requirement
        .validate()
        .map_err(|errors| Error::ValidationError(describe_errors(&errors)))?;
    Ok(requirement)
}
