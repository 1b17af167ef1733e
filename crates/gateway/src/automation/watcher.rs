//! File-watch triggers: recursive watchers per configured path, glob
//! filtering, create/modify/delete classification by post-event existence,
//! and per-(automation, path) debouncing.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::executor::AutomationExecutor;
use super::model::{Automation, FileWatchTrigger, TriggerConfig, WatchEventKind};
use super::store::AutomationStore;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from(path));
    }
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Classify by what the filesystem says after the event: a vanished path is
/// a delete; an existing path is a create when the backend reported one,
/// otherwise a modify.
pub fn classify(kind: &notify::EventKind, path: &Path) -> WatchEventKind {
    if !path.exists() {
        WatchEventKind::Delete
    } else if matches!(kind, notify::EventKind::Create(_)) {
        WatchEventKind::Create
    } else {
        WatchEventKind::Modify
    }
}

fn matches_pattern(pattern: Option<&glob::Pattern>, path: &Path) -> bool {
    let Some(pattern) = pattern else {
        return true;
    };
    if pattern.matches_path(path) {
        return true;
    }
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| pattern.matches(name))
        .unwrap_or(false)
}

fn event_label(kind: WatchEventKind) -> &'static str {
    match kind {
        WatchEventKind::Create => "create",
        WatchEventKind::Modify => "modify",
        WatchEventKind::Delete => "delete",
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scheduler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct WatchHandle {
    /// Keeps the native watchers alive; dropping them stops the watch.
    _watchers: Vec<RecommendedWatcher>,
    task: JoinHandle<()>,
}

pub struct FileWatchScheduler {
    store: Arc<AutomationStore>,
    executor: Arc<AutomationExecutor>,
    default_debounce_ms: u64,
    watches: Mutex<HashMap<Uuid, WatchHandle>>,
}

impl FileWatchScheduler {
    pub fn new(
        store: Arc<AutomationStore>,
        executor: Arc<AutomationExecutor>,
        default_debounce_ms: u64,
    ) -> Self {
        Self {
            store,
            executor,
            default_debounce_ms,
            watches: Mutex::new(HashMap::new()),
        }
    }

    /// Install every active file-watch automation.
    pub fn start(&self) {
        for automation in self.store.list_active() {
            self.install(&automation);
        }
    }

    pub fn install(&self, automation: &Automation) {
        let Some(TriggerConfig::FileWatch(trigger)) = &automation.trigger else {
            return;
        };

        let pattern = match &trigger.pattern {
            None => None,
            Some(raw) => match glob::Pattern::new(raw) {
                Ok(pattern) => Some(pattern),
                Err(e) => {
                    tracing::warn!(
                        automation = %automation.name,
                        pattern = %raw,
                        error = %e,
                        "glob pattern failed to parse, not installing watch"
                    );
                    return;
                }
            },
        };

        self.remove(automation.id);

        let (event_tx, event_rx) = mpsc::channel::<notify::Event>(256);
        let mut watchers = Vec::new();
        for raw_path in &trigger.paths {
            let path = expand_tilde(raw_path);
            let tx = event_tx.clone();
            let watcher = RecommendedWatcher::new(
                move |result: Result<notify::Event, notify::Error>| match result {
                    Ok(event) => {
                        let _ = tx.blocking_send(event);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "file watcher error");
                    }
                },
                notify::Config::default(),
            );
            let mut watcher = match watcher {
                Ok(watcher) => watcher,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to create watcher");
                    continue;
                }
            };
            if let Err(e) = watcher.watch(&path, RecursiveMode::Recursive) {
                tracing::warn!(path = %path.display(), error = %e, "failed to watch path");
                continue;
            }
            tracing::info!(
                automation = %automation.name,
                path = %path.display(),
                "watching path"
            );
            watchers.push(watcher);
        }
        if watchers.is_empty() {
            tracing::warn!(automation = %automation.name, "no watchable paths, not installing");
            return;
        }

        let task = spawn_event_pipeline(
            automation.id,
            automation.name.clone(),
            self.executor.clone(),
            event_rx,
            pattern,
            trigger.events.clone(),
            trigger.debounce_ms.unwrap_or(self.default_debounce_ms),
        );

        self.watches.lock().insert(
            automation.id,
            WatchHandle {
                _watchers: watchers,
                task,
            },
        );
    }

    pub fn remove(&self, automation_id: Uuid) {
        if let Some(handle) = self.watches.lock().remove(&automation_id) {
            handle.task.abort();
        }
    }

    pub fn reload(&self, automation_id: Uuid) {
        self.remove(automation_id);
        if let Some(automation) = self.store.get(automation_id) {
            if automation.status == super::model::AutomationStatus::Active {
                self.install(&automation);
            }
        }
    }

    pub fn installed_count(&self) -> usize {
        self.watches.lock().len()
    }
}

/// Per event: glob filter, classify, event-kind filter, then debounce per
/// path. Only the last event inside a debounce window fires; it is enriched
/// with the file size when the file still exists.
fn spawn_event_pipeline(
    automation_id: Uuid,
    automation_name: String,
    executor: Arc<AutomationExecutor>,
    mut events: mpsc::Receiver<notify::Event>,
    pattern: Option<glob::Pattern>,
    wanted: Vec<WatchEventKind>,
    debounce_ms: u64,
) -> JoinHandle<()> {
    // Path → generation counter; a debounce timer only fires if no newer
    // event bumped the generation while it slept.
    let generations: Arc<Mutex<HashMap<PathBuf, u64>>> = Arc::new(Mutex::new(HashMap::new()));

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            for path in &event.paths {
                if !matches_pattern(pattern.as_ref(), path) {
                    continue;
                }
                let kind = classify(&event.kind, path);
                if !wanted.contains(&kind) {
                    continue;
                }

                let generation = {
                    let mut map = generations.lock();
                    let counter = map.entry(path.clone()).or_insert(0);
                    *counter += 1;
                    *counter
                };

                let generations = generations.clone();
                let executor = executor.clone();
                let automation_name = automation_name.clone();
                let path = path.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(std::time::Duration::from_millis(debounce_ms)).await;
                    {
                        let map = generations.lock();
                        if map.get(&path) != Some(&generation) {
                            return; // superseded within the window
                        }
                    }

                    let size = std::fs::metadata(&path).ok().map(|m| m.len());
                    let mut file = serde_json::json!({ "path": path.display().to_string() });
                    if let Some(size) = size {
                        file["size"] = serde_json::json!(size);
                    }
                    let trigger_data = serde_json::json!({
                        "trigger": "file_watch",
                        "event": event_label(kind),
                        "file": file,
                    });

                    match executor.queue_execution(automation_id, trigger_data) {
                        Ok(execution_id) => {
                            tracing::info!(
                                automation = %automation_name,
                                path = %path.display(),
                                %execution_id,
                                "file watch fired"
                            );
                        }
                        Err(e) => {
                            tracing::warn!(
                                automation = %automation_name,
                                error = %e,
                                "file watch enqueue skipped"
                            );
                        }
                    }
                });
            }
        }
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::llm::{Iteration, IterationStream, LlmError, ResearchRequest};
    use async_trait::async_trait;
    use wf_mcp_client::{McpManager, McpServerRegistry};
    use wf_tools::fetch::{FetchLimits, WebFetcher};
    use wf_trajectory::TrajectoryStore;

    #[test]
    fn tilde_expansion() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde("~"), home);
            assert_eq!(expand_tilde("~/watched"), home.join("watched"));
        }
        assert_eq!(expand_tilde("/absolute/path"), PathBuf::from("/absolute/path"));
    }

    #[test]
    fn pattern_matching_on_name_and_path() {
        let pattern = glob::Pattern::new("*.md").unwrap();
        assert!(matches_pattern(Some(&pattern), Path::new("/watch/notes.md")));
        assert!(!matches_pattern(Some(&pattern), Path::new("/watch/notes.txt")));
        assert!(matches_pattern(None, Path::new("/anything")));
    }

    #[test]
    fn classification_by_existence() {
        let dir = tempfile::tempdir().unwrap();
        let existing = dir.path().join("present.txt");
        std::fs::write(&existing, "x").unwrap();
        let gone = dir.path().join("missing.txt");

        let create_kind = notify::EventKind::Create(notify::event::CreateKind::File);
        let modify_kind =
            notify::EventKind::Modify(notify::event::ModifyKind::Data(
                notify::event::DataChange::Content,
            ));

        assert_eq!(classify(&create_kind, &existing), WatchEventKind::Create);
        assert_eq!(classify(&modify_kind, &existing), WatchEventKind::Modify);
        // Whatever the backend said, a vanished path is a delete.
        assert_eq!(classify(&modify_kind, &gone), WatchEventKind::Delete);
    }

    // ── End-to-end debounce ────────────────────────────────────────────

    struct ImmediateLlm;

    #[async_trait]
    impl crate::runtime::llm::LlmClient for ImmediateLlm {
        async fn research(&self, _request: ResearchRequest) -> Result<IterationStream, LlmError> {
            let stream = async_stream::stream! {
                let mut first = Iteration::terminal("ok");
                first.system_prompt = Some("sys".into());
                yield Ok(first);
            };
            Ok(Box::pin(stream))
        }
    }

    fn fixture() -> (tempfile::TempDir, Arc<AutomationStore>, Arc<AutomationExecutor>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(AutomationStore::new(dir.path()).unwrap());
        let trajectories = Arc::new(TrajectoryStore::new(dir.path()).unwrap());
        let registry = Arc::new(McpServerRegistry::new(dir.path()).unwrap());
        let executor = Arc::new(AutomationExecutor::new(
            store.clone(),
            trajectories,
            Arc::new(ImmediateLlm),
            Arc::new(McpManager::new(registry)),
            Arc::new(WebFetcher::new(FetchLimits::default()).unwrap()),
            Arc::new(wf_domain::config::Config::default()),
        ));
        executor.start();
        (dir, store, executor)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn burst_of_modifies_fires_once() {
        let (state_dir, store, executor) = fixture();
        let watched = state_dir.path().join("watched");
        std::fs::create_dir(&watched).unwrap();
        let file = watched.join("a.txt");
        std::fs::write(&file, "seed").unwrap();

        let automation = store
            .create(Automation::new(
                "admin",
                "on-change",
                "summarize the change",
                Some(TriggerConfig::FileWatch(FileWatchTrigger {
                    paths: vec![watched.display().to_string()],
                    pattern: None,
                    events: vec![WatchEventKind::Modify],
                    debounce_ms: Some(300),
                })),
            ))
            .unwrap();

        let scheduler = FileWatchScheduler::new(store.clone(), executor, 500);
        scheduler.install(&automation);
        assert_eq!(scheduler.installed_count(), 1);
        // Let the watcher settle before generating events.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        for i in 0..10 {
            std::fs::write(&file, format!("revision {i}")).unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(15)).await;
        }

        // Wait out the debounce window plus slack.
        tokio::time::sleep(std::time::Duration::from_millis(900)).await;

        let executions = store.executions_for(automation.id);
        assert_eq!(
            executions.len(),
            1,
            "expected exactly one execution from the burst, got {}",
            executions.len()
        );
        let trigger = &executions[0].trigger_data;
        assert_eq!(trigger["event"], "modify");
        assert_eq!(trigger["file"]["path"], file.display().to_string());

        scheduler.remove(automation.id);
        assert_eq!(scheduler.installed_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn event_kind_filter_applies() {
        let (state_dir, store, executor) = fixture();
        let watched = state_dir.path().join("watched");
        std::fs::create_dir(&watched).unwrap();

        // Only deletes are interesting to this automation.
        let automation = store
            .create(Automation::new(
                "admin",
                "on-delete",
                "react to deletion",
                Some(TriggerConfig::FileWatch(FileWatchTrigger {
                    paths: vec![watched.display().to_string()],
                    pattern: None,
                    events: vec![WatchEventKind::Delete],
                    debounce_ms: Some(100),
                })),
            ))
            .unwrap();

        let scheduler = FileWatchScheduler::new(store.clone(), executor, 500);
        scheduler.install(&automation);
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        // Creating and writing files must not fire.
        let file = watched.join("kept.txt");
        std::fs::write(&file, "content").unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(400)).await;
        assert!(store.executions_for(automation.id).is_empty());

        // Deleting fires exactly once.
        std::fs::remove_file(&file).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(600)).await;
        let executions = store.executions_for(automation.id);
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].trigger_data["event"], "delete");

        scheduler.remove(automation.id);
    }

    #[tokio::test]
    async fn invalid_glob_not_installed() {
        let (state_dir, store, executor) = fixture();
        let automation = store
            .create(Automation::new(
                "admin",
                "broken",
                "p",
                Some(TriggerConfig::FileWatch(FileWatchTrigger {
                    paths: vec![state_dir.path().display().to_string()],
                    pattern: Some("[unclosed".into()),
                    events: vec![WatchEventKind::Modify],
                    debounce_ms: None,
                })),
            ))
            .unwrap();

        let scheduler = FileWatchScheduler::new(store, executor, 500);
        scheduler.install(&automation);
        assert_eq!(scheduler.installed_count(), 0);
    }
}
