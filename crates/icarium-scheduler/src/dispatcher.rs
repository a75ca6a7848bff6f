//! The long-running queue consumer.
//!
//! The dispatcher alternates between reading a batch and handing each
//! decoded `build` message to its own task. Builds never block the read
//! loop, and a failing build never stops it. Only consecutive read failures
//! or a shutdown request end the loop, after which in-flight builds are
//! awaited before returning.

use crate::decoder::decode_message;
use crate::queue::{QueueBatch, QueueClient, ReadOptions};
use crate::service::{BuildOutcome, TriggerHandler};
use icarium_config::{DispatcherConfig, QueueConfig};
use icarium_core::{Action, BuildTriggerEvent};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Why the dispatcher stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Shutdown was requested and all builds have drained.
    Shutdown,
    /// The queue could not be read `attempts` times in a row.
    ReadFailuresExhausted { attempts: u32 },
}

pub struct Dispatcher {
    queue: Arc<dyn QueueClient>,
    handler: Arc<dyn TriggerHandler>,
    read_options: ReadOptions,
    config: DispatcherConfig,
    limiter: Option<Arc<Semaphore>>,
    tracker: TaskTracker,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<dyn QueueClient>,
        handler: Arc<dyn TriggerHandler>,
        queue_config: &QueueConfig,
        config: DispatcherConfig,
    ) -> Self {
        let limiter = config
            .max_concurrent_builds
            .map(|n| Arc::new(Semaphore::new(n.max(1))));

        Self {
            queue,
            handler,
            read_options: ReadOptions::from(queue_config),
            config,
            limiter,
            tracker: TaskTracker::new(),
        }
    }

    /// Number of builds currently running.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Consume the queue until `shutdown` fires or reads keep failing.
    ///
    /// A batch that has been read is always fully dispatched, so cancellation
    /// takes effect before the next read. Returns once every spawned build
    /// has finished. A dispatcher runs once.
    pub async fn run(&self, shutdown: CancellationToken) -> DispatchOutcome {
        info!(
            max_messages = self.read_options.max_messages,
            max_failed_reads = self.config.max_failed_reads,
            "Starting dispatcher"
        );

        let mut failed_reads: u32 = 0;

        let outcome = loop {
            if shutdown.is_cancelled() {
                info!("Shutdown requested, no longer reading from queue");
                break DispatchOutcome::Shutdown;
            }

            match self.queue.read(&self.read_options).await {
                Ok(batch) => {
                    failed_reads = 0;
                    self.dispatch_batch(batch);
                }
                Err(e) => {
                    failed_reads += 1;
                    warn!(error = %e, attempt = failed_reads, "Failed to read from queue");

                    if failed_reads >= self.config.max_failed_reads {
                        error!(attempts = failed_reads, "Too many consecutive queue read failures");
                        break DispatchOutcome::ReadFailuresExhausted {
                            attempts: failed_reads,
                        };
                    }
                    sleep(self.config.read_backoff).await;
                }
            }
        };

        self.drain().await;
        outcome
    }

    fn dispatch_batch(&self, batch: QueueBatch) {
        if batch.messages.is_empty() {
            return;
        }
        debug!(count = batch.messages.len(), cursor = ?batch.cursor, "Received batch");

        for message in batch.messages {
            let event = match decode_message(&message.body) {
                Ok(event) => event,
                Err(e) => {
                    warn!(message_id = %message.id, error = %e, "Skipping undecodable message");
                    continue;
                }
            };

            match &event.action {
                Action::Build => self.spawn_build(event),
                Action::Other(action) => {
                    info!(message_id = %message.id, action = %action, "Ignoring unsupported action");
                }
            }
        }
    }

    fn spawn_build(&self, event: BuildTriggerEvent) {
        let handler = self.handler.clone();
        let limiter = self.limiter.clone();

        self.tracker.spawn(async move {
            let _permit = match limiter {
                Some(limiter) => match limiter.acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => return,
                },
                None => None,
            };

            let repo = event.repository_full_name.clone();
            let git_ref = event.r#ref.clone();

            match handler.handle(event).await {
                Ok(BuildOutcome::Built(image)) => {
                    info!(repo = %repo, git_ref = %git_ref, image = %image.reference, "Build succeeded");
                }
                Ok(outcome) => {
                    debug!(repo = %repo, git_ref = %git_ref, outcome = ?outcome, "Nothing to build");
                }
                Err(e) => {
                    let stage = e.stage().map_or("deadline".to_string(), |s| s.to_string());
                    error!(repo = %repo, git_ref = %git_ref, stage = %stage, error = %e, "Build failed");
                }
            }
        });
    }

    async fn drain(&self) {
        self.tracker.close();
        if !self.tracker.is_empty() {
            info!(in_flight = self.tracker.len(), "Waiting for running builds to finish");
        }
        self.tracker.wait().await;
        info!("Dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{QueueError, RawMessage};
    use crate::service::BuildError;
    use crate::service::tests::{FakeRunner, service};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    type ReadResult = Result<QueueBatch, QueueError>;

    /// Replays scripted reads, then requests shutdown once the script is used up.
    struct ScriptedQueue {
        script: Mutex<VecDeque<ReadResult>>,
        reads: AtomicUsize,
        shutdown: CancellationToken,
    }

    impl ScriptedQueue {
        fn new(script: Vec<ReadResult>, shutdown: CancellationToken) -> Self {
            Self {
                script: Mutex::new(script.into()),
                reads: AtomicUsize::new(0),
                shutdown,
            }
        }

        fn reads(&self) -> usize {
            self.reads.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl QueueClient for ScriptedQueue {
        async fn read(&self, _: &ReadOptions) -> ReadResult {
            self.reads.fetch_add(1, Ordering::SeqCst);
            match self.script.lock().unwrap().pop_front() {
                Some(result) => result,
                None => {
                    self.shutdown.cancel();
                    Ok(QueueBatch::default())
                }
            }
        }
    }

    #[derive(Default)]
    struct RecordingHandler {
        handled: Mutex<Vec<String>>,
        completed: AtomicUsize,
        running: AtomicUsize,
        peak: AtomicUsize,
        delay: Duration,
        fail: bool,
    }

    impl RecordingHandler {
        fn handled(&self) -> Vec<String> {
            let mut handled = self.handled.lock().unwrap().clone();
            handled.sort();
            handled
        }
    }

    #[async_trait]
    impl TriggerHandler for RecordingHandler {
        async fn handle(&self, event: BuildTriggerEvent) -> Result<BuildOutcome, BuildError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.handled.lock().unwrap().push(event.commit.clone());

            tokio::time::sleep(self.delay).await;

            self.running.fetch_sub(1, Ordering::SeqCst);
            self.completed.fetch_add(1, Ordering::SeqCst);

            if self.fail {
                Err(BuildError::Event(icarium_core::Error::InvalidInput(
                    "boom".to_string(),
                )))
            } else {
                Ok(BuildOutcome::NoMatchingRule)
            }
        }
    }

    fn config(max_concurrent_builds: Option<usize>) -> DispatcherConfig {
        DispatcherConfig {
            max_failed_reads: 10,
            read_backoff: Duration::from_millis(1),
            max_concurrent_builds,
            build_timeout: None,
        }
    }

    fn build_message(repo: &str, git_ref: &str, commit: &str) -> RawMessage {
        let payload = json!({
            "action": "build",
            "data": {"provider": "github", "repository": repo, "ref": git_ref, "commit": commit}
        });
        RawMessage {
            id: commit.to_string(),
            body: json!({ "Message": payload.to_string() }).to_string(),
        }
    }

    fn raw(id: &str, body: &str) -> RawMessage {
        RawMessage {
            id: id.to_string(),
            body: body.to_string(),
        }
    }

    fn batch(messages: Vec<RawMessage>) -> ReadResult {
        Ok(QueueBatch {
            cursor: None,
            messages,
        })
    }

    fn read_failure() -> ReadResult {
        Err(QueueError::Transport("connection reset".to_string()))
    }

    fn dispatcher(
        queue: Arc<ScriptedQueue>,
        handler: Arc<dyn TriggerHandler>,
        max_concurrent_builds: Option<usize>,
    ) -> Dispatcher {
        Dispatcher::new(
            queue,
            handler,
            &QueueConfig::default(),
            config(max_concurrent_builds),
        )
    }

    #[tokio::test]
    async fn test_consecutive_read_failures_are_fatal() {
        let token = CancellationToken::new();
        let script = (0..10).map(|_| read_failure()).collect();
        let queue = Arc::new(ScriptedQueue::new(script, token.clone()));
        let handler = Arc::new(RecordingHandler::default());

        let outcome = dispatcher(queue.clone(), handler, None).run(token).await;

        assert_eq!(outcome, DispatchOutcome::ReadFailuresExhausted { attempts: 10 });
        assert_eq!(queue.reads(), 10);
    }

    #[tokio::test]
    async fn test_successful_read_resets_failure_count() {
        let token = CancellationToken::new();
        let mut script: Vec<ReadResult> = (0..9).map(|_| read_failure()).collect();
        script.push(batch(vec![]));
        script.extend((0..9).map(|_| read_failure()));
        let queue = Arc::new(ScriptedQueue::new(script, token.clone()));
        let handler = Arc::new(RecordingHandler::default());

        let outcome = dispatcher(queue.clone(), handler, None).run(token).await;

        assert_eq!(outcome, DispatchOutcome::Shutdown);
        assert_eq!(queue.reads(), 20);
    }

    #[tokio::test]
    async fn test_bad_messages_do_not_affect_batch() {
        let token = CancellationToken::new();
        let unknown_action = json!({ "Message": json!({"action": "delete"}).to_string() }).to_string();
        let script = vec![batch(vec![
            build_message("acme/widget", "refs/heads/main", "c1"),
            raw("bad-inner", r#"{"Message": "{broken"}"#),
            raw("not-json", "not json"),
            raw("unknown", &unknown_action),
            build_message("acme/widget", "refs/tags/v1.0.0", "c2"),
        ])];
        let queue = Arc::new(ScriptedQueue::new(script, token.clone()));
        let handler = Arc::new(RecordingHandler::default());

        let outcome = dispatcher(queue, handler.clone(), None).run(token).await;

        assert_eq!(outcome, DispatchOutcome::Shutdown);
        assert_eq!(handler.handled(), vec!["c1", "c2"]);
    }

    #[tokio::test]
    async fn test_failed_builds_do_not_stop_loop() {
        let token = CancellationToken::new();
        let script = vec![
            batch(vec![build_message("acme/widget", "refs/heads/main", "c1")]),
            batch(vec![build_message("acme/widget", "refs/heads/main", "c2")]),
        ];
        let queue = Arc::new(ScriptedQueue::new(script, token.clone()));
        let handler = Arc::new(RecordingHandler {
            fail: true,
            ..Default::default()
        });

        let outcome = dispatcher(queue.clone(), handler.clone(), None).run(token).await;

        assert_eq!(outcome, DispatchOutcome::Shutdown);
        assert_eq!(handler.handled(), vec!["c1", "c2"]);
        assert_eq!(queue.reads(), 3);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_running_builds() {
        let token = CancellationToken::new();
        let script = vec![batch(vec![
            build_message("acme/widget", "refs/heads/main", "c1"),
            build_message("acme/widget", "refs/heads/main", "c2"),
        ])];
        let queue = Arc::new(ScriptedQueue::new(script, token.clone()));
        let handler = Arc::new(RecordingHandler {
            delay: Duration::from_millis(100),
            ..Default::default()
        });

        let dispatcher = dispatcher(queue, handler.clone(), None);
        let outcome = dispatcher.run(token).await;

        assert_eq!(outcome, DispatchOutcome::Shutdown);
        assert_eq!(handler.completed.load(Ordering::SeqCst), 2);
        assert_eq!(dispatcher.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_builds_run_concurrently() {
        let token = CancellationToken::new();
        let script = vec![batch(
            (0..3)
                .map(|i| build_message("acme/widget", "refs/heads/main", &format!("c{}", i)))
                .collect(),
        )];
        let queue = Arc::new(ScriptedQueue::new(script, token.clone()));
        let handler = Arc::new(RecordingHandler {
            delay: Duration::from_millis(50),
            ..Default::default()
        });

        dispatcher(queue, handler.clone(), None).run(token).await;

        assert_eq!(handler.peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_concurrency_cap() {
        let token = CancellationToken::new();
        let script = vec![batch(
            (0..3)
                .map(|i| build_message("acme/widget", "refs/heads/main", &format!("c{}", i)))
                .collect(),
        )];
        let queue = Arc::new(ScriptedQueue::new(script, token.clone()));
        let handler = Arc::new(RecordingHandler {
            delay: Duration::from_millis(10),
            ..Default::default()
        });

        dispatcher(queue, handler.clone(), Some(1)).run(token).await;

        assert_eq!(handler.peak.load(Ordering::SeqCst), 1);
        assert_eq!(handler.completed.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unreachable_database_trips_breaker() {
        let pool = icarium_db::create_lazy_pool(
            "postgres://icarium@127.0.0.1:1/icarium",
            Duration::from_millis(100),
        )
        .unwrap();
        let queue_config = QueueConfig {
            max_messages: 10,
            wait_time: Duration::ZERO,
        };
        let config = DispatcherConfig {
            max_failed_reads: 3,
            ..config(None)
        };
        let dispatcher = Dispatcher::new(
            Arc::new(crate::queue::PgMessageQueue::new(pool)),
            Arc::new(RecordingHandler::default()),
            &queue_config,
            config,
        );

        let outcome = dispatcher.run(CancellationToken::new()).await;
        assert_eq!(outcome, DispatchOutcome::ReadFailuresExhausted { attempts: 3 });
    }

    #[tokio::test]
    async fn test_cancelled_before_first_read() {
        let token = CancellationToken::new();
        token.cancel();
        let queue = Arc::new(ScriptedQueue::new(vec![], token.clone()));
        let handler = Arc::new(RecordingHandler::default());

        let outcome = dispatcher(queue.clone(), handler, None).run(token).await;

        assert_eq!(outcome, DispatchOutcome::Shutdown);
        assert_eq!(queue.reads(), 0);
    }

    #[tokio::test]
    async fn test_queue_message_to_image() {
        let root = tempfile::tempdir().unwrap();
        let token = CancellationToken::new();
        let script = vec![batch(vec![build_message(
            "acme/widget",
            "refs/tags/v2.0.0",
            "abc123",
        )])];
        let queue = Arc::new(ScriptedQueue::new(script, token.clone()));
        let runner = Arc::new(FakeRunner::default());
        let handler = Arc::new(service(root.path(), runner.clone(), true));

        let outcome = dispatcher(queue, handler, None).run(token).await;

        assert_eq!(outcome, DispatchOutcome::Shutdown);
        let commands = runner.commands();
        assert!(commands.iter().any(|c| {
            c.args.first().map(String::as_str) == Some("build")
                && c.args.contains(&"widget:v2.0.0".to_string())
        }));
        assert!(std::fs::read_dir(root.path().join("acme/widget")).unwrap().next().is_none());
    }
}
