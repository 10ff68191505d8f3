//! The dispatcher: sequential within a session, parallel across sessions.
//!
//! Claiming is delegated to the queue's atomic take (oldest pending in a
//! session with nothing processing), so any number of dispatcher loops can
//! run concurrently without coordinating: the database hands each message
//! to exactly one of them, and per-session FIFO holds by construction.
//!
//! A worker failure marks the message `error` and the session stays
//! usable; global ordering across sessions is explicitly not promised.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info};

use ax_store::{MessageQueue, QueuedMessage};

use crate::router::Router;
use crate::{Result, RouterError};

/// How a dispatcher loop waits when the queue is empty.
const IDLE_POLL: Duration = Duration::from_millis(250);

/// Runs one worker for one claimed message and returns its response text.
///
/// The supervisor's implementation spawns the sandboxed worker process;
/// tests substitute a function.
#[async_trait]
pub trait WorkerRunner: Send + Sync {
    async fn run(&self, message: &QueuedMessage) -> Result<String>;
}

/// Outcome of processing one claimed message.
#[derive(Debug)]
pub struct DispatchOutcome {
    pub message: QueuedMessage,
    /// Channel-ready response when the worker succeeded and the outbound
    /// pipeline passed it.
    pub response: Option<String>,
    pub canary_leaked: bool,
}

/// One dispatcher. Run several `run_loop`s for cross-session parallelism.
pub struct Dispatcher {
    queue: MessageQueue,
    router: Arc<Router>,
    runner: Arc<dyn WorkerRunner>,
}

impl Dispatcher {
    pub fn new(queue: MessageQueue, router: Arc<Router>, runner: Arc<dyn WorkerRunner>) -> Self {
        Self {
            queue,
            router,
            runner,
        }
    }

    /// Claim and process at most one message. `Ok(None)` when nothing was
    /// claimable.
    pub async fn tick(&self) -> Result<Option<DispatchOutcome>> {
        let Some(message) = self.queue.claim_next().await? else {
            return Ok(None);
        };
        info!(message = %message.id, session = %message.session_id, "dispatching");

        match self.runner.run(&message).await {
            Ok(raw_response) => {
                let outbound = self
                    .router
                    .handle_outbound(&message.session_id, &raw_response)
                    .await?;
                self.router
                    .record_reply(&message.session_id, &outbound.content)
                    .await?;
                self.queue.complete(&message.id).await?;

                Ok(Some(DispatchOutcome {
                    message,
                    response: Some(outbound.content),
                    canary_leaked: outbound.canary_leaked,
                }))
            }
            Err(e) => {
                error!(message = %message.id, error = %e, "worker failed");
                self.queue.fail(&message.id).await?;
                Ok(Some(DispatchOutcome {
                    message,
                    response: None,
                    canary_leaked: false,
                }))
            }
        }
    }

    /// Process until `shutdown` flips true. Outcomes with a response are
    /// sent to `deliveries` for the channel side to pick up.
    pub async fn run_loop(
        &self,
        deliveries: tokio::sync::mpsc::Sender<DispatchOutcome>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        loop {
            if *shutdown.borrow() {
                return;
            }

            match self.tick().await {
                Ok(Some(outcome)) => {
                    if deliveries.send(outcome).await.is_err() {
                        return;
                    }
                }
                Ok(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(IDLE_POLL) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(e) => {
                    error!(error = %e, "dispatch tick failed");
                    tokio::time::sleep(IDLE_POLL).await;
                }
            }
        }
    }
}

/// A runner wrapping a plain async function, used by tests and the CLI
/// chat loop.
pub struct FnRunner<F>(pub F);

#[async_trait]
impl<F, Fut> WorkerRunner for FnRunner<F>
where
    F: Fn(QueuedMessage) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = std::result::Result<String, String>> + Send,
{
    async fn run(&self, message: &QueuedMessage) -> Result<String> {
        (self.0)(message.clone()).await.map_err(RouterError::Worker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::InboundMessage;
    use crate::session::SessionAddress;
    use ax_store::{AuditLog, Database, MessageStatus, SessionStore};
    use ax_taint::{SecurityProfile, TaintEngine};
    use tempfile::TempDir;

    struct Fixture {
        dispatcher: Dispatcher,
        router: Arc<Router>,
        queue: MessageQueue,
        sessions: SessionStore,
        _dir: TempDir,
    }

    async fn fixture(runner: Arc<dyn WorkerRunner>) -> Fixture {
        let dir = TempDir::new().unwrap();
        let db = Database::open_in_memory().await.unwrap();
        let audit = Arc::new(AuditLog::new(dir.path().join("audit.jsonl")));
        let taint = Arc::new(TaintEngine::new(SecurityProfile::Balanced));
        let sessions = SessionStore::new(db.clone());
        let queue = MessageQueue::new(db);
        let router = Arc::new(Router::new(
            taint,
            audit,
            sessions.clone(),
            queue.clone(),
        ));
        Fixture {
            dispatcher: Dispatcher::new(queue.clone(), Arc::clone(&router), runner),
            router,
            queue,
            sessions,
            _dir: dir,
        }
    }

    fn echo_runner() -> Arc<dyn WorkerRunner> {
        Arc::new(FnRunner(|_m: QueuedMessage| async move {
            Ok::<_, String>("hi".to_string())
        }))
    }

    async fn seed(fixture: &Fixture, content: &str) -> String {
        let result = fixture
            .router
            .handle_inbound(
                &SessionAddress::dm("cli", "u1"),
                InboundMessage {
                    channel: "cli".to_string(),
                    sender: "u1".to_string(),
                    content: content.to_string(),
                },
            )
            .await
            .unwrap();
        result.message_id.unwrap()
    }

    #[tokio::test]
    async fn empty_queue_ticks_to_none() {
        let f = fixture(echo_runner()).await;
        assert!(f.dispatcher.tick().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn happy_path_delivers_exactly_the_reply() {
        let f = fixture(echo_runner()).await;
        let id = seed(&f, "hello").await;

        let outcome = f.dispatcher.tick().await.unwrap().unwrap();
        assert_eq!(outcome.message.id, id);
        assert_eq!(outcome.response.as_deref(), Some("hi"));
        assert!(!outcome.canary_leaked);

        let row = f.queue.get(&id).await.unwrap().unwrap();
        assert_eq!(row.status, MessageStatus::Done);
    }

    #[tokio::test]
    async fn worker_failure_marks_error_and_session_survives() {
        let failing: Arc<dyn WorkerRunner> = Arc::new(FnRunner(|_m: QueuedMessage| async move {
            Err::<String, _>("worker crashed".to_string())
        }));
        let f = fixture(failing).await;
        let id = seed(&f, "first").await;

        let outcome = f.dispatcher.tick().await.unwrap().unwrap();
        assert!(outcome.response.is_none());
        assert_eq!(
            f.queue.get(&id).await.unwrap().unwrap().status,
            MessageStatus::Error
        );

        // The session accepts and processes the next message.
        let second = seed(&f, "second").await;
        let next = f.dispatcher.tick().await.unwrap();
        assert_eq!(next.unwrap().message.id, second);
    }

    #[tokio::test]
    async fn leaked_canary_is_redacted_in_outcome() {
        let f = fixture(echo_runner()).await;
        seed(&f, "hello").await;

        let token = f
            .sessions
            .last_canary("cli:dm:u1")
            .await
            .unwrap()
            .unwrap();
        let leaking: Arc<dyn WorkerRunner> = Arc::new(FnRunner(move |_m: QueuedMessage| {
            let token = token.clone();
            async move { Ok::<_, String>(format!("the secret marker is {token}")) }
        }));
        let f2 = Fixture {
            dispatcher: Dispatcher::new(f.queue.clone(), Arc::clone(&f.router), leaking),
            ..f
        };

        let outcome = f2.dispatcher.tick().await.unwrap().unwrap();
        assert!(outcome.canary_leaked);
        assert_eq!(
            outcome.response.as_deref(),
            Some(crate::canary::REDACTION_TEXT)
        );
    }

    #[tokio::test]
    async fn assistant_reply_lands_in_history() {
        let f = fixture(echo_runner()).await;
        seed(&f, "hello").await;
        f.dispatcher.tick().await.unwrap().unwrap();

        let history = f.sessions.history("cli:dm:u1", 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].content, "hi");
    }
}
