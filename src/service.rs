//! Service lifecycle: dependency wiring, task fan-out, bounded drain.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bus::{Broker, BusError, QueueConsumer};
use crate::config::Config;
use crate::handlers::{CreateChatHandler, CreateMessageHandler, QueueHandler, UpdateMessageHandler};
use crate::reconciler::CountReconciler;
use crate::search::SearchIndex;
use crate::storage::{Counters, Db, StorageError};

/// Time allowed for tasks to observe cancellation before a forced exit.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Fatal startup errors. Any of these exits the process non-zero.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// The wired writer service, ready to run.
pub struct Service {
    db: Db,
    counters: Counters,
    broker: Arc<Broker>,
    search: Option<Arc<SearchIndex>>,
}

impl Service {
    /// Connect dependencies in order: relational, KV, broker, search.
    ///
    /// The search index is optional: a connect failure logs a warning
    /// and the service runs without indexing.
    pub async fn connect(config: &Config) -> Result<Self, ServiceError> {
        let db = Db::connect(&config.database).await?;
        let counters = Counters::connect(&config.redis_url).await?;
        let broker = Arc::new(Broker::connect(&config.amqp_url).await?);

        let search = match SearchIndex::connect(&config.search_url).await {
            Ok(index) => {
                if let Err(err) = index.ensure_index().await {
                    warn!(error = %err, "failed to ensure search index");
                }
                Some(Arc::new(index))
            }
            Err(err) => {
                warn!(error = %err, "search index unavailable, continuing without it");
                None
            }
        };

        Ok(Self {
            db,
            counters,
            broker,
            search,
        })
    }

    /// Fan out the consumer loops and the reconciler, then block until
    /// cancellation and drain for at most [`SHUTDOWN_GRACE`].
    pub async fn run(self, shutdown: CancellationToken) {
        let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        tasks.push((
            CreateChatHandler::QUEUE,
            spawn_consumer(
                QueueConsumer::new(
                    Arc::clone(&self.broker),
                    CreateChatHandler::new(self.db.clone(), self.counters.clone()),
                ),
                shutdown.clone(),
            ),
        ));
        tasks.push((
            CreateMessageHandler::QUEUE,
            spawn_consumer(
                QueueConsumer::new(
                    Arc::clone(&self.broker),
                    CreateMessageHandler::new(
                        self.db.clone(),
                        self.counters.clone(),
                        self.search.clone(),
                    ),
                ),
                shutdown.clone(),
            ),
        ));
        tasks.push((
            UpdateMessageHandler::QUEUE,
            spawn_consumer(
                QueueConsumer::new(
                    Arc::clone(&self.broker),
                    UpdateMessageHandler::new(self.db.clone(), self.search.clone()),
                ),
                shutdown.clone(),
            ),
        ));

        let reconciler = CountReconciler::new(self.db.clone(), self.counters.clone());
        let reconciler_shutdown = shutdown.clone();
        tasks.push((
            "reconciler",
            tokio::spawn(async move { reconciler.run(reconciler_shutdown).await }),
        ));

        info!("writer service started");
        shutdown.cancelled().await;
        info!("shutting down writer service");

        let drain = async {
            for (name, task) in tasks {
                if let Err(err) = task.await {
                    error!(task = name, error = %err, "task terminated abnormally");
                }
            }
        };
        match tokio::time::timeout(SHUTDOWN_GRACE, drain).await {
            Ok(()) => info!("all tasks stopped"),
            Err(_) => warn!("shutdown grace period exceeded, forcing exit"),
        }
    }
}

fn spawn_consumer<H: QueueHandler>(
    consumer: QueueConsumer<H>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(err) = consumer.run(shutdown).await {
            error!(queue = H::QUEUE, error = %err, "consumer exited with error");
        }
    })
}
