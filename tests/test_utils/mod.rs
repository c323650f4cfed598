//! Test utilities shared by the integration test crates.
//!
//! In-memory SQLite with migrations applied, fixture connections, and a
//! scriptable [`MockProvider`] that counts its calls.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use followups::config::{AppConfig, WorkerConfig};
use followups::crypto::CryptoKey;
use followups::dispatcher::DispatchWorker;
use followups::models::connection::{Model as Connection, ProviderKind};
use followups::models::followup_job::{self, Model as FollowUpJob};
use followups::providers::{
    EmailProvider, OutboundMessage, ProviderMessageId, ProviderRegistry, SendError,
};
use followups::repositories::connection::{ConnectionRepository, NewConnection, ProviderCredentials};
use followups::repositories::followup_job::{FollowUpStore, NewFollowUp};
use migration::{Migrator, MigratorTrait};
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, ConnectOptions, Database, DatabaseConnection, EntityTrait, QueryFilter};
use uuid::Uuid;

pub const TEST_TOKEN: &str = "test-operator-token";
pub const TEST_KEY: [u8; 32] = [7u8; 32];

/// Sets up an in-memory SQLite database with all migrations applied.
///
/// The pool is pinned to one connection; every new connection to
/// `sqlite::memory:` would otherwise see its own empty database.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let mut options = ConnectOptions::new("sqlite::memory:");
    options.max_connections(1).min_connections(1).sqlx_logging(false);

    let db = Database::connect(options).await?;
    Migrator::up(&db, None).await?;
    Ok(db)
}

pub fn test_crypto_key() -> CryptoKey {
    CryptoKey::new(TEST_KEY.to_vec()).expect("32-byte test key")
}

/// Valid configuration for router tests; short worker timings.
pub fn test_config() -> AppConfig {
    AppConfig {
        operator_tokens: vec![TEST_TOKEN.to_string()],
        crypto_key: Some(TEST_KEY.to_vec()),
        database_url: "sqlite::memory:".to_string(),
        worker: WorkerConfig {
            tick_interval_seconds: 1,
            batch_size: 50,
            send_timeout_seconds: 2,
            stale_claim_seconds: 900,
            embedded: false,
        },
        ..Default::default()
    }
}

pub async fn create_resend_connection(
    repo: &ConnectionRepository,
    user_id: Uuid,
) -> Result<Connection> {
    repo.create(
        user_id,
        NewConnection {
            provider: ProviderKind::Resend,
            provider_email: "Jane@Example.com".to_string(),
            display_name: Some("Jane Doe".to_string()),
            credentials: ProviderCredentials::ApiKey {
                api_key: "re_test_key".to_string(),
            },
        },
    )
    .await
}

pub async fn create_gmail_connection(
    repo: &ConnectionRepository,
    user_id: Uuid,
    expires_at: Option<DateTime<Utc>>,
    refresh_token: Option<&str>,
) -> Result<Connection> {
    repo.create(
        user_id,
        NewConnection {
            provider: ProviderKind::Gmail,
            provider_email: "jane@gmail.com".to_string(),
            display_name: Some("Jane Doe".to_string()),
            credentials: ProviderCredentials::OAuth {
                access_token: "ya29.old-access".to_string(),
                refresh_token: refresh_token.map(str::to_string),
                expires_at,
            },
        },
    )
    .await
}

pub fn followup_to(recipient: &str, connection_id: Uuid) -> NewFollowUp {
    NewFollowUp {
        connection_id: Some(connection_id),
        recipient: recipient.to_string(),
        original_subject: "Proposal for Q3".to_string(),
        original_body: Some("Hi Bob,\nPlease see the attached proposal.".to_string()),
        delay_hours: Some(24),
        ..Default::default()
    }
}

/// Moves a job's `scheduled_at` into the past so it is due now.
pub async fn make_due(db: &DatabaseConnection, job_id: Uuid) -> Result<()> {
    let past = (Utc::now() - chrono::Duration::seconds(5)).fixed_offset();
    followup_job::Entity::update_many()
        .col_expr(followup_job::Column::ScheduledAt, Expr::value(past))
        .filter(followup_job::Column::Id.eq(job_id))
        .exec(db)
        .await?;
    Ok(())
}

pub async fn reload(db: &DatabaseConnection, job_id: Uuid) -> Result<FollowUpJob> {
    followup_job::Entity::find_by_id(job_id)
        .one(db)
        .await?
        .ok_or_else(|| anyhow::anyhow!("job {} vanished", job_id))
}

/// Provider double. Pops scripted results in order and succeeds once the
/// script is exhausted.
pub struct MockProvider {
    kind: ProviderKind,
    script: Mutex<VecDeque<Result<ProviderMessageId, SendError>>>,
    calls: AtomicUsize,
    sent: Mutex<Vec<OutboundMessage>>,
    delay: Option<Duration>,
    validation: Mutex<Option<SendError>>,
}

impl MockProvider {
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            script: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
            delay: None,
            validation: Mutex::new(None),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push(&self, result: Result<ProviderMessageId, SendError>) {
        self.script.lock().unwrap().push_back(result);
    }

    pub fn push_failures(&self, error: impl Fn() -> SendError, times: usize) {
        for _ in 0..times {
            self.push(Err(error()));
        }
    }

    /// Makes every later `validate` call fail with `error`
    pub fn fail_validation(&self, error: SendError) {
        *self.validation.lock().unwrap() = Some(error);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl EmailProvider for MockProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn send(
        &self,
        _connection: &Connection,
        message: &OutboundMessage,
    ) -> Result<ProviderMessageId, SendError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.script.lock().unwrap().pop_front();
        let result = scripted.unwrap_or_else(|| Ok(format!("mock-message-{}", call)));
        if result.is_ok() {
            self.sent.lock().unwrap().push(message.clone());
        }
        result
    }

    async fn validate(&self, _connection: &Connection) -> Result<(), SendError> {
        match self.validation.lock().unwrap().clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Store, connections and a worker wired to one [`MockProvider`] per kind.
pub struct Harness {
    pub db: DatabaseConnection,
    pub store: FollowUpStore,
    pub connections: Arc<ConnectionRepository>,
    pub resend: Arc<MockProvider>,
    pub gmail: Arc<MockProvider>,
    pub worker: Arc<DispatchWorker>,
}

impl Harness {
    pub async fn new() -> Result<Self> {
        Self::with_providers(
            MockProvider::new(ProviderKind::Resend),
            MockProvider::new(ProviderKind::Gmail),
        )
        .await
    }

    pub async fn with_providers(resend: MockProvider, gmail: MockProvider) -> Result<Self> {
        let db = setup_test_db().await?;
        let connections = Arc::new(ConnectionRepository::new(
            Arc::new(db.clone()),
            test_crypto_key(),
        ));
        let resend = Arc::new(resend);
        let gmail = Arc::new(gmail);

        let mut registry = ProviderRegistry::new();
        registry.register(resend.clone());
        registry.register(gmail.clone());

        let store = FollowUpStore::new(db.clone());
        let worker = DispatchWorker::new(
            store.clone(),
            Arc::clone(&connections),
            registry,
            test_config().worker,
        );

        Ok(Self {
            db,
            store,
            connections,
            resend,
            gmail,
            worker: Arc::new(worker),
        })
    }

    pub fn registry(&self) -> ProviderRegistry {
        let mut registry = ProviderRegistry::new();
        registry.register(self.resend.clone());
        registry.register(self.gmail.clone());
        registry
    }

    /// A user with one active Resend connection and a due follow-up.
    pub async fn due_job(&self, recipient: &str) -> Result<(Uuid, Connection, FollowUpJob)> {
        let user_id = Uuid::new_v4();
        let connection = create_resend_connection(&self.connections, user_id).await?;
        let job = self
            .store
            .enqueue(user_id, followup_to(recipient, connection.id))
            .await?;
        make_due(&self.db, job.id).await?;
        Ok((user_id, connection, job))
    }
}
