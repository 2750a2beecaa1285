use async_trait::async_trait;
use chrono::Utc;
use futures::TryStreamExt;
use mongodb::{
    bson::{self, doc, DateTime as BsonDateTime, Document},
    options::{FindOneAndUpdateOptions, FindOptions, IndexOptions, ReturnDocument},
    Client as MongoClient, Collection, IndexModel,
};
use service_core::error::AppError;
use std::time::Duration;

use super::{RetryPolicy, RetryStore};
use crate::models::{AttemptOutcome, RecordState, RetryRecord, RetryStats};
use crate::services::metrics;

const MAX_UPDATE_CONFLICTS: usize = 3;

/// Retry store backed by a MongoDB collection, shared by every worker instance.
///
/// Claims go through `findOneAndUpdate` conditioned on the current lease, so at
/// most one worker wins a record. Dead letters carry `expires_at` and are
/// removed by the TTL index.
#[derive(Clone)]
pub struct MongoRetryStore {
    client: MongoClient,
    records: Collection<Document>,
    policy: RetryPolicy,
}

impl MongoRetryStore {
    pub async fn connect(
        uri: &str,
        database: &str,
        collection: &str,
        policy: RetryPolicy,
    ) -> Result<Self, AppError> {
        tracing::info!(
            database = %database,
            collection = %collection,
            "Connecting retry store to MongoDB"
        );
        let client = MongoClient::with_uri_str(uri).await.map_err(|e| {
            tracing::error!("Failed to connect to MongoDB: {}", e);
            AppError::DatabaseError(anyhow::anyhow!(e.to_string()))
        })?;
        let records = client.database(database).collection(collection);
        Ok(Self {
            client,
            records,
            policy,
        })
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn initialize_indexes(&self) -> Result<(), AppError> {
        tracing::info!("Creating MongoDB indexes for the retry store");

        let indexes = [
            IndexModel::builder()
                .keys(doc! { "state": 1, "next_retry_at": 1 })
                .options(IndexOptions::builder().name("due_idx".to_string()).build())
                .build(),
            IndexModel::builder()
                .keys(doc! { "payload.correlation_id": 1 })
                .options(
                    IndexOptions::builder()
                        .name("correlation_id_idx".to_string())
                        .build(),
                )
                .build(),
            // Only dead letters carry expires_at, so pending work never expires.
            IndexModel::builder()
                .keys(doc! { "expires_at": 1 })
                .options(
                    IndexOptions::builder()
                        .name("dead_letter_ttl_idx".to_string())
                        .expire_after(Duration::ZERO)
                        .sparse(true)
                        .build(),
                )
                .build(),
        ];

        self.records
            .create_indexes(indexes, None)
            .await
            .map_err(|e| {
                tracing::error!("Failed to create retry store indexes: {}", e);
                AppError::DatabaseError(anyhow::anyhow!(e.to_string()))
            })?;

        tracing::info!("Successfully created retry store indexes");
        Ok(())
    }

    /// Decode a stored document, deleting it when it no longer matches the record shape.
    async fn decode_or_discard(&self, document: Document) -> Option<RetryRecord> {
        match bson::from_document::<RetryRecord>(document.clone()) {
            Ok(record) => Some(record),
            Err(e) => {
                let id = document.get("_id").cloned();
                tracing::warn!(
                    record_id = ?id,
                    error = %e,
                    "Discarding undecodable retry record"
                );
                metrics::record_reconciliation_outcome("discarded");
                if let Some(id) = id {
                    if let Err(e) = self.records.delete_one(doc! { "_id": id }, None).await {
                        tracing::error!("Failed to discard retry record: {}", e);
                    }
                }
                None
            }
        }
    }

    async fn find_records(
        &self,
        filter: Document,
        options: FindOptions,
    ) -> Result<Vec<RetryRecord>, AppError> {
        let mut cursor = self.records.find(filter, options).await.map_err(|e| {
            tracing::error!("Failed to query retry records: {}", e);
            AppError::DatabaseError(anyhow::anyhow!(e.to_string()))
        })?;

        let mut records = Vec::new();
        while let Some(document) = cursor.try_next().await.map_err(|e| {
            tracing::error!("Failed to read retry records: {}", e);
            AppError::DatabaseError(anyhow::anyhow!(e.to_string()))
        })? {
            if let Some(record) = self.decode_or_discard(document).await {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn count(&self, filter: Document) -> Result<u64, AppError> {
        self.records
            .count_documents(filter, None)
            .await
            .map_err(|e| {
                tracing::error!("Failed to count retry records: {}", e);
                AppError::DatabaseError(anyhow::anyhow!(e.to_string()))
            })
    }
}

fn unleased_at(now: BsonDateTime) -> Vec<Document> {
    vec![
        doc! { "lease_expires_at": null },
        doc! { "lease_expires_at": { "$lte": now } },
    ]
}

fn limit_of(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

#[async_trait]
impl RetryStore for MongoRetryStore {
    fn backend_name(&self) -> &'static str {
        "durable"
    }

    async fn enqueue(&self, record: RetryRecord) -> Result<String, AppError> {
        let document = bson::to_document(&record)?;
        self.records.insert_one(document, None).await.map_err(|e| {
            tracing::error!("Failed to insert retry record: {}", e);
            AppError::DatabaseError(anyhow::anyhow!(e.to_string()))
        })?;
        tracing::debug!(
            record_id = %record.id,
            provider = %record.payload.provider,
            action = %record.payload.action,
            "Retry record enqueued"
        );
        Ok(record.id)
    }

    async fn fetch_due(&self, limit: usize) -> Result<Vec<RetryRecord>, AppError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let now = BsonDateTime::from_chrono(Utc::now());
        let filter = doc! {
            "state": RecordState::Pending.to_string(),
            "next_retry_at": { "$lte": now },
            "$or": unleased_at(now),
        };

        let options = FindOptions::builder()
            .sort(doc! { "next_retry_at": 1 })
            .limit(limit_of(limit))
            .build();
        self.find_records(filter, options).await
    }

    async fn claim_record(
        &self,
        id: &str,
        worker_id: &str,
        lease_seconds: u64,
    ) -> Result<bool, AppError> {
        let now = Utc::now();
        let lease = i64::try_from(lease_seconds).unwrap_or(i64::MAX / 1000);
        let lease_until = now + chrono::Duration::seconds(lease);
        let now = BsonDateTime::from_chrono(now);

        let mut holders = unleased_at(now);
        holders.push(doc! { "claimed_by": worker_id });
        let filter = doc! {
            "_id": id,
            "state": RecordState::Pending.to_string(),
            "$or": holders,
        };
        let update = doc! {
            "$set": {
                "claimed_by": worker_id,
                "lease_expires_at": BsonDateTime::from_chrono(lease_until),
            }
        };
        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();

        let claimed = self
            .records
            .find_one_and_update(filter, update, options)
            .await
            .map_err(|e| {
                tracing::error!("Failed to claim retry record: {}", e);
                AppError::DatabaseError(anyhow::anyhow!(e.to_string()))
            })?;
        Ok(claimed.is_some())
    }

    async fn mark_success(&self, id: &str) -> Result<(), AppError> {
        self.records
            .delete_one(doc! { "_id": id }, None)
            .await
            .map_err(|e| {
                tracing::error!("Failed to delete retry record: {}", e);
                AppError::DatabaseError(anyhow::anyhow!(e.to_string()))
            })?;
        Ok(())
    }

    async fn increment_attempt(
        &self,
        id: &str,
        last_error: &str,
    ) -> Result<AttemptOutcome, AppError> {
        // Read, apply the policy, then replace only if nobody bumped `attempts` meanwhile.
        for _ in 0..MAX_UPDATE_CONFLICTS {
            let mut record = self.get(id).await?.ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!("retry record {} not found", id))
            })?;
            let previous = record.attempts;
            let outcome = self.policy.register_failure(&mut record, last_error, Utc::now());

            let result = self
                .records
                .replace_one(
                    doc! { "_id": id, "attempts": i64::from(previous) },
                    bson::to_document(&record)?,
                    None,
                )
                .await
                .map_err(|e| {
                    tracing::error!("Failed to update retry record: {}", e);
                    AppError::DatabaseError(anyhow::anyhow!(e.to_string()))
                })?;

            if result.matched_count == 1 {
                return Ok(outcome);
            }
            tracing::debug!(record_id = %id, "Retry record changed concurrently, re-reading");
        }

        Err(AppError::Conflict(anyhow::anyhow!(
            "retry record {} kept changing during update",
            id
        )))
    }

    async fn get_stats(&self) -> Result<RetryStats, AppError> {
        let now = BsonDateTime::from_chrono(Utc::now());
        let pending_total = self
            .count(doc! { "state": RecordState::Pending.to_string() })
            .await?;
        let leased = self
            .count(doc! {
                "state": RecordState::Pending.to_string(),
                "lease_expires_at": { "$gt": now },
            })
            .await?;
        let dead_letter = self
            .count(doc! { "state": RecordState::DeadLetter.to_string() })
            .await?;

        Ok(RetryStats {
            pending: pending_total.saturating_sub(leased),
            leased,
            dead_letter,
            total: pending_total + dead_letter,
        })
    }

    async fn get(&self, id: &str) -> Result<Option<RetryRecord>, AppError> {
        let document = self
            .records
            .find_one(doc! { "_id": id }, None)
            .await
            .map_err(|e| {
                tracing::error!("Failed to find retry record: {}", e);
                AppError::DatabaseError(anyhow::anyhow!(e.to_string()))
            })?;
        match document {
            Some(document) => Ok(self.decode_or_discard(document).await),
            None => Ok(None),
        }
    }

    async fn find_by_correlation_id(
        &self,
        correlation_id: &str,
    ) -> Result<Vec<RetryRecord>, AppError> {
        let options = FindOptions::builder().sort(doc! { "created_at": 1 }).build();
        self.find_records(doc! { "payload.correlation_id": correlation_id }, options)
            .await
    }

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<RetryRecord>, AppError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let options = FindOptions::builder()
            .sort(doc! { "updated_at": -1 })
            .limit(limit_of(limit))
            .build();
        self.find_records(
            doc! { "state": RecordState::DeadLetter.to_string() },
            options,
        )
        .await
    }

    async fn health_check(&self) -> Result<(), AppError> {
        self.client
            .database("admin")
            .run_command(doc! { "ping": 1 }, None)
            .await
            .map_err(|e| {
                tracing::error!("MongoDB health check failed: {}", e);
                AppError::DatabaseError(anyhow::anyhow!(e.to_string()))
            })?;
        Ok(())
    }
}
