use crate::database::error::{DatabaseError, DatabaseErrorKind};
use crate::database::transaction::{
    NewTransaction, ProductType, Transaction, TransactionStatus, TransitionOutcome,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres};

const TRANSACTION_COLUMNS: &str = "id, user_id, product_type, product_id, recipient_id, price, \
     currency, status, provider, payment_id, recurring, parent_id, metadata, \
     created_at, updated_at, purchased_at";

/// Persistence for purchase transactions.
///
/// `complete` and `cancel` only act on pending rows; a call against a
/// terminal row reports [`TransitionOutcome::Unchanged`] and writes nothing.
#[async_trait]
pub trait TransactionStore: Send + Sync {
    async fn create(&self, new: NewTransaction) -> Result<Transaction, DatabaseError>;

    async fn find_by_id(&self, id: i64) -> Result<Option<Transaction>, DatabaseError>;

    async fn set_payment_id(&self, id: i64, payment_id: &str) -> Result<(), DatabaseError>;

    /// Shallow-merges `patch` into the row's metadata object.
    async fn merge_metadata(&self, id: i64, patch: serde_json::Value)
        -> Result<(), DatabaseError>;

    /// `pending -> succeeded` plus fulfillment of the purchased product, atomically.
    async fn complete(
        &self,
        id: i64,
        payment_id: Option<&str>,
        metadata: serde_json::Value,
    ) -> Result<TransitionOutcome, DatabaseError>;

    async fn cancel(
        &self,
        id: i64,
        metadata: serde_json::Value,
    ) -> Result<TransitionOutcome, DatabaseError>;

    /// Pending rows created inside `(created_after, created_before]`, oldest first.
    async fn find_pending(
        &self,
        created_before: DateTime<Utc>,
        created_after: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Transaction>, DatabaseError>;

    /// Latest succeeded first payment of a recurring subscription chain.
    async fn find_recurring_parent(
        &self,
        user_id: i64,
        package_id: i64,
        provider: &str,
    ) -> Result<Option<Transaction>, DatabaseError>;
}

/// Postgres-backed [`TransactionStore`]
pub struct PgTransactionStore {
    pool: PgPool,
}

impl PgTransactionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn current_status(
        &self,
        tx: &mut sqlx::Transaction<'_, Postgres>,
        id: i64,
    ) -> Result<TransactionStatus, DatabaseError> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM transactions WHERE id = $1")
                .bind(id)
                .fetch_optional(&mut **tx)
                .await
                .map_err(DatabaseError::from_sqlx)?;

        let status = status.ok_or_else(|| DatabaseError::not_found("Transaction", id))?;
        status.parse().map_err(|message| {
            DatabaseError::new(DatabaseErrorKind::Unknown { message })
        })
    }

    async fn fulfill(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        transaction: &Transaction,
    ) -> Result<(), DatabaseError> {
        let product_type = transaction.product_type().ok_or_else(|| {
            DatabaseError::new(DatabaseErrorKind::Unknown {
                message: format!("unknown product type '{}'", transaction.product_type),
            })
        })?;

        match product_type {
            ProductType::Subscription => {
                let duration_days: Option<i32> = sqlx::query_scalar(
                    "SELECT duration_days FROM subscription_packages WHERE id = $1",
                )
                .bind(transaction.product_id)
                .fetch_optional(&mut **tx)
                .await
                .map_err(DatabaseError::from_sqlx)?;
                let duration_days = duration_days.ok_or_else(|| {
                    DatabaseError::not_found("SubscriptionPackage", transaction.product_id)
                })?;

                sqlx::query(
                    "INSERT INTO user_subscriptions (user_id, package_id, expires_at)
                     VALUES ($1, $2, NOW() + make_interval(days => $3))
                     ON CONFLICT (user_id) DO UPDATE
                     SET package_id = EXCLUDED.package_id,
                         expires_at = GREATEST(user_subscriptions.expires_at, NOW())
                                      + make_interval(days => $3),
                         updated_at = NOW()",
                )
                .bind(transaction.user_id)
                .bind(transaction.product_id)
                .bind(duration_days)
                .execute(&mut **tx)
                .await
                .map_err(DatabaseError::from_sqlx)?;
            }
            ProductType::ServicePackage => {
                let package: Option<(String, i32)> = sqlx::query_as(
                    "SELECT service, quantity FROM service_packages WHERE id = $1",
                )
                .bind(transaction.product_id)
                .fetch_optional(&mut **tx)
                .await
                .map_err(DatabaseError::from_sqlx)?;
                let (service, quantity) = package.ok_or_else(|| {
                    DatabaseError::not_found("ServicePackage", transaction.product_id)
                })?;

                sqlx::query(
                    "INSERT INTO user_services (user_id, service, balance)
                     VALUES ($1, $2, $3)
                     ON CONFLICT (user_id, service) DO UPDATE
                     SET balance = user_services.balance + EXCLUDED.balance,
                         updated_at = NOW()",
                )
                .bind(transaction.user_id)
                .bind(service)
                .bind(quantity)
                .execute(&mut **tx)
                .await
                .map_err(DatabaseError::from_sqlx)?;
            }
            ProductType::Gift => {
                let recipient_id = transaction.recipient_id.ok_or_else(|| {
                    DatabaseError::new(DatabaseErrorKind::Unknown {
                        message: format!("gift transaction {} has no recipient", transaction.id),
                    })
                })?;

                sqlx::query(
                    "INSERT INTO user_gifts (transaction_id, sender_id, recipient_id, gift_id)
                     VALUES ($1, $2, $3, $4)
                     ON CONFLICT (transaction_id) DO NOTHING",
                )
                .bind(transaction.id)
                .bind(transaction.user_id)
                .bind(recipient_id)
                .bind(transaction.product_id)
                .execute(&mut **tx)
                .await
                .map_err(DatabaseError::from_sqlx)?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TransactionStore for PgTransactionStore {
    async fn create(&self, new: NewTransaction) -> Result<Transaction, DatabaseError> {
        sqlx::query_as::<_, Transaction>(&format!(
            "INSERT INTO transactions
             (user_id, product_type, product_id, recipient_id, price, currency, status,
              provider, recurring, parent_id, metadata)
             VALUES ($1, $2, $3, $4, $5, $6, 'pending', $7, $8, $9, $10)
             RETURNING {}",
            TRANSACTION_COLUMNS
        ))
        .bind(new.user_id)
        .bind(new.product_type.as_str())
        .bind(new.product_id)
        .bind(new.recipient_id)
        .bind(new.price)
        .bind(new.currency)
        .bind(new.provider)
        .bind(new.recurring)
        .bind(new.parent_id)
        .bind(new.metadata)
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<Transaction>, DatabaseError> {
        sqlx::query_as::<_, Transaction>(&format!(
            "SELECT {} FROM transactions WHERE id = $1",
            TRANSACTION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn set_payment_id(&self, id: i64, payment_id: &str) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE transactions SET payment_id = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(payment_id)
            .execute(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        Ok(())
    }

    async fn merge_metadata(
        &self,
        id: i64,
        patch: serde_json::Value,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE transactions SET metadata = metadata || $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(patch)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(())
    }

    async fn complete(
        &self,
        id: i64,
        payment_id: Option<&str>,
        metadata: serde_json::Value,
    ) -> Result<TransitionOutcome, DatabaseError> {
        let mut tx = self.pool.begin().await.map_err(DatabaseError::from_sqlx)?;

        let updated = sqlx::query_as::<_, Transaction>(&format!(
            "UPDATE transactions
             SET status = 'succeeded',
                 payment_id = COALESCE($2, payment_id),
                 metadata = metadata || $3,
                 purchased_at = NOW(),
                 updated_at = NOW()
             WHERE id = $1 AND status = 'pending'
             RETURNING {}",
            TRANSACTION_COLUMNS
        ))
        .bind(id)
        .bind(payment_id)
        .bind(metadata)
        .fetch_optional(&mut *tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        let transaction = match updated {
            Some(transaction) => transaction,
            None => {
                let status = self.current_status(&mut tx, id).await?;
                tx.rollback().await.map_err(DatabaseError::from_sqlx)?;
                return Ok(TransitionOutcome::Unchanged(status));
            }
        };

        // dropping `tx` on error rolls the status flip back
        Self::fulfill(&mut tx, &transaction).await?;

        tx.commit().await.map_err(DatabaseError::from_sqlx)?;
        Ok(TransitionOutcome::Applied)
    }

    async fn cancel(
        &self,
        id: i64,
        metadata: serde_json::Value,
    ) -> Result<TransitionOutcome, DatabaseError> {
        let mut tx = self.pool.begin().await.map_err(DatabaseError::from_sqlx)?;

        let result = sqlx::query(
            "UPDATE transactions
             SET status = 'canceled', metadata = metadata || $2, updated_at = NOW()
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(id)
        .bind(metadata)
        .execute(&mut *tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        if result.rows_affected() == 0 {
            let status = self.current_status(&mut tx, id).await?;
            tx.rollback().await.map_err(DatabaseError::from_sqlx)?;
            return Ok(TransitionOutcome::Unchanged(status));
        }

        tx.commit().await.map_err(DatabaseError::from_sqlx)?;
        Ok(TransitionOutcome::Applied)
    }

    async fn find_pending(
        &self,
        created_before: DateTime<Utc>,
        created_after: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Transaction>, DatabaseError> {
        sqlx::query_as::<_, Transaction>(&format!(
            "SELECT {}
             FROM transactions
             WHERE status = 'pending'
               AND created_at <= $1
               AND created_at > $2
             ORDER BY created_at ASC
             LIMIT $3",
            TRANSACTION_COLUMNS
        ))
        .bind(created_before)
        .bind(created_after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn find_recurring_parent(
        &self,
        user_id: i64,
        package_id: i64,
        provider: &str,
    ) -> Result<Option<Transaction>, DatabaseError> {
        sqlx::query_as::<_, Transaction>(&format!(
            "SELECT {}
             FROM transactions
             WHERE user_id = $1
               AND product_type = 'subscription'
               AND product_id = $2
               AND provider = $3
               AND recurring = true
               AND parent_id IS NULL
               AND status = 'succeeded'
             ORDER BY purchased_at DESC NULLS LAST
             LIMIT 1",
            TRANSACTION_COLUMNS
        ))
        .bind(user_id)
        .bind(package_id)
        .bind(provider)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }
}
