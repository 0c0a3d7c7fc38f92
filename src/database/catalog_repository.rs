//! Read-only price reference data

use crate::database::error::DatabaseError;
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
}

impl Gender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Gender::Male => "male",
            Gender::Female => "female",
        }
    }
}

impl fmt::Display for Gender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Gender {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "male" | "m" => Ok(Gender::Male),
            "female" | "f" => Ok(Gender::Female),
            other => Err(format!("unknown gender '{}'", other)),
        }
    }
}

/// Promotional banner granting a percentage discount while active.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct Banner {
    pub id: i64,
    pub discount_percent: i32,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
}

impl Banner {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        let started = self.starts_at.map_or(true, |start| start <= now);
        let not_ended = self.ends_at.map_or(true, |end| now < end);
        started && not_ended && (1..=100).contains(&self.discount_percent)
    }
}

#[async_trait]
pub trait PriceCatalog: Send + Sync {
    /// `None` when the user does not exist.
    async fn user_gender(&self, user_id: i64) -> Result<Option<Gender>, DatabaseError>;

    async fn subscription_price(
        &self,
        package_id: i64,
        gender: Gender,
    ) -> Result<Option<BigDecimal>, DatabaseError>;

    async fn recurring_price(
        &self,
        package_id: i64,
        gender: Gender,
    ) -> Result<Option<BigDecimal>, DatabaseError>;

    async fn service_package_price(
        &self,
        package_id: i64,
        gender: Gender,
    ) -> Result<Option<BigDecimal>, DatabaseError>;

    async fn gift_price(&self, gift_id: i64) -> Result<Option<BigDecimal>, DatabaseError>;

    async fn banner(&self, banner_id: i64) -> Result<Option<Banner>, DatabaseError>;
}

pub struct PgPriceCatalog {
    pool: PgPool,
}

impl PgPriceCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn gendered_price(
        &self,
        table: PriceTable,
        package_id: i64,
        gender: Gender,
    ) -> Result<Option<BigDecimal>, DatabaseError> {
        sqlx::query_scalar::<_, BigDecimal>(&format!(
            "SELECT price FROM {} WHERE package_id = $1 AND gender = $2",
            table.as_str()
        ))
        .bind(package_id)
        .bind(gender.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }
}

#[derive(Debug, Clone, Copy)]
enum PriceTable {
    Subscription,
    Recurring,
    ServicePackage,
}

impl PriceTable {
    fn as_str(&self) -> &'static str {
        match self {
            PriceTable::Subscription => "subscription_prices",
            PriceTable::Recurring => "recurring_prices",
            PriceTable::ServicePackage => "service_package_prices",
        }
    }
}

#[async_trait]
impl PriceCatalog for PgPriceCatalog {
    async fn user_gender(&self, user_id: i64) -> Result<Option<Gender>, DatabaseError> {
        let gender: Option<String> = sqlx::query_scalar("SELECT gender FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        // unknown or empty gender prices as male, matching the catalog's base rows
        Ok(gender.map(|g| g.parse().unwrap_or(Gender::Male)))
    }

    async fn subscription_price(
        &self,
        package_id: i64,
        gender: Gender,
    ) -> Result<Option<BigDecimal>, DatabaseError> {
        self.gendered_price(PriceTable::Subscription, package_id, gender)
            .await
    }

    async fn recurring_price(
        &self,
        package_id: i64,
        gender: Gender,
    ) -> Result<Option<BigDecimal>, DatabaseError> {
        self.gendered_price(PriceTable::Recurring, package_id, gender)
            .await
    }

    async fn service_package_price(
        &self,
        package_id: i64,
        gender: Gender,
    ) -> Result<Option<BigDecimal>, DatabaseError> {
        self.gendered_price(PriceTable::ServicePackage, package_id, gender)
            .await
    }

    async fn gift_price(&self, gift_id: i64) -> Result<Option<BigDecimal>, DatabaseError> {
        sqlx::query_scalar::<_, BigDecimal>("SELECT price FROM gifts WHERE id = $1")
            .bind(gift_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)
    }

    async fn banner(&self, banner_id: i64) -> Result<Option<Banner>, DatabaseError> {
        sqlx::query_as::<_, Banner>(
            "SELECT id, discount_percent, starts_at, ends_at FROM banners WHERE id = $1",
        )
        .bind(banner_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }
}
