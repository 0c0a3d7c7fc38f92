//! Price resolution for purchasable products
//!
//! Prices depend on the buyer's gender (except gifts) and on an optional
//! promotional banner. Recurring subscriptions use their own fixed table and
//! never get banner discounts.

use crate::cache::cache::Cache;
use crate::cache::keys::pricing::{BannerKey, GiftPriceKey, PackagePriceKey, PriceKind};
use crate::cache::RedisCache;
use crate::database::catalog_repository::{Banner, Gender, PriceCatalog};
use crate::database::error::DatabaseError;
use crate::database::transaction::ProductType;
use crate::error::{AppError, AppErrorKind, DomainError};
use bigdecimal::{BigDecimal, RoundingMode, Zero};
use chrono::Utc;
use serde::Serialize;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Product {
    Subscription { package_id: i64, recurring: bool },
    ServicePackage { package_id: i64 },
    Gift { gift_id: i64, recipient_id: i64 },
}

impl Product {
    pub fn product_type(&self) -> ProductType {
        match self {
            Product::Subscription { .. } => ProductType::Subscription,
            Product::ServicePackage { .. } => ProductType::ServicePackage,
            Product::Gift { .. } => ProductType::Gift,
        }
    }

    pub fn product_id(&self) -> i64 {
        match self {
            Product::Subscription { package_id, .. } => *package_id,
            Product::ServicePackage { package_id } => *package_id,
            Product::Gift { gift_id, .. } => *gift_id,
        }
    }

    pub fn recipient_id(&self) -> Option<i64> {
        match self {
            Product::Gift { recipient_id, .. } => Some(*recipient_id),
            _ => None,
        }
    }

    pub fn is_recurring(&self) -> bool {
        matches!(self, Product::Subscription { recurring: true, .. })
    }

    fn describe(&self) -> String {
        match self {
            Product::Subscription {
                package_id,
                recurring: true,
            } => format!("recurring subscription package {}", package_id),
            Product::Subscription { package_id, .. } => {
                format!("subscription package {}", package_id)
            }
            Product::ServicePackage { package_id } => format!("service package {}", package_id),
            Product::Gift { gift_id, .. } => format!("gift {}", gift_id),
        }
    }
}

/// Final charge for one purchase.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Quote {
    pub base_price: BigDecimal,
    pub amount: BigDecimal,
    pub discount_percent: Option<i32>,
    pub banner_id: Option<i64>,
    pub gender: Option<Gender>,
}

#[derive(Debug, Error)]
pub enum PricingError {
    #[error("user {0} not found")]
    UserNotFound(i64),

    #[error("no price configured for {0}")]
    PriceNotFound(String),

    #[error("invalid amount {amount}: {reason}")]
    InvalidAmount { amount: String, reason: String },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl From<PricingError> for AppError {
    fn from(err: PricingError) -> Self {
        match err {
            PricingError::UserNotFound(user_id) => {
                AppError::new(AppErrorKind::Domain(DomainError::UserNotFound { user_id }))
            }
            PricingError::PriceNotFound(product) => {
                AppError::new(AppErrorKind::Domain(DomainError::PriceNotFound { product }))
            }
            PricingError::InvalidAmount { amount, reason } => {
                AppError::new(AppErrorKind::Domain(DomainError::InvalidAmount { amount, reason }))
            }
            PricingError::Database(e) => e.into(),
        }
    }
}

pub type PricingResult<T> = Result<T, PricingError>;

/// `price * (100 - percent) / 100`, rounded half-up to kopecks.
pub fn apply_discount(price: &BigDecimal, percent: i32) -> BigDecimal {
    let percent = percent.clamp(0, 100);
    let factor = BigDecimal::from(100 - percent) / BigDecimal::from(100);
    (price * factor).with_scale_round(2, RoundingMode::HalfUp)
}

pub struct PricingService {
    catalog: Arc<dyn PriceCatalog>,
    cache: Option<RedisCache>,
    cache_ttl: Duration,
}

impl PricingService {
    pub fn new(catalog: Arc<dyn PriceCatalog>) -> Self {
        Self {
            catalog,
            cache: None,
            cache_ttl: Duration::from_secs(600),
        }
    }

    /// Enable caching of reference prices
    pub fn with_cache(mut self, cache: RedisCache, ttl: Duration) -> Self {
        self.cache = Some(cache);
        self.cache_ttl = ttl;
        self
    }

    pub async fn quote(
        &self,
        user_id: i64,
        product: &Product,
        banner_id: Option<i64>,
    ) -> PricingResult<Quote> {
        let (base_price, gender, discountable) = match product {
            Product::Subscription {
                package_id,
                recurring,
            } => {
                let gender = self.gender(user_id).await?;
                let kind = if *recurring {
                    PriceKind::Recurring
                } else {
                    PriceKind::Subscription
                };
                let price = self.package_price(kind, *package_id, gender).await?;
                (price, Some(gender), !*recurring)
            }
            Product::ServicePackage { package_id } => {
                let gender = self.gender(user_id).await?;
                let price = self
                    .package_price(PriceKind::ServicePackage, *package_id, gender)
                    .await?;
                (price, Some(gender), true)
            }
            Product::Gift { gift_id, .. } => (self.gift_price(*gift_id).await?, None, true),
        };

        let base_price =
            base_price.ok_or_else(|| PricingError::PriceNotFound(product.describe()))?;

        let banner = match (discountable, banner_id) {
            (true, Some(id)) => self.active_banner(id).await?,
            _ => None,
        };

        let amount = match &banner {
            Some(banner) => apply_discount(&base_price, banner.discount_percent),
            None => base_price.with_scale_round(2, RoundingMode::HalfUp),
        };

        if amount <= BigDecimal::zero() {
            return Err(PricingError::InvalidAmount {
                amount: amount.to_string(),
                reason: "price must be positive".to_string(),
            });
        }

        debug!(
            user_id,
            product = %product.describe(),
            base_price = %base_price,
            amount = %amount,
            banner_id = ?banner.as_ref().map(|b| b.id),
            "price resolved"
        );

        Ok(Quote {
            base_price,
            amount,
            discount_percent: banner.as_ref().map(|b| b.discount_percent),
            banner_id: banner.as_ref().map(|b| b.id),
            gender,
        })
    }

    async fn gender(&self, user_id: i64) -> PricingResult<Gender> {
        self.catalog
            .user_gender(user_id)
            .await?
            .ok_or(PricingError::UserNotFound(user_id))
    }

    async fn package_price(
        &self,
        kind: PriceKind,
        package_id: i64,
        gender: Gender,
    ) -> PricingResult<Option<BigDecimal>> {
        let key = PackagePriceKey::new(kind, package_id, gender.as_str()).to_string();
        if let Some(price) = self.cached_price(&key).await {
            return Ok(Some(price));
        }

        let price = match kind {
            PriceKind::Subscription => self.catalog.subscription_price(package_id, gender).await?,
            PriceKind::Recurring => self.catalog.recurring_price(package_id, gender).await?,
            PriceKind::ServicePackage => {
                self.catalog
                    .service_package_price(package_id, gender)
                    .await?
            }
        };

        if let Some(price) = &price {
            self.store_price(&key, price).await;
        }
        Ok(price)
    }

    async fn gift_price(&self, gift_id: i64) -> PricingResult<Option<BigDecimal>> {
        let key = GiftPriceKey::new(gift_id).to_string();
        if let Some(price) = self.cached_price(&key).await {
            return Ok(Some(price));
        }

        let price = self.catalog.gift_price(gift_id).await?;
        if let Some(price) = &price {
            self.store_price(&key, price).await;
        }
        Ok(price)
    }

    async fn active_banner(&self, banner_id: i64) -> PricingResult<Option<Banner>> {
        let key = BannerKey::new(banner_id).to_string();
        let cached: Option<Banner> = match &self.cache {
            Some(cache) => cache.get(&key).await.ok().flatten(),
            None => None,
        };

        let banner = match cached {
            Some(banner) => Some(banner),
            None => {
                let banner = self.catalog.banner(banner_id).await?;
                if let (Some(cache), Some(banner)) = (&self.cache, &banner) {
                    if let Err(e) = cache.set(&key, banner, Some(self.cache_ttl)).await {
                        warn!(key = %key, error = %e, "failed to cache banner");
                    }
                }
                banner
            }
        };

        match banner {
            Some(banner) if banner.is_active(Utc::now()) => Ok(Some(banner)),
            Some(_) => {
                warn!(banner_id, "banner is outside its window, ignoring discount");
                Ok(None)
            }
            None => {
                warn!(banner_id, "banner not found, ignoring discount");
                Ok(None)
            }
        }
    }

    async fn cached_price(&self, key: &str) -> Option<BigDecimal> {
        let cache = self.cache.as_ref()?;
        let raw: Option<String> = cache.get(key).await.ok().flatten();
        raw.and_then(|raw| BigDecimal::from_str(&raw).ok())
    }

    async fn store_price(&self, key: &str, price: &BigDecimal) {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.set(key, &price.to_string(), Some(self.cache_ttl)).await {
                warn!(key, error = %e, "failed to cache price");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;

    fn dec(value: &str) -> BigDecimal {
        BigDecimal::from_str(value).expect("valid decimal")
    }

    #[derive(Default)]
    struct StaticCatalog {
        genders: HashMap<i64, Gender>,
        subscriptions: HashMap<(i64, Gender), BigDecimal>,
        recurring: HashMap<(i64, Gender), BigDecimal>,
        services: HashMap<(i64, Gender), BigDecimal>,
        gifts: HashMap<i64, BigDecimal>,
        banners: HashMap<i64, Banner>,
    }

    #[async_trait]
    impl PriceCatalog for StaticCatalog {
        async fn user_gender(&self, user_id: i64) -> Result<Option<Gender>, DatabaseError> {
            Ok(self.genders.get(&user_id).copied())
        }

        async fn subscription_price(
            &self,
            package_id: i64,
            gender: Gender,
        ) -> Result<Option<BigDecimal>, DatabaseError> {
            Ok(self.subscriptions.get(&(package_id, gender)).cloned())
        }

        async fn recurring_price(
            &self,
            package_id: i64,
            gender: Gender,
        ) -> Result<Option<BigDecimal>, DatabaseError> {
            Ok(self.recurring.get(&(package_id, gender)).cloned())
        }

        async fn service_package_price(
            &self,
            package_id: i64,
            gender: Gender,
        ) -> Result<Option<BigDecimal>, DatabaseError> {
            Ok(self.services.get(&(package_id, gender)).cloned())
        }

        async fn gift_price(&self, gift_id: i64) -> Result<Option<BigDecimal>, DatabaseError> {
            Ok(self.gifts.get(&gift_id).cloned())
        }

        async fn banner(&self, banner_id: i64) -> Result<Option<Banner>, DatabaseError> {
            Ok(self.banners.get(&banner_id).cloned())
        }
    }

    fn service() -> PricingService {
        let mut catalog = StaticCatalog::default();
        catalog.genders.insert(1, Gender::Male);
        catalog.genders.insert(2, Gender::Female);
        catalog.subscriptions.insert((10, Gender::Male), dec("499.00"));
        catalog.subscriptions.insert((10, Gender::Female), dec("199.00"));
        catalog.recurring.insert((10, Gender::Male), dec("449.00"));
        catalog.services.insert((20, Gender::Male), dec("99.90"));
        catalog.gifts.insert(30, dec("50.00"));
        catalog.banners.insert(
            5,
            Banner {
                id: 5,
                discount_percent: 15,
                starts_at: None,
                ends_at: None,
            },
        );
        catalog.banners.insert(
            6,
            Banner {
                id: 6,
                discount_percent: 50,
                starts_at: None,
                ends_at: Some(Utc::now() - chrono::Duration::days(1)),
            },
        );
        PricingService::new(Arc::new(catalog))
    }

    #[test]
    fn discount_rounds_half_up_to_two_places() {
        assert_eq!(apply_discount(&dec("499.00"), 15), dec("424.15"));
        assert_eq!(apply_discount(&dec("99.90"), 15), dec("84.92"));
        assert_eq!(apply_discount(&dec("0.05"), 50), dec("0.03"));
        assert_eq!(apply_discount(&dec("100"), 0), dec("100.00"));
    }

    #[tokio::test]
    async fn subscription_price_depends_on_gender() {
        let service = service();
        let product = Product::Subscription {
            package_id: 10,
            recurring: false,
        };
        let male = service.quote(1, &product, None).await.expect("priced");
        let female = service.quote(2, &product, None).await.expect("priced");
        assert_eq!(male.amount, dec("499.00"));
        assert_eq!(female.amount, dec("199.00"));
        assert_eq!(female.gender, Some(Gender::Female));
    }

    #[tokio::test]
    async fn active_banner_discounts_one_off_purchases() {
        let quote = service()
            .quote(1, &Product::ServicePackage { package_id: 20 }, Some(5))
            .await
            .expect("priced");
        assert_eq!(quote.amount, dec("84.92"));
        assert_eq!(quote.discount_percent, Some(15));
        assert_eq!(quote.banner_id, Some(5));
    }

    #[tokio::test]
    async fn recurring_subscription_ignores_banner() {
        let quote = service()
            .quote(
                1,
                &Product::Subscription {
                    package_id: 10,
                    recurring: true,
                },
                Some(5),
            )
            .await
            .expect("priced");
        assert_eq!(quote.amount, dec("449.00"));
        assert_eq!(quote.discount_percent, None);
    }

    #[tokio::test]
    async fn expired_or_missing_banner_is_ignored() {
        let service = service();
        let gift = Product::Gift {
            gift_id: 30,
            recipient_id: 2,
        };
        let expired = service.quote(1, &gift, Some(6)).await.expect("priced");
        assert_eq!(expired.amount, dec("50.00"));
        let missing = service.quote(1, &gift, Some(404)).await.expect("priced");
        assert_eq!(missing.amount, dec("50.00"));
        assert_eq!(missing.gender, None);
    }

    #[tokio::test]
    async fn unknown_package_or_user_is_an_error() {
        let service = service();
        let err = service
            .quote(1, &Product::ServicePackage { package_id: 99 }, None)
            .await
            .expect_err("no price");
        assert!(matches!(err, PricingError::PriceNotFound(_)));
        assert_eq!(AppError::from(err).status_code(), 404);

        let err = service
            .quote(777, &Product::ServicePackage { package_id: 20 }, None)
            .await
            .expect_err("no user");
        assert!(matches!(err, PricingError::UserNotFound(777)));
    }
}
