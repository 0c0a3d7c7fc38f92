//! Type-safe cache key builders

use std::fmt;

pub const VERSION: &str = "v1";

pub mod pricing {
    use super::*;

    pub const NAMESPACE: &str = "pricing";

    /// Which gendered price table a package price comes from.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum PriceKind {
        Subscription,
        Recurring,
        ServicePackage,
    }

    impl PriceKind {
        fn as_str(&self) -> &'static str {
            match self {
                PriceKind::Subscription => "subscription",
                PriceKind::Recurring => "recurring",
                PriceKind::ServicePackage => "service_package",
            }
        }
    }

    #[derive(Debug, Clone)]
    pub struct PackagePriceKey {
        pub kind: PriceKind,
        pub package_id: i64,
        pub gender: String,
    }

    impl PackagePriceKey {
        pub fn new(kind: PriceKind, package_id: i64, gender: impl Into<String>) -> Self {
            Self {
                kind,
                package_id,
                gender: gender.into(),
            }
        }
    }

    impl fmt::Display for PackagePriceKey {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(
                f,
                "{}:{}:{}:{}:{}",
                VERSION,
                NAMESPACE,
                self.kind.as_str(),
                self.package_id,
                self.gender
            )
        }
    }

    #[derive(Debug, Clone)]
    pub struct GiftPriceKey {
        pub gift_id: i64,
    }

    impl GiftPriceKey {
        pub fn new(gift_id: i64) -> Self {
            Self { gift_id }
        }
    }

    impl fmt::Display for GiftPriceKey {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}:{}:gift:{}", VERSION, NAMESPACE, self.gift_id)
        }
    }

    #[derive(Debug, Clone)]
    pub struct BannerKey {
        pub banner_id: i64,
    }

    impl BannerKey {
        pub fn new(banner_id: i64) -> Self {
            Self { banner_id }
        }
    }

    impl fmt::Display for BannerKey {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}:{}:banner:{}", VERSION, NAMESPACE, self.banner_id)
        }
    }
}
