//! Repos is a module responsible for interacting with postgres db
//! and the redis stock mirror
pub mod coupon_stock;
pub mod coupons;
pub mod repo_factory;
pub mod types;

pub use self::coupon_stock::*;
pub use self::coupons::*;
pub use self::repo_factory::*;
pub use self::types::*;
