//! Models contains all structures that are used in different
//! modules of the app

pub mod coupons;
pub mod types;

pub use self::coupons::*;
pub use self::types::*;
