pub mod coupons;
pub mod user_coupons;

pub use self::coupons::*;
pub use self::user_coupons::*;
