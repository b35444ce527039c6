pub mod coupons;
pub mod stock;
pub mod user_coupons;

pub use self::coupons::*;
pub use self::stock::*;
pub use self::user_coupons::*;
