pub mod stock_resync;

pub use self::stock_resync::*;
