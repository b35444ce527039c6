//! Coupons keeps the redis stock mirror of coupons in sync with the db.
//! This create is for running the service from `coupons_lib`. See `coupons_lib` for details.

extern crate coupons_lib;
extern crate env_logger;
#[macro_use]
extern crate log;

use std::process;

fn main() {
    // Prepare logger
    env_logger::init();

    let config = coupons_lib::config::Config::new().expect("Can't load app config!");

    // Prepare sentry integration
    let _sentry = coupons_lib::sentry_integration::init(config.sentry.as_ref());

    if let Err(e) = coupons_lib::start_stock_keeper(config) {
        error!("Coupons stock keeper stopped: {:?}", e);
        process::exit(1);
    }
}
