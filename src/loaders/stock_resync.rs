//! Periodic resync of the stock mirror of every active coupon
use std::time::{Duration, Instant};

use failure::{Error as FailureError, Fail};
use futures::{future, Future, Stream};
use tokio::timer::Interval;

use models::SyncSummary;
use sentry_integration;
use services::StockSyncService;

/// Runs one resync round. Failures are reported and never stop the caller.
pub fn resync_once<S: StockSyncService>(service: &S) -> impl Future<Item = Option<SyncSummary>, Error = FailureError> {
    info!("Started resync of coupon stock");
    service.sync_all_active_coupons().then(|res| {
        let summary = match res {
            Ok(summary) => {
                info!(
                    "Finished resync of coupon stock: {} synced, {} failed",
                    summary.synced, summary.failed
                );
                Some(summary)
            }
            Err(err) => {
                let err = FailureError::from(err.context("An error occurred while resyncing coupon stock"));
                sentry_integration::report(&err);
                None
            }
        };
        future::ok::<_, FailureError>(summary)
    })
}

/// Resyncs coupon stock every `interval` starting after the first tick
pub fn run<S: StockSyncService + 'static>(service: S, interval: Duration) -> impl Future<Item = (), Error = FailureError> {
    Interval::new(Instant::now() + interval, interval)
        .map_err(FailureError::from)
        .fold(service, |service, _| {
            let round = resync_once(&service);
            round.map(move |_| service)
        })
        .map(|_| ())
}
