use diesel::connection::AnsiTransactionManager;
use diesel::pg::Pg;
use diesel::Connection;

use repos::*;

pub trait ReposFactory<C: Connection<Backend = Pg, TransactionManager = AnsiTransactionManager> + 'static>: Clone + Send + 'static {
    fn create_coupons_repo<'a>(&self, db_conn: &'a C) -> Box<CouponsRepo + 'a>;
    fn create_user_coupons_repo<'a>(&self, db_conn: &'a C) -> Box<UserCouponsRepo + 'a>;
}

#[derive(Clone, Default)]
pub struct ReposFactoryImpl;

impl<C: Connection<Backend = Pg, TransactionManager = AnsiTransactionManager> + 'static> ReposFactory<C> for ReposFactoryImpl {
    fn create_coupons_repo<'a>(&self, db_conn: &'a C) -> Box<CouponsRepo + 'a> {
        Box::new(CouponsRepoImpl::new(db_conn)) as Box<CouponsRepo>
    }
    fn create_user_coupons_repo<'a>(&self, db_conn: &'a C) -> Box<UserCouponsRepo + 'a> {
        Box::new(UserCouponsRepoImpl::new(db_conn)) as Box<UserCouponsRepo>
    }
}
