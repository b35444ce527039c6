use diesel::result::{DatabaseErrorKind, Error as DieselError};
use failure::{Context, Error as FailureError, Fail};

/// Error kinds attached as context to `failure::Error` values, so the
/// upstream controller can translate them to http status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Fail)]
pub enum Error {
    #[fail(display = "Not found")]
    NotFound,
    #[fail(display = "Coupon has already been issued to this user")]
    AlreadyIssued,
    #[fail(display = "Coupon is out of stock")]
    OutOfStock,
    #[fail(display = "Coupon code is already taken in this store")]
    CouponCodeTaken,
    #[fail(display = "Coupon is not active")]
    CouponNotActive,
    #[fail(display = "Coupon issuance has not started yet")]
    NotStarted,
    #[fail(display = "Coupon has expired")]
    Expired,
    #[fail(display = "Timed out waiting for coupon lock")]
    LockTimeout,
    #[fail(display = "Service is temporarily unavailable")]
    ServiceUnavailable,
    #[fail(display = "R2D2 connection error")]
    Connection,
    #[fail(display = "Database error")]
    Database,
}

impl Error {
    /// Http status code the controller layer should answer with
    pub fn code(&self) -> u16 {
        match *self {
            Error::NotFound => 404,
            Error::AlreadyIssued | Error::OutOfStock | Error::CouponCodeTaken => 409,
            Error::CouponNotActive | Error::NotStarted | Error::Expired => 400,
            Error::LockTimeout | Error::ServiceUnavailable => 503,
            Error::Connection | Error::Database => 500,
        }
    }
}

impl<'a> From<&'a DieselError> for Error {
    fn from(e: &DieselError) -> Self {
        match *e {
            DieselError::NotFound => Error::NotFound,
            DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => Error::AlreadyIssued,
            _ => Error::Database,
        }
    }
}

/// Wraps a diesel error with the matching kind
pub fn diesel_error(e: DieselError) -> FailureError {
    let kind = Error::from(&e);
    e.context(kind).into()
}

/// Wraps a diesel error of coupon insert, the only unique key there is (code, store_id)
pub fn coupon_create_error(e: DieselError) -> FailureError {
    match e {
        DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => e.context(Error::CouponCodeTaken).into(),
        e => diesel_error(e),
    }
}

/// Finds the first error kind in the cause chain
pub fn error_kind(err: &FailureError) -> Option<Error> {
    err.iter_chain()
        .filter_map(|cause| {
            cause
                .downcast_ref::<Context<Error>>()
                .map(|context| *context.get_context())
                .or_else(|| cause.downcast_ref::<Error>().cloned())
        }).next()
}
