//! Id newtypes shared by the durable models and the cache mirror
use std::fmt;
use std::io::Write;

use diesel::deserialize::{self, FromSql};
use diesel::pg::Pg;
use diesel::serialize::{self, Output, ToSql};
use diesel::sql_types::Integer;

integer_id!(CouponId);
integer_id!(UserId);
integer_id!(UserCouponId);
integer_id!(StoreId);
