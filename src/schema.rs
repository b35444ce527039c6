table! {
    coupons (id) {
        id -> Int4,
        code -> Varchar,
        title -> Varchar,
        store_id -> Int4,
        percent -> Int4,
        issue_limit -> Int4,
        issued_count -> Int4,
        valid_from -> Timestamp,
        valid_until -> Timestamp,
        is_active -> Bool,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

table! {
    user_coupons (id) {
        id -> Int4,
        coupon_id -> Int4,
        user_id -> Int4,
        is_used -> Bool,
        issued_at -> Timestamp,
        used_at -> Nullable<Timestamp>,
    }
}

joinable!(user_coupons -> coupons (coupon_id));

allow_tables_to_appear_in_same_query!(coupons, user_coupons);
