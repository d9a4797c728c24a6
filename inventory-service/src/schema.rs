diesel::table! {
    variants (id) {
        id -> Uuid,
        stock -> Int4,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    processed_commands (idempotency_key) {
        idempotency_key -> Varchar,
        command_id -> Uuid,
        reply -> Jsonb,
        processed_at -> Timestamptz,
    }
}

diesel::table! {
    reservations (id) {
        id -> Uuid,
        order_id -> Uuid,
        variant_id -> Uuid,
        quantity -> Int4,
        status -> Varchar,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    variants,
    processed_commands,
    reservations,
);
