diesel::table! {
    products (id) {
        id -> Int8,
        sku -> Varchar,
        name -> Varchar,
        price_cents -> Int8,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    inventory (product_id) {
        product_id -> Int8,
        available -> Int4,
        reserved -> Int4,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    orders (id) {
        id -> Int8,
        user_id -> Int8,
        total_cents -> Int8,
        status -> Varchar,
        idempotency_key -> Nullable<Varchar>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    order_items (id) {
        id -> Int8,
        order_id -> Int8,
        product_id -> Int8,
        quantity -> Int4,
        unit_price_cents -> Int8,
    }
}

diesel::table! {
    payments (id) {
        id -> Int8,
        order_id -> Int8,
        status -> Varchar,
        provider_tx_id -> Nullable<Varchar>,
        amount_cents -> Int8,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    processed_events (event_id) {
        event_id -> Uuid,
        event_type -> Varchar,
        processed_at -> Timestamptz,
    }
}

diesel::table! {
    outbox_events (id) {
        id -> Int8,
        order_id -> Int8,
        event_type -> Varchar,
        payload -> Jsonb,
        published -> Bool,
        created_at -> Timestamptz,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    products,
    inventory,
    orders,
    order_items,
    payments,
    processed_events,
    outbox_events,
);
