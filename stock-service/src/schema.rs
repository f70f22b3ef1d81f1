diesel::table! {
    warehouses (id) {
        id -> Uuid,
        name -> Varchar,
        priority -> Int4,
        is_active -> Bool,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    stock_items (id) {
        id -> Uuid,
        product_id -> Uuid,
        variation_id -> Nullable<Uuid>,
        warehouse_id -> Uuid,
        sku -> Nullable<Varchar>,
        available_quantity -> Int4,
        reserved_quantity -> Int4,
        in_transit_quantity -> Int4,
        damaged_quantity -> Int4,
        minimum_level -> Nullable<Int4>,
        maximum_level -> Nullable<Int4>,
        expiry_date -> Nullable<Timestamptz>,
        batch_number -> Nullable<Varchar>,
        is_active -> Bool,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    reservations (id) {
        id -> Uuid,
        stock_item_id -> Uuid,
        cart_id -> Nullable<Uuid>,
        order_id -> Nullable<Uuid>,
        customer_id -> Nullable<Uuid>,
        reserved_quantity -> Int4,
        status -> Varchar,
        reservation_type -> Varchar,
        reserved_at -> Timestamptz,
        expires_at -> Nullable<Timestamptz>,
        released_at -> Nullable<Timestamptz>,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    idempotent_requests (key, subject_id) {
        key -> Varchar,
        subject_id -> Varchar,
        request_hash -> Nullable<Varchar>,
        locked_until -> Nullable<Timestamptz>,
        expires_on -> Nullable<Timestamptz>,
        response_body -> Nullable<Jsonb>,
        status_code -> Nullable<Int2>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    outbox_messages (id) {
        id -> Uuid,
        message_id -> Uuid,
        event_type -> Varchar,
        content -> Jsonb,
        destination -> Nullable<Varchar>,
        occurred_on -> Timestamptz,
        processed -> Bool,
        processed_on -> Nullable<Timestamptz>,
        locked_by -> Nullable<Varchar>,
        locked_at -> Nullable<Timestamptz>,
        retry_count -> Int4,
    }
}

diesel::table! {
    inbox_messages (message_id) {
        message_id -> Varchar,
        message_type -> Varchar,
        content -> Jsonb,
        consumer -> Nullable<Varchar>,
        status -> Varchar,
        received_at -> Timestamptz,
        processed_on -> Nullable<Timestamptz>,
    }
}

diesel::joinable!(stock_items -> warehouses (warehouse_id));
diesel::joinable!(reservations -> stock_items (stock_item_id));

diesel::allow_tables_to_appear_in_same_query!(
    warehouses,
    stock_items,
    reservations,
    idempotent_requests,
    outbox_messages,
    inbox_messages,
);
