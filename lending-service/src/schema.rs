diesel::table! {
    items (id) {
        id -> Uuid,
        title -> Varchar,
        author -> Varchar,
        category -> Varchar,
        available_quantity -> Int4,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    ledger_entries (id) {
        id -> Int8,
        user_id -> Uuid,
        item_id -> Uuid,
        quantity -> Int4,
        kind -> Varchar,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    pending_selections (user_id, item_id) {
        user_id -> Uuid,
        item_id -> Uuid,
        quantity -> Int4,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::joinable!(ledger_entries -> items (item_id));
diesel::joinable!(pending_selections -> items (item_id));

diesel::allow_tables_to_appear_in_same_query!(
    items,
    ledger_entries,
    pending_selections,
);
