diesel::table! {
    shop (id) {
        id -> Int4,
        url -> Text,
        created_at -> Timestamptz,
        deleted_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    run (id) {
        id -> Int4,
        shop_id -> Int4,
        created_at -> Timestamptz,
        finished_at -> Nullable<Timestamptz>,
        success -> Nullable<Bool>,
        status_message -> Nullable<Text>,
        created_products -> Nullable<Int4>,
        updated_products -> Nullable<Int4>,
        deleted_products -> Nullable<Int4>,
        failed_products -> Nullable<Int4>,
        products_version -> Int8,
    }
}

diesel::table! {
    product (id) {
        id -> Int4,
        shop_id -> Int4,
        product_id -> Text,
        version -> Int8,
        created_at -> Timestamptz,
        deleted_at -> Nullable<Timestamptz>,
        title -> Text,
        description -> Text,
        url -> Text,
        img_url -> Text,
        additional_img_urls -> Text,
        condition -> Text,
        availability -> Text,
        price -> Text,
        brand -> Nullable<Text>,
        gtin -> Nullable<Text>,
        mpn -> Nullable<Text>,
        product_category -> Nullable<Text>,
        product_type -> Nullable<Text>,
        color -> Nullable<Text>,
        size -> Nullable<Text>,
        item_group_id -> Nullable<Text>,
        gender -> Nullable<Text>,
        age_group -> Nullable<Text>,
    }
}

diesel::table! {
    shipping (id) {
        id -> Int4,
        product_id -> Int4,
        country -> Text,
        service -> Text,
        price -> Text,
    }
}

diesel::joinable!(run -> shop (shop_id));
diesel::joinable!(product -> shop (shop_id));
diesel::joinable!(shipping -> product (product_id));

diesel::allow_tables_to_appear_in_same_query!(shop, run, product, shipping);
