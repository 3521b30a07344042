use chrono::{DateTime, Utc};
use diesel::prelude::*;

use crate::models::{Product, Run, join_image_urls};

#[derive(Insertable)]
#[diesel(table_name = crate::schema::shop)]
pub(crate) struct NewShop<'a> {
    pub url: &'a str,
}

#[derive(Debug, Queryable, Selectable)]
#[diesel(table_name = crate::schema::run)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub(crate) struct RunRow {
    pub id: i32,
    pub shop_id: i32,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub success: Option<bool>,
    pub status_message: Option<String>,
    pub created_products: Option<i32>,
    pub updated_products: Option<i32>,
    pub deleted_products: Option<i32>,
    pub failed_products: Option<i32>,
    pub products_version: i64,
}

impl From<RunRow> for Run {
    fn from(row: RunRow) -> Self {
        Run {
            id: row.id,
            shop_id: row.shop_id,
            created_at: row.created_at,
            finished_at: row.finished_at,
            is_success: row.success,
            status_message: row.status_message,
            created_products: row.created_products,
            updated_products: row.updated_products,
            deleted_products: row.deleted_products,
            failed_products: row.failed_products,
            products_version: row.products_version,
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = crate::schema::run)]
pub(crate) struct NewRun {
    pub shop_id: i32,
    pub products_version: i64,
}

/// Everything of a run that is mutable after creation. `id`, `created_at`
/// and `products_version` are never written back.
#[derive(AsChangeset)]
#[diesel(table_name = crate::schema::run)]
#[diesel(treat_none_as_null = true)]
pub(crate) struct RunChangeset<'a> {
    pub shop_id: i32,
    pub finished_at: Option<DateTime<Utc>>,
    pub success: Option<bool>,
    pub status_message: Option<&'a str>,
    pub created_products: Option<i32>,
    pub updated_products: Option<i32>,
    pub deleted_products: Option<i32>,
    pub failed_products: Option<i32>,
}

impl<'a> RunChangeset<'a> {
    pub fn from_run(run: &'a Run) -> Self {
        Self {
            shop_id: run.shop_id,
            finished_at: run.finished_at,
            success: run.is_success,
            status_message: run.status_message.as_deref(),
            created_products: run.created_products,
            updated_products: run.updated_products,
            deleted_products: run.deleted_products,
            failed_products: run.failed_products,
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = crate::schema::product)]
#[diesel(treat_none_as_default_value = false)]
pub(crate) struct ProductRow<'a> {
    pub shop_id: i32,
    pub product_id: &'a str,
    pub version: i64,
    pub deleted_at: Option<DateTime<Utc>>,
    pub title: &'a str,
    pub description: &'a str,
    pub url: &'a str,
    pub img_url: &'a str,
    pub additional_img_urls: String,
    pub condition: &'a str,
    pub availability: &'a str,
    pub price: &'a str,
    pub brand: Option<&'a str>,
    pub gtin: Option<&'a str>,
    pub mpn: Option<&'a str>,
    pub product_category: Option<&'a str>,
    pub product_type: Option<&'a str>,
    pub color: Option<&'a str>,
    pub size: Option<&'a str>,
    pub item_group_id: Option<&'a str>,
    pub gender: Option<&'a str>,
    pub age_group: Option<&'a str>,
}

impl<'a> ProductRow<'a> {
    pub fn from_product(product: &'a Product, shop_id: i32) -> Self {
        Self {
            shop_id,
            product_id: &product.product_id,
            version: product.version,
            deleted_at: product.deleted_at,
            title: &product.title,
            description: &product.description,
            url: &product.url,
            img_url: &product.image_url,
            additional_img_urls: join_image_urls(&product.additional_image_urls),
            condition: &product.condition,
            availability: &product.availability,
            price: &product.price,
            brand: product.brand.as_deref(),
            gtin: product.gtin.as_deref(),
            mpn: product.mpn.as_deref(),
            product_category: product.product_category.as_deref(),
            product_type: product.product_type.as_deref(),
            color: product.color.as_deref(),
            size: product.size.as_deref(),
            item_group_id: product.item_group_id.as_deref(),
            gender: product.gender.as_deref(),
            age_group: product.age_group.as_deref(),
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = crate::schema::shipping)]
pub(crate) struct ShippingRow<'a> {
    pub product_id: i32,
    pub country: &'a str,
    pub service: &'a str,
    pub price: &'a str,
}
