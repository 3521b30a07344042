use chrono::{DateTime, Utc};

/// One product pulled out of a feed file, together with the decoding error
/// if the item could not be decoded.
#[derive(Debug)]
pub struct ParsingResult {
    pub product: Product,
    pub error: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl ParsingResult {
    pub fn product(product: Product) -> Self {
        Self {
            product,
            error: None,
        }
    }

    pub fn error(error: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self {
            product: Product::default(),
            error: Some(error.into()),
        }
    }
}

/// One execution of the ingestion pipeline for one shop.
///
/// A run is in flight while both `finished_at` and `is_success` are null;
/// `products_version` is assigned at start and never changes. The counters
/// stay `None` when the pipeline never reached the stage that writes them.
#[derive(Debug, Clone, PartialEq)]
pub struct Run {
    pub id: i32,
    pub shop_id: i32,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub is_success: Option<bool>,
    pub status_message: Option<String>,
    pub created_products: Option<i32>,
    pub updated_products: Option<i32>,
    pub deleted_products: Option<i32>,
    pub failed_products: Option<i32>,
    pub products_version: i64,
}

/// Product as carried through the pipeline and stored per shop.
///
/// `id` is the surrogate key and is zero until the row has been upserted;
/// `product_id` is the feed-assigned identifier, unique per shop. `version`
/// equals the `products_version` of the last run that wrote the product.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Product {
    pub id: i32,
    pub version: i64,
    pub created_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub product_id: String,
    pub title: String,
    pub description: String,
    pub url: String,
    pub image_url: String,
    pub additional_image_urls: Vec<String>,
    pub condition: String,
    pub availability: String,
    pub price: String,
    pub shippings: Vec<Shipping>,
    pub brand: Option<String>,
    pub gtin: Option<String>,
    pub mpn: Option<String>,
    pub product_category: Option<String>,
    pub product_type: Option<String>,
    pub color: Option<String>,
    pub size: Option<String>,
    pub item_group_id: Option<String>,
    pub gender: Option<String>,
    pub age_group: Option<String>,
}

/// Shipping option of a product. Shippings have no identity of their own;
/// they are rewritten wholesale whenever their product is upserted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Shipping {
    pub country: String,
    pub service: String,
    pub price: String,
}

/// Storage representation of the additional image urls list: urls joined
/// with newlines, the empty string standing for the empty list.
pub fn join_image_urls(urls: &[String]) -> String {
    urls.join("\n")
}

/// Inverse of [`join_image_urls`].
pub fn split_image_urls(joined: &str) -> Vec<String> {
    if joined.is_empty() {
        return Vec::new();
    }
    joined.split('\n').map(str::to_owned).collect()
}
