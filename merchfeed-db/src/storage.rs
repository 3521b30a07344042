use std::collections::HashMap;

use chrono::Utc;
use diesel::prelude::*;
use diesel::sql_types::Text;
use diesel::upsert::excluded;
use diesel_async::pooled_connection::deadpool::PoolError;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use miette::Diagnostic;
use thiserror::Error;

use crate::models::{Product, Run};
use crate::pool::ConnectionPool;
use crate::rows::{NewRun, NewShop, ProductRow, RunChangeset, RunRow, ShippingRow};
use crate::schema::product::dsl as product_dsl;
use crate::schema::run::dsl as run_dsl;
use crate::schema::shipping::dsl as shipping_dsl;
use crate::schema::shop::dsl as shop_dsl;

#[derive(Debug, Error, Diagnostic)]
pub enum StorageError {
    #[error("parsing already running for this shop")]
    AlreadyRunning,

    #[error("can't get database connection")]
    Pool(#[from] PoolError),

    #[error("run does not exist")]
    RunNotFound,

    #[error("can't query database")]
    Query(#[from] diesel::result::Error),
}

/// Postgres-backed storage for shops, runs, products and shippings.
///
/// Every operation takes one pooled connection for the lifetime of its
/// transaction.
#[derive(Clone)]
pub struct Postgres {
    pool: ConnectionPool,
}

impl Postgres {
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    /// Creates a new unfinished run for the shop at `shop_url`, creating the
    /// shop on first sight.
    ///
    /// Fails with [`StorageError::AlreadyRunning`] while the shop's latest
    /// run is still in flight. An advisory lock on the url keeps two
    /// concurrent starters for the same shop from both passing the check.
    pub async fn start_run(&self, shop_url: &str, version: i64) -> Result<Run, StorageError> {
        let mut conn = self.pool.get().await?;
        let shop_url = shop_url.to_owned();

        conn.transaction::<Run, StorageError, _>(|conn| {
            async move {
                diesel::sql_query("SELECT pg_advisory_xact_lock(hashtext($1))")
                    .bind::<Text, _>(shop_url.clone())
                    .execute(conn)
                    .await?;

                let shop_id = get_or_create_shop(conn, &shop_url).await?;

                let last_run = run_dsl::run
                    .filter(run_dsl::shop_id.eq(shop_id))
                    .order(run_dsl::created_at.desc())
                    .select(RunRow::as_select())
                    .first(conn)
                    .await
                    .optional()?;

                if let Some(last_run) = last_run
                    && last_run.finished_at.is_none()
                    && last_run.success.is_none()
                {
                    return Err(StorageError::AlreadyRunning);
                }

                let new_run = NewRun {
                    shop_id,
                    products_version: version,
                };
                let row: RunRow = diesel::insert_into(run_dsl::run)
                    .values(&new_run)
                    .returning(RunRow::as_returning())
                    .get_result(conn)
                    .await?;

                Ok(row.into())
            }
            .scope_boxed()
        })
        .await
    }

    /// Marks `run` as finished, writing back its outcome and counters.
    pub async fn finish_run(&self, run: &Run) -> Result<(), StorageError> {
        let mut conn = self.pool.get().await?;

        let updated = diesel::update(run_dsl::run.filter(run_dsl::id.eq(run.id)))
            .set(&RunChangeset::from_run(run))
            .execute(&mut conn)
            .await?;

        if updated == 0 {
            return Err(StorageError::RunNotFound);
        }

        Ok(())
    }

    /// Upserts one batch of parsed products and rewrites their shippings.
    /// Returns how many products were new and how many were updated.
    ///
    /// Products whose stored version is not older than the incoming one are
    /// skipped entirely, so a late or replayed run never downgrades a row
    /// and a repeated delivery causes no shipping churn.
    pub async fn update_products(
        &self,
        products: Vec<Product>,
        shop_id: i32,
    ) -> Result<(i32, i32), StorageError> {
        let mut conn = self.pool.get().await?;

        conn.transaction::<(i32, i32), StorageError, _>(|conn| {
            async move {
                let stored_versions: HashMap<String, i64> = {
                    let product_ids: Vec<&str> =
                        products.iter().map(|p| p.product_id.as_str()).collect();
                    product_dsl::product
                        .filter(product_dsl::shop_id.eq(shop_id))
                        .filter(product_dsl::product_id.eq_any(&product_ids))
                        .select((product_dsl::product_id, product_dsl::version))
                        .load::<(String, i64)>(conn)
                        .await?
                        .into_iter()
                        .collect()
                };

                let (new_products, updated_products) =
                    compare_products(products, &stored_versions);

                let new_products = upsert_products(conn, new_products, shop_id).await?;
                let updated_products = upsert_products(conn, updated_products, shop_id).await?;

                replace_shippings(conn, &new_products).await?;
                replace_shippings(conn, &updated_products).await?;

                Ok((new_products.len() as i32, updated_products.len() as i32))
            }
            .scope_boxed()
        })
        .await
    }

    /// Tombstones every not-yet-deleted product of `shop_id` whose version
    /// is older than `version`. Returns the number of tombstoned products.
    ///
    /// Candidate ids are paged with a keyset cursor, so memory stays bounded
    /// by `batch_size`; paging and tombstoning run on one connection inside
    /// one transaction, so the reap commits atomically or rolls back as a
    /// whole. The cursor advances past every page it has seen, which
    /// guarantees termination regardless of what the updates did to the
    /// predicate.
    pub async fn delete_old_products(
        &self,
        shop_id: i32,
        version: i64,
        batch_size: usize,
    ) -> Result<i32, StorageError> {
        let mut conn = self.pool.get().await?;

        conn.transaction::<i32, StorageError, _>(|conn| {
            async move {
                let now = Utc::now();
                let mut deleted_products = 0;
                let mut previous_id = 0;

                loop {
                    let ids: Vec<i32> = product_dsl::product
                        .filter(product_dsl::shop_id.eq(shop_id))
                        .filter(product_dsl::version.lt(version))
                        .filter(product_dsl::deleted_at.is_null())
                        .filter(product_dsl::id.gt(previous_id))
                        .order(product_dsl::id.asc())
                        .limit(batch_size as i64)
                        .select(product_dsl::id)
                        .load(conn)
                        .await?;

                    let Some(&last) = ids.last() else {
                        return Ok(deleted_products);
                    };
                    previous_id = last;

                    diesel::update(product_dsl::product.filter(product_dsl::id.eq_any(&ids)))
                        .set(product_dsl::deleted_at.eq(now))
                        .execute(conn)
                        .await?;

                    deleted_products += ids.len() as i32;
                }
            }
            .scope_boxed()
        })
        .await
    }
}

/// Resolves the shop's surrogate id by url, inserting the shop on first
/// sight.
async fn get_or_create_shop(
    conn: &mut AsyncPgConnection,
    url: &str,
) -> Result<i32, StorageError> {
    let shop_id = shop_dsl::shop
        .filter(shop_dsl::url.eq(url))
        .select(shop_dsl::id)
        .first(conn)
        .await
        .optional()?;

    if let Some(shop_id) = shop_id {
        return Ok(shop_id);
    }

    let shop_id = diesel::insert_into(shop_dsl::shop)
        .values(&NewShop { url })
        .returning(shop_dsl::id)
        .get_result(conn)
        .await?;

    Ok(shop_id)
}

/// Splits a batch into products absent from storage (new) and products whose
/// stored version is older than the incoming one (updated). Anything else is
/// already at least as fresh and is dropped from the batch.
fn compare_products(
    parsed: Vec<Product>,
    stored_versions: &HashMap<String, i64>,
) -> (Vec<Product>, Vec<Product>) {
    let mut new_products = Vec::new();
    let mut updated_products = Vec::new();

    for product in parsed {
        match stored_versions.get(&product.product_id) {
            None => new_products.push(product),
            Some(&stored) if product.version > stored => updated_products.push(product),
            Some(_) => {}
        }
    }

    (new_products, updated_products)
}

/// Upserts `products` on the `(shop_id, product_id)` key, assigning every
/// column except `id` and `created_at`, and resolves the surrogate ids of
/// the written rows back into the returned products.
async fn upsert_products(
    conn: &mut AsyncPgConnection,
    mut products: Vec<Product>,
    shop_id: i32,
) -> Result<Vec<Product>, StorageError> {
    if products.is_empty() {
        return Ok(products);
    }

    {
        let rows: Vec<ProductRow> = products
            .iter()
            .map(|product| ProductRow::from_product(product, shop_id))
            .collect();

        diesel::insert_into(product_dsl::product)
            .values(&rows)
            .on_conflict((product_dsl::shop_id, product_dsl::product_id))
            .do_update()
            .set((
                product_dsl::shop_id.eq(excluded(product_dsl::shop_id)),
                product_dsl::product_id.eq(excluded(product_dsl::product_id)),
                product_dsl::version.eq(excluded(product_dsl::version)),
                product_dsl::deleted_at.eq(excluded(product_dsl::deleted_at)),
                product_dsl::title.eq(excluded(product_dsl::title)),
                product_dsl::description.eq(excluded(product_dsl::description)),
                product_dsl::url.eq(excluded(product_dsl::url)),
                product_dsl::img_url.eq(excluded(product_dsl::img_url)),
                product_dsl::additional_img_urls.eq(excluded(product_dsl::additional_img_urls)),
                product_dsl::condition.eq(excluded(product_dsl::condition)),
                product_dsl::availability.eq(excluded(product_dsl::availability)),
                product_dsl::price.eq(excluded(product_dsl::price)),
                product_dsl::brand.eq(excluded(product_dsl::brand)),
                product_dsl::gtin.eq(excluded(product_dsl::gtin)),
                product_dsl::mpn.eq(excluded(product_dsl::mpn)),
                product_dsl::product_category.eq(excluded(product_dsl::product_category)),
                product_dsl::product_type.eq(excluded(product_dsl::product_type)),
                product_dsl::color.eq(excluded(product_dsl::color)),
                product_dsl::size.eq(excluded(product_dsl::size)),
                product_dsl::item_group_id.eq(excluded(product_dsl::item_group_id)),
                product_dsl::gender.eq(excluded(product_dsl::gender)),
                product_dsl::age_group.eq(excluded(product_dsl::age_group)),
            ))
            .execute(conn)
            .await?;
    }

    let upserted_ids: Vec<(i32, String)> = {
        let product_ids: Vec<&str> = products.iter().map(|p| p.product_id.as_str()).collect();
        product_dsl::product
            .filter(product_dsl::shop_id.eq(shop_id))
            .filter(product_dsl::product_id.eq_any(&product_ids))
            .select((product_dsl::id, product_dsl::product_id))
            .load(conn)
            .await?
    };

    let ids_by_product_id: HashMap<String, i32> = upserted_ids
        .into_iter()
        .map(|(id, product_id)| (product_id, id))
        .collect();

    for product in &mut products {
        if let Some(&id) = ids_by_product_id.get(&product.product_id) {
            product.id = id;
        }
    }

    Ok(products)
}

/// Drops all shipping rows of the given products and re-inserts their
/// current shippings. Shippings have no identity across updates, so
/// wholesale replacement is the intended behaviour.
async fn replace_shippings(
    conn: &mut AsyncPgConnection,
    products: &[Product],
) -> Result<(), StorageError> {
    if products.is_empty() {
        return Ok(());
    }

    let ids: Vec<i32> = products.iter().map(|p| p.id).collect();
    diesel::delete(shipping_dsl::shipping.filter(shipping_dsl::product_id.eq_any(&ids)))
        .execute(conn)
        .await?;

    let rows: Vec<ShippingRow> = products
        .iter()
        .flat_map(|product| {
            product.shippings.iter().map(move |shipping| ShippingRow {
                product_id: product.id,
                country: &shipping.country,
                service: &shipping.service,
                price: &shipping.price,
            })
        })
        .collect();

    if rows.is_empty() {
        return Ok(());
    }

    diesel::insert_into(shipping_dsl::shipping)
        .values(&rows)
        .execute(conn)
        .await?;

    Ok(())
}
