//! Loader Service - Normalizes a denormalized order export into relational tables
//!
//! Responsibilities:
//! - Read the tab-separated export and explode semicolon-joined order fields
//! - Build lookup tables: Region, Country, ProductCategory, Product
//! - Build core tables: Customer, OrderDetail
//! - Resolve natural keys to surrogate keys between stages
//! - Insert OrderDetail facts in bounded batches with conflict-skip
//!
//! CRITICAL: stages run in strict dependency order
//! Region -> Country -> ProductCategory -> Product -> Customer -> OrderDetail
//! Each stage resolves its foreign keys against rows the previous stage
//! has already committed.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio::fs;

#[derive(Parser, Debug)]
#[command(name = "loader", about = "Normalizes a denormalized order export into relational tables")]
struct Args {
    /// Path to the tab-separated order export
    #[arg(long)]
    data_file: String,

    /// Rows accumulated per OrderDetail flush (one commit per flush)
    #[arg(long, default_value = "50000")]
    batch_size: usize,

    /// Drop existing tables before recreating them (destructive)
    #[arg(long, default_value = "false")]
    drop_tables: bool,

    /// Dry run - parse the export and report counts without touching the database
    #[arg(long, default_value = "false")]
    dry_run: bool,
}

#[derive(Debug, Clone)]
struct Config {
    db_url: String,
}

impl Config {
    fn from_env() -> Result<Self> {
        if let Ok(db_url) = std::env::var("DB_URL") {
            return Ok(Self { db_url });
        }
        let username = std::env::var("DATABASE_USERNAME")
            .context("DATABASE_USERNAME env var missing (set it or DB_URL)")?;
        let password =
            std::env::var("DATABASE_PASSWORD").context("DATABASE_PASSWORD env var missing")?;
        let server =
            std::env::var("DATABASE_SERVER").context("DATABASE_SERVER env var missing")?;
        let name = std::env::var("DATABASE_NAME").context("DATABASE_NAME env var missing")?;
        Ok(Self {
            db_url: format!("postgresql://{username}:{password}@{server}/{name}"),
        })
    }
}

// =============================================================================
// RAW EXPORT PARSING
// =============================================================================
// One export line = one customer visit. Fields 5-10 hold semicolon-joined
// lists of equal length; index i across them describes one order line.
// =============================================================================

/// Positional fields per export line:
/// name, address, city, country, region, product names, categories,
/// category descriptions, quantities, order dates, unit prices
const EXPORT_FIELD_COUNT: usize = 11;

/// One raw export line with its multi-value fields exploded
#[derive(Debug, Clone)]
struct RawRecord {
    full_name: String,
    address: String,
    city: String,
    country: String,
    region: String,
    product_names: Vec<String>,
    categories: Vec<String>,
    category_descriptions: Vec<String>,
    quantities: Vec<i32>,
    order_dates: Vec<String>,
    unit_prices: Vec<f64>,
    line_num: usize,
}

impl RawRecord {
    fn order_line_count(&self) -> usize {
        self.product_names.len()
    }
}

fn split_list(field: &str) -> Vec<String> {
    field.split(';').map(|v| v.trim().to_string()).collect()
}

/// Split a customer full name into (FirstName, LastName) on the first space.
/// Multi-word last names stay intact: "Mary Ann Smith" -> ("Mary", "Ann Smith").
fn split_full_name(full_name: &str) -> Result<(String, String)> {
    let mut parts = full_name.splitn(2, ' ');
    let first = parts.next().unwrap_or("").trim();
    let last = parts.next().unwrap_or("").trim();
    if first.is_empty() || last.is_empty() {
        anyhow::bail!("customer name '{}' is not in 'First Last' form", full_name);
    }
    Ok((first.to_string(), last.to_string()))
}

/// Normalize a fixed-width order date: "20230115" -> 2023-01-15
fn normalize_order_date(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y%m%d")
        .with_context(|| format!("invalid order date '{raw}', expected YYYYMMDD"))
}

/// Parse the full export content into raw records.
/// This function is DETERMINISTIC: same input = same output.
/// Any structural defect (wrong field count, mismatched list lengths,
/// unparseable quantity or price) is fatal for the run.
fn parse_export(content: &str) -> Result<Vec<RawRecord>> {
    // Remove UTF-8 BOM if present
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);

    if content.trim().is_empty() {
        anyhow::bail!("export file is empty");
    }

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .flexible(false) // Strict: all rows must have same number of fields
        .trim(csv::Trim::All)
        .from_reader(content.as_bytes());

    let mut records = Vec::new();

    for (line_idx, result) in reader.records().enumerate() {
        let line_num = line_idx + 2; // +1 for 0-index, +1 for header

        let record = result.with_context(|| format!("line {line_num}: malformed record"))?;

        if record.len() != EXPORT_FIELD_COUNT {
            anyhow::bail!(
                "line {}: expected {} fields, found {}",
                line_num,
                EXPORT_FIELD_COUNT,
                record.len()
            );
        }

        let product_names = split_list(&record[5]);
        let categories = split_list(&record[6]);
        let category_descriptions = split_list(&record[7]);
        let quantity_list = split_list(&record[8]);
        let order_dates = split_list(&record[9]);
        let price_list = split_list(&record[10]);

        let n = product_names.len();
        for (label, len) in [
            ("product category", categories.len()),
            ("category description", category_descriptions.len()),
            ("quantity", quantity_list.len()),
            ("order date", order_dates.len()),
            ("unit price", price_list.len()),
        ] {
            if len != n {
                anyhow::bail!(
                    "line {}: {} list has {} values, product name list has {}",
                    line_num,
                    label,
                    len,
                    n
                );
            }
        }

        let quantities = quantity_list
            .iter()
            .map(|v| {
                v.parse::<i32>()
                    .with_context(|| format!("line {line_num}: invalid quantity '{v}'"))
            })
            .collect::<Result<Vec<_>>>()?;

        let unit_prices = price_list
            .iter()
            .map(|v| {
                v.parse::<f64>()
                    .with_context(|| format!("line {line_num}: invalid unit price '{v}'"))
            })
            .collect::<Result<Vec<_>>>()?;

        records.push(RawRecord {
            full_name: record[0].to_string(),
            address: record[1].to_string(),
            city: record[2].to_string(),
            country: record[3].to_string(),
            region: record[4].to_string(),
            product_names,
            categories,
            category_descriptions,
            quantities,
            order_dates,
            unit_prices,
            line_num,
        });
    }

    Ok(records)
}

/// Read and parse the export. Every stage re-reads the file; the whole
/// content is held in memory for the duration of one parse.
async fn read_export(path: &str) -> Result<Vec<RawRecord>> {
    let content = fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read export file {path}"))?;
    parse_export(&content)
}

// =============================================================================
// DIMENSION EXTRACTION
// =============================================================================
// Each extractor dedups by the dimension's natural key, first occurrence
// wins. BTreeMap keys give a deterministic, sorted row order so repeated
// runs insert identical row sequences.
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
struct ProductRow {
    name: String,
    unit_price: f64,
    category: String,
}

#[derive(Debug, Clone, PartialEq)]
struct CustomerRow {
    first_name: String,
    last_name: String,
    address: String,
    city: String,
    country: String,
}

fn distinct_regions(records: &[RawRecord]) -> Vec<String> {
    let mut seen: BTreeSet<String> = BTreeSet::new();
    for r in records {
        seen.insert(r.region.clone());
    }
    seen.into_iter().collect()
}

fn distinct_countries(records: &[RawRecord]) -> Vec<(String, String)> {
    let mut seen: BTreeMap<String, String> = BTreeMap::new();
    for r in records {
        match seen.get(&r.country) {
            None => {
                seen.insert(r.country.clone(), r.region.clone());
            }
            Some(region) if *region != r.region => {
                eprintln!(
                    "Warning: line {}: country '{}' listed under region '{}', keeping first-seen '{}'",
                    r.line_num, r.country, r.region, region
                );
            }
            Some(_) => {}
        }
    }
    seen.into_iter().collect()
}

fn distinct_categories(records: &[RawRecord]) -> Vec<(String, String)> {
    let mut seen: BTreeMap<String, String> = BTreeMap::new();
    for r in records {
        for (category, description) in r.categories.iter().zip(&r.category_descriptions) {
            match seen.get(category) {
                None => {
                    seen.insert(category.clone(), description.clone());
                }
                Some(first) if first != description => {
                    eprintln!(
                        "Warning: line {}: category '{}' described as '{}', keeping first-seen '{}'",
                        r.line_num, category, description, first
                    );
                }
                Some(_) => {}
            }
        }
    }
    seen.into_iter().collect()
}

fn distinct_products(records: &[RawRecord]) -> Vec<ProductRow> {
    let mut seen: BTreeMap<String, (f64, String)> = BTreeMap::new();
    for r in records {
        for i in 0..r.order_line_count() {
            let name = &r.product_names[i];
            match seen.get(name) {
                None => {
                    seen.insert(name.clone(), (r.unit_prices[i], r.categories[i].clone()));
                }
                Some((_, category)) if *category != r.categories[i] => {
                    eprintln!(
                        "Warning: line {}: product '{}' listed under category '{}', keeping first-seen '{}'",
                        r.line_num, name, r.categories[i], category
                    );
                }
                Some(_) => {}
            }
        }
    }
    seen.into_iter()
        .map(|(name, (unit_price, category))| ProductRow {
            name,
            unit_price,
            category,
        })
        .collect()
}

/// Customer identity is (FirstName, LastName, Address): two customers may
/// share a name as long as their addresses differ.
fn distinct_customers(records: &[RawRecord]) -> Result<Vec<CustomerRow>> {
    let mut seen: BTreeMap<(String, String, String), (String, String)> = BTreeMap::new();
    for r in records {
        let (first, last) =
            split_full_name(&r.full_name).with_context(|| format!("line {}", r.line_num))?;
        let key = (first, last, r.address.clone());
        match seen.get(&key) {
            None => {
                seen.insert(key, (r.city.clone(), r.country.clone()));
            }
            Some((city, country)) if *city != r.city || *country != r.country => {
                eprintln!(
                    "Warning: line {}: customer '{}' at '{}' relisted in {}/{}, keeping first-seen {}/{}",
                    r.line_num, r.full_name, r.address, r.city, r.country, city, country
                );
            }
            Some(_) => {}
        }
    }
    Ok(seen
        .into_iter()
        .map(|((first_name, last_name, address), (city, country))| CustomerRow {
            first_name,
            last_name,
            address,
            city,
            country,
        })
        .collect())
}

// =============================================================================
// STORAGE GATEWAY
// =============================================================================

/// PostgreSQL caps bind parameters at 65535 per statement; 5000 rows of up
/// to 6 columns stay well under it. Commit granularity is unaffected: all
/// chunks of one batch share one transaction.
const INSERT_CHUNK_ROWS: usize = 5_000;

/// Owns the database connection for the whole run. The pool is capped at a
/// single connection; no other component opens one.
struct Store {
    pool: PgPool,
}

impl Store {
    async fn connect(db_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(db_url)
            .await
            .context("failed to connect to database")?;
        Ok(Self { pool })
    }

    /// Run DDL, optionally dropping the table first. CASCADE is required on
    /// drop: recreation runs in dependency order, so the dropped table may
    /// still be referenced by a dependent table's foreign key.
    async fn create_table(&self, ddl: &str, drop_table: Option<&str>) -> Result<()> {
        if let Some(name) = drop_table {
            sqlx::query(&format!("DROP TABLE IF EXISTS {name} CASCADE"))
                .execute(&self.pool)
                .await
                .with_context(|| format!("failed to drop table {name}"))?;
        }
        sqlx::query(ddl)
            .execute(&self.pool)
            .await
            .context("failed to create table")?;
        Ok(())
    }
}

// =============================================================================
// SURROGATE KEY INDEXES
// =============================================================================
// Valid only after the owning dimension's commit; rebuilt by each stage
// that needs one, never cached across stages.
// =============================================================================

/// Map a dimension's natural key to its surrogate key. The query must
/// select (surrogate key, natural key) in that column order.
async fn natural_key_index(pool: &PgPool, sql: &str) -> Result<HashMap<String, i32>> {
    let rows: Vec<(i32, String)> = sqlx::query_as(sql)
        .fetch_all(pool)
        .await
        .with_context(|| format!("failed to load surrogate keys ({sql})"))?;
    Ok(rows.into_iter().map(|(id, key)| (key, id)).collect())
}

/// Customer keys are composite: (FirstName, LastName, Address), matching
/// the table's unique constraint.
async fn customer_index(pool: &PgPool) -> Result<HashMap<(String, String, String), i32>> {
    let rows: Vec<(i32, String, String, String)> =
        sqlx::query_as("SELECT CustomerID, FirstName, LastName, Address FROM Customer")
            .fetch_all(pool)
            .await
            .context("failed to load Customer surrogate keys")?;
    Ok(rows
        .into_iter()
        .map(|(id, first, last, address)| ((first, last, address), id))
        .collect())
}

// =============================================================================
// DIMENSION LOAD STAGES
// =============================================================================
// Common shape per stage: re-read the export, extract + dedup, resolve
// parent surrogate keys, recreate the table, insert everything in one
// transaction with conflict-skip on the natural key.
// =============================================================================

async fn build_region(store: &Store, data_file: &str, drop_tables: bool) -> Result<usize> {
    println!("\n=== Stage 1/6: Region ===");
    let records = read_export(data_file).await?;
    let regions = distinct_regions(&records);
    println!("  {} distinct regions from {} raw lines", regions.len(), records.len());

    store
        .create_table(
            r#"
            CREATE TABLE IF NOT EXISTS Region (
                RegionID SERIAL NOT NULL PRIMARY KEY,
                Region TEXT NOT NULL,
                UNIQUE (Region)
            )
            "#,
            drop_tables.then_some("Region"),
        )
        .await?;

    let mut tx = store.pool.begin().await?;
    for chunk in regions.chunks(INSERT_CHUNK_ROWS) {
        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new("INSERT INTO Region (Region) ");
        qb.push_values(chunk, |mut b, region| {
            b.push_bind(region);
        });
        qb.push(" ON CONFLICT (Region) DO NOTHING");
        qb.build().execute(&mut *tx).await?;
    }
    tx.commit().await?;

    println!("  inserted {} rows", regions.len());
    Ok(regions.len())
}

async fn build_country(store: &Store, data_file: &str, drop_tables: bool) -> Result<usize> {
    println!("\n=== Stage 2/6: Country ===");
    let records = read_export(data_file).await?;
    let countries = distinct_countries(&records);
    println!("  {} distinct countries", countries.len());

    let regions = natural_key_index(&store.pool, "SELECT RegionID, Region FROM Region").await?;
    let mut rows = Vec::with_capacity(countries.len());
    for (country, region) in &countries {
        let region_id = *regions
            .get(region)
            .with_context(|| format!("region '{region}' missing from surrogate key index"))?;
        rows.push((country.clone(), region_id));
    }

    store
        .create_table(
            r#"
            CREATE TABLE IF NOT EXISTS Country (
                CountryID SERIAL NOT NULL PRIMARY KEY,
                Country TEXT NOT NULL,
                RegionID INTEGER NOT NULL,
                UNIQUE (Country),
                FOREIGN KEY (RegionID) REFERENCES Region (RegionID)
            )
            "#,
            drop_tables.then_some("Country"),
        )
        .await?;

    let mut tx = store.pool.begin().await?;
    for chunk in rows.chunks(INSERT_CHUNK_ROWS) {
        let mut qb: QueryBuilder<'_, Postgres> =
            QueryBuilder::new("INSERT INTO Country (Country, RegionID) ");
        qb.push_values(chunk, |mut b, (country, region_id)| {
            b.push_bind(country).push_bind(*region_id);
        });
        qb.push(" ON CONFLICT (Country) DO NOTHING");
        qb.build().execute(&mut *tx).await?;
    }
    tx.commit().await?;

    println!("  inserted {} rows", rows.len());
    Ok(rows.len())
}

async fn build_product_category(store: &Store, data_file: &str, drop_tables: bool) -> Result<usize> {
    println!("\n=== Stage 3/6: ProductCategory ===");
    let records = read_export(data_file).await?;
    let categories = distinct_categories(&records);
    println!("  {} distinct categories", categories.len());

    store
        .create_table(
            r#"
            CREATE TABLE IF NOT EXISTS ProductCategory (
                ProductCategoryID SERIAL NOT NULL PRIMARY KEY,
                ProductCategory TEXT NOT NULL,
                ProductCategoryDescription TEXT NOT NULL,
                UNIQUE (ProductCategory)
            )
            "#,
            drop_tables.then_some("ProductCategory"),
        )
        .await?;

    let mut tx = store.pool.begin().await?;
    for chunk in categories.chunks(INSERT_CHUNK_ROWS) {
        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
            "INSERT INTO ProductCategory (ProductCategory, ProductCategoryDescription) ",
        );
        qb.push_values(chunk, |mut b, (category, description)| {
            b.push_bind(category).push_bind(description);
        });
        qb.push(" ON CONFLICT (ProductCategory) DO NOTHING");
        qb.build().execute(&mut *tx).await?;
    }
    tx.commit().await?;

    println!("  inserted {} rows", categories.len());
    Ok(categories.len())
}

async fn build_product(store: &Store, data_file: &str, drop_tables: bool) -> Result<usize> {
    println!("\n=== Stage 4/6: Product ===");
    let records = read_export(data_file).await?;
    let products = distinct_products(&records);
    println!("  {} distinct products", products.len());

    let categories = natural_key_index(
        &store.pool,
        "SELECT ProductCategoryID, ProductCategory FROM ProductCategory",
    )
    .await?;
    let mut rows = Vec::with_capacity(products.len());
    for product in &products {
        let category_id = *categories.get(&product.category).with_context(|| {
            format!(
                "category '{}' missing from surrogate key index",
                product.category
            )
        })?;
        rows.push((product.name.clone(), product.unit_price, category_id));
    }

    store
        .create_table(
            r#"
            CREATE TABLE IF NOT EXISTS Product (
                ProductID SERIAL NOT NULL PRIMARY KEY,
                ProductName TEXT NOT NULL,
                ProductUnitPrice DOUBLE PRECISION NOT NULL,
                ProductCategoryID INTEGER NOT NULL,
                UNIQUE (ProductName),
                FOREIGN KEY (ProductCategoryID) REFERENCES ProductCategory (ProductCategoryID)
            )
            "#,
            drop_tables.then_some("Product"),
        )
        .await?;

    let mut tx = store.pool.begin().await?;
    for chunk in rows.chunks(INSERT_CHUNK_ROWS) {
        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
            "INSERT INTO Product (ProductName, ProductUnitPrice, ProductCategoryID) ",
        );
        qb.push_values(chunk, |mut b, (name, unit_price, category_id)| {
            b.push_bind(name).push_bind(*unit_price).push_bind(*category_id);
        });
        qb.push(" ON CONFLICT (ProductName) DO NOTHING");
        qb.build().execute(&mut *tx).await?;
    }
    tx.commit().await?;

    println!("  inserted {} rows", rows.len());
    Ok(rows.len())
}

async fn build_customer(store: &Store, data_file: &str, drop_tables: bool) -> Result<usize> {
    println!("\n=== Stage 5/6: Customer ===");
    let records = read_export(data_file).await?;
    let customers = distinct_customers(&records)?;
    println!("  {} distinct customers", customers.len());

    let countries = natural_key_index(&store.pool, "SELECT CountryID, Country FROM Country").await?;
    let mut rows = Vec::with_capacity(customers.len());
    for customer in &customers {
        let country_id = *countries.get(&customer.country).with_context(|| {
            format!(
                "country '{}' missing from surrogate key index",
                customer.country
            )
        })?;
        rows.push((customer, country_id));
    }

    store
        .create_table(
            r#"
            CREATE TABLE IF NOT EXISTS Customer (
                CustomerID SERIAL NOT NULL PRIMARY KEY,
                FirstName TEXT NOT NULL,
                LastName TEXT NOT NULL,
                Address TEXT NOT NULL,
                City TEXT NOT NULL,
                CountryID INTEGER NOT NULL,
                UNIQUE (FirstName, LastName, Address),
                FOREIGN KEY (CountryID) REFERENCES Country (CountryID)
            )
            "#,
            drop_tables.then_some("Customer"),
        )
        .await?;

    let mut tx = store.pool.begin().await?;
    for chunk in rows.chunks(INSERT_CHUNK_ROWS) {
        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
            "INSERT INTO Customer (FirstName, LastName, Address, City, CountryID) ",
        );
        qb.push_values(chunk, |mut b, (customer, country_id)| {
            b.push_bind(&customer.first_name)
                .push_bind(&customer.last_name)
                .push_bind(&customer.address)
                .push_bind(&customer.city)
                .push_bind(*country_id);
        });
        qb.push(" ON CONFLICT (FirstName, LastName, Address) DO NOTHING");
        qb.build().execute(&mut *tx).await?;
    }
    tx.commit().await?;

    println!("  inserted {} rows", rows.len());
    Ok(rows.len())
}

// =============================================================================
// FACT LOAD (OrderDetail)
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct OrderRow {
    customer_id: i32,
    product_id: i32,
    order_date: NaiveDate,
    quantity: i32,
}

/// One flush = one transaction. A crash mid-run loses at most the batch
/// currently being accumulated; rerunning is safe because (CustomerID,
/// ProductID) conflicts are skipped.
async fn flush_orders(pool: &PgPool, batch: &[OrderRow]) -> Result<()> {
    let mut tx = pool.begin().await?;
    for chunk in batch.chunks(INSERT_CHUNK_ROWS) {
        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
            "INSERT INTO OrderDetail (CustomerID, ProductID, OrderDate, QuantityOrdered) ",
        );
        qb.push_values(chunk, |mut b, row| {
            b.push_bind(row.customer_id)
                .push_bind(row.product_id)
                .push_bind(row.order_date)
                .push_bind(row.quantity);
        });
        qb.push(" ON CONFLICT (CustomerID, ProductID) DO NOTHING");
        qb.build().execute(&mut *tx).await?;
    }
    tx.commit().await?;
    Ok(())
}

async fn build_order_detail(
    store: &Store,
    data_file: &str,
    batch_size: usize,
    drop_tables: bool,
) -> Result<usize> {
    println!("\n=== Stage 6/6: OrderDetail ===");

    store
        .create_table(
            r#"
            CREATE TABLE IF NOT EXISTS OrderDetail (
                OrderID SERIAL NOT NULL PRIMARY KEY,
                CustomerID INTEGER NOT NULL,
                ProductID INTEGER NOT NULL,
                OrderDate DATE NOT NULL,
                QuantityOrdered INTEGER NOT NULL,
                UNIQUE (CustomerID, ProductID),
                FOREIGN KEY (CustomerID) REFERENCES Customer (CustomerID),
                FOREIGN KEY (ProductID) REFERENCES Product (ProductID)
            )
            "#,
            drop_tables.then_some("OrderDetail"),
        )
        .await?;

    let customers = customer_index(&store.pool).await?;
    let products =
        natural_key_index(&store.pool, "SELECT ProductID, ProductName FROM Product").await?;
    println!(
        "  resolved {} customer and {} product keys",
        customers.len(),
        products.len()
    );

    let records = read_export(data_file).await?;
    let mut batch: Vec<OrderRow> = Vec::with_capacity(batch_size);
    let mut total = 0usize;

    for r in &records {
        let (first, last) =
            split_full_name(&r.full_name).with_context(|| format!("line {}", r.line_num))?;
        let customer_key = (first, last, r.address.clone());
        let customer_id = *customers.get(&customer_key).with_context(|| {
            format!(
                "line {}: customer '{}' at '{}' missing from surrogate key index",
                r.line_num, r.full_name, r.address
            )
        })?;

        for i in 0..r.order_line_count() {
            let product_id = *products.get(&r.product_names[i]).with_context(|| {
                format!(
                    "line {}: product '{}' missing from surrogate key index",
                    r.line_num, r.product_names[i]
                )
            })?;
            let order_date = normalize_order_date(&r.order_dates[i])
                .with_context(|| format!("line {}", r.line_num))?;

            batch.push(OrderRow {
                customer_id,
                product_id,
                order_date,
                quantity: r.quantities[i],
            });

            if batch.len() >= batch_size {
                flush_orders(&store.pool, &batch).await?;
                total += batch.len();
                println!("  flushed {} rows ({} total)", batch.len(), total);
                batch.clear();
            }
        }
    }

    if !batch.is_empty() {
        flush_orders(&store.pool, &batch).await?;
        total += batch.len();
        println!("  flushed {} rows ({} total)", batch.len(), total);
    }

    Ok(total)
}

// =============================================================================
// REPORTING
// =============================================================================

fn print_dry_run_report(records: &[RawRecord]) -> Result<()> {
    let order_lines: usize = records.iter().map(|r| r.order_line_count()).sum();
    println!("\n=== Dry Run Report ===");
    println!("  raw lines: {}", records.len());
    println!("  order lines: {}", order_lines);
    println!("  distinct regions: {}", distinct_regions(records).len());
    println!("  distinct countries: {}", distinct_countries(records).len());
    println!("  distinct categories: {}", distinct_categories(records).len());
    println!("  distinct products: {}", distinct_products(records).len());
    println!("  distinct customers: {}", distinct_customers(records)?.len());
    Ok(())
}

async fn print_table_counts(pool: &PgPool) -> Result<()> {
    println!("\n=== Load Summary ===");
    for table in [
        "Region",
        "Country",
        "ProductCategory",
        "Product",
        "Customer",
        "OrderDetail",
    ] {
        let (count,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(pool)
            .await
            .with_context(|| format!("failed to count rows in {table}"))?;
        println!("  {table}: {count} rows");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    println!("=== Orders Export Loader ===");
    println!("Export: {}", args.data_file);
    println!("Batch size: {}", args.batch_size);
    println!("Mode: {}", if args.dry_run { "dry-run" } else { "live" });

    if args.dry_run {
        let records = read_export(&args.data_file).await?;
        print_dry_run_report(&records)?;
        return Ok(());
    }

    let config = Config::from_env()?;
    let store = Store::connect(&config.db_url).await?;

    build_region(&store, &args.data_file, args.drop_tables)
        .await
        .context("Region stage failed")?;
    build_country(&store, &args.data_file, args.drop_tables)
        .await
        .context("Country stage failed")?;
    build_product_category(&store, &args.data_file, args.drop_tables)
        .await
        .context("ProductCategory stage failed")?;
    build_product(&store, &args.data_file, args.drop_tables)
        .await
        .context("Product stage failed")?;
    build_customer(&store, &args.data_file, args.drop_tables)
        .await
        .context("Customer stage failed")?;
    build_order_detail(&store, &args.data_file, args.batch_size, args.drop_tables)
        .await
        .context("OrderDetail stage failed")?;

    print_table_counts(&store.pool).await?;

    println!("\n=== Load Complete ===");
    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "Name\tAddress\tCity\tCountry\tRegion\tProductName\tProductCategory\tProductCategoryDescription\tQuantityOrdered\tOrderDate\tProductUnitPrice";

    const SAMPLE_LINE: &str = "Jane Doe\t123 Elm St\tSpringfield\tUSA\tNorth America\tWidget;Gadget\tToys;Toys\tFun toy;Cool gadget\t3;1\t20230101;20230102\t9.99;19.99";

    fn export_with(lines: &[&str]) -> String {
        let mut content = String::from(HEADER);
        for line in lines {
            content.push('\n');
            content.push_str(line);
        }
        content
    }

    // -------------------------------------------------------------------------
    // RAW EXPORT PARSING
    // -------------------------------------------------------------------------

    #[test]
    fn test_parse_export_single_line() {
        let records = parse_export(&export_with(&[SAMPLE_LINE])).unwrap();
        assert_eq!(records.len(), 1);

        let r = &records[0];
        assert_eq!(r.full_name, "Jane Doe");
        assert_eq!(r.address, "123 Elm St");
        assert_eq!(r.city, "Springfield");
        assert_eq!(r.country, "USA");
        assert_eq!(r.region, "North America");
        assert_eq!(r.product_names, vec!["Widget", "Gadget"]);
        assert_eq!(r.categories, vec!["Toys", "Toys"]);
        assert_eq!(r.category_descriptions, vec!["Fun toy", "Cool gadget"]);
        assert_eq!(r.quantities, vec![3, 1]);
        assert_eq!(r.order_dates, vec!["20230101", "20230102"]);
        assert_eq!(r.unit_prices, vec![9.99, 19.99]);
        assert_eq!(r.line_num, 2);
    }

    #[test]
    fn test_parse_export_order_line_count_matches_lists() {
        let records = parse_export(&export_with(&[SAMPLE_LINE])).unwrap();
        let r = &records[0];
        assert_eq!(r.order_line_count(), 2);
        assert_eq!(r.order_line_count(), r.quantities.len());
        assert_eq!(r.order_line_count(), r.order_dates.len());
        assert_eq!(r.order_line_count(), r.unit_prices.len());
    }

    #[test]
    fn test_parse_export_determinism() {
        let content = export_with(&[
            SAMPLE_LINE,
            "Bob Ray\t9 Oak Ave\tShelbyville\tCanada\tNorth America\tWidget\tToys\tFun toy\t2\t20230301\t9.99",
        ]);
        let a = parse_export(&content).unwrap();
        let b = parse_export(&content).unwrap();
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.full_name, y.full_name);
            assert_eq!(x.product_names, y.product_names);
            assert_eq!(x.line_num, y.line_num);
        }
    }

    #[test]
    fn test_parse_export_empty_file_fails() {
        let result = parse_export("");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("empty"));

        assert!(parse_export("  \n  ").is_err());
    }

    #[test]
    fn test_parse_export_header_only_is_zero_records() {
        let records = parse_export(HEADER).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_parse_export_wrong_field_count_fails() {
        let result = parse_export(&export_with(&["Jane Doe\t123 Elm St\tSpringfield"]));
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("line 2"));
    }

    #[test]
    fn test_parse_export_list_length_mismatch_fails() {
        // Two products but only one category
        let line = "Jane Doe\t123 Elm St\tSpringfield\tUSA\tNorth America\tWidget;Gadget\tToys\tFun toy\t3;1\t20230101;20230102\t9.99;19.99";
        let result = parse_export(&export_with(&[line]));
        assert!(result.is_err());
        let msg = result.unwrap_err().to_string();
        assert!(msg.contains("line 2"));
        assert!(msg.contains("product category"));
    }

    #[test]
    fn test_parse_export_bad_quantity_fails() {
        let line = "Jane Doe\t123 Elm St\tSpringfield\tUSA\tNorth America\tWidget\tToys\tFun toy\tthree\t20230101\t9.99";
        let result = parse_export(&export_with(&[line]));
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("invalid quantity"));
    }

    #[test]
    fn test_parse_export_bad_price_fails() {
        let line = "Jane Doe\t123 Elm St\tSpringfield\tUSA\tNorth America\tWidget\tToys\tFun toy\t3\t20230101\tcheap";
        let result = parse_export(&export_with(&[line]));
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("invalid unit price"));
    }

    #[test]
    fn test_parse_export_strips_bom() {
        let content = format!("\u{feff}{}", export_with(&[SAMPLE_LINE]));
        let records = parse_export(&content).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].full_name, "Jane Doe");
    }

    // -------------------------------------------------------------------------
    // NAME SPLITTING
    // -------------------------------------------------------------------------

    #[test]
    fn test_split_full_name_two_parts() {
        assert_eq!(
            split_full_name("Jane Doe").unwrap(),
            ("Jane".to_string(), "Doe".to_string())
        );
    }

    #[test]
    fn test_split_full_name_multiword_last_name() {
        assert_eq!(
            split_full_name("Mary Ann Smith").unwrap(),
            ("Mary".to_string(), "Ann Smith".to_string())
        );
    }

    #[test]
    fn test_split_full_name_single_token_fails() {
        assert!(split_full_name("Jane").is_err());
        assert!(split_full_name("").is_err());
    }

    // -------------------------------------------------------------------------
    // DATE NORMALIZATION
    // -------------------------------------------------------------------------

    #[test]
    fn test_normalize_order_date() {
        assert_eq!(
            normalize_order_date("20230115").unwrap(),
            NaiveDate::from_ymd_opt(2023, 1, 15).unwrap()
        );
    }

    #[test]
    fn test_normalize_order_date_invalid_fails() {
        assert!(normalize_order_date("20231301").is_err()); // month 13
        assert!(normalize_order_date("2023-01-15").is_err()); // wrong shape
        assert!(normalize_order_date("notadate").is_err());
    }

    // -------------------------------------------------------------------------
    // DIMENSION EXTRACTION
    // -------------------------------------------------------------------------

    #[test]
    fn test_distinct_regions_dedup_and_sort() {
        let records = parse_export(&export_with(&[
            "A One\t1 St\tX\tUSA\tNorth America\tWidget\tToys\tFun toy\t1\t20230101\t9.99",
            "B Two\t2 St\tY\tChile\tSouth America\tWidget\tToys\tFun toy\t1\t20230101\t9.99",
            "C Three\t3 St\tZ\tCanada\tNorth America\tWidget\tToys\tFun toy\t1\t20230101\t9.99",
        ]))
        .unwrap();
        assert_eq!(
            distinct_regions(&records),
            vec!["North America", "South America"]
        );
    }

    #[test]
    fn test_distinct_countries_first_seen_region_wins() {
        let records = parse_export(&export_with(&[
            "A One\t1 St\tX\tUSA\tNorth America\tWidget\tToys\tFun toy\t1\t20230101\t9.99",
            "B Two\t2 St\tY\tUSA\tSouth America\tWidget\tToys\tFun toy\t1\t20230101\t9.99",
        ]))
        .unwrap();
        assert_eq!(
            distinct_countries(&records),
            vec![("USA".to_string(), "North America".to_string())]
        );
    }

    #[test]
    fn test_distinct_categories_first_description_wins() {
        let records = parse_export(&export_with(&[
            "A One\t1 St\tX\tUSA\tNorth America\tWidget\tToys\tFun toy\t1\t20230101\t9.99",
            "B Two\t2 St\tY\tUSA\tNorth America\tGadget\tToys\tDifferent words\t1\t20230101\t19.99",
        ]))
        .unwrap();
        assert_eq!(
            distinct_categories(&records),
            vec![("Toys".to_string(), "Fun toy".to_string())]
        );
    }

    #[test]
    fn test_distinct_products_sorted_first_seen_wins() {
        let records = parse_export(&export_with(&[
            SAMPLE_LINE,
            // Widget relisted under a different category: first-seen wins
            "B Two\t2 St\tY\tUSA\tNorth America\tWidget\tTools\tHandy\t1\t20230101\t9.99",
        ]))
        .unwrap();
        let products = distinct_products(&records);
        assert_eq!(products.len(), 2);
        assert_eq!(
            products[0],
            ProductRow {
                name: "Gadget".to_string(),
                unit_price: 19.99,
                category: "Toys".to_string(),
            }
        );
        assert_eq!(
            products[1],
            ProductRow {
                name: "Widget".to_string(),
                unit_price: 9.99,
                category: "Toys".to_string(),
            }
        );
    }

    #[test]
    fn test_distinct_customers_same_name_different_address_kept() {
        let records = parse_export(&export_with(&[
            "Jane Doe\t123 Elm St\tSpringfield\tUSA\tNorth America\tWidget\tToys\tFun toy\t1\t20230101\t9.99",
            "Jane Doe\t9 Oak Ave\tShelbyville\tUSA\tNorth America\tWidget\tToys\tFun toy\t1\t20230101\t9.99",
        ]))
        .unwrap();
        let customers = distinct_customers(&records).unwrap();
        assert_eq!(customers.len(), 2);
        assert_eq!(customers[0].address, "123 Elm St");
        assert_eq!(customers[1].address, "9 Oak Ave");
    }

    #[test]
    fn test_distinct_customers_same_key_first_city_wins() {
        let records = parse_export(&export_with(&[
            "Jane Doe\t123 Elm St\tSpringfield\tUSA\tNorth America\tWidget\tToys\tFun toy\t1\t20230101\t9.99",
            "Jane Doe\t123 Elm St\tShelbyville\tUSA\tNorth America\tWidget\tToys\tFun toy\t1\t20230101\t9.99",
        ]))
        .unwrap();
        let customers = distinct_customers(&records).unwrap();
        assert_eq!(customers.len(), 1);
        assert_eq!(customers[0].city, "Springfield");
    }

    #[test]
    fn test_distinct_customers_sorted_by_name_then_address() {
        let records = parse_export(&export_with(&[
            "Zoe Quinn\t5 Fir Rd\tA-Town\tUSA\tNorth America\tWidget\tToys\tFun toy\t1\t20230101\t9.99",
            "Ada Byron\t7 Ash Ln\tB-Town\tUSA\tNorth America\tWidget\tToys\tFun toy\t1\t20230101\t9.99",
        ]))
        .unwrap();
        let customers = distinct_customers(&records).unwrap();
        assert_eq!(customers[0].first_name, "Ada");
        assert_eq!(customers[1].first_name, "Zoe");
    }

    // -------------------------------------------------------------------------
    // END-TO-END EXAMPLE LINE
    // -------------------------------------------------------------------------

    #[test]
    fn test_example_line_extraction() {
        let records = parse_export(&export_with(&[SAMPLE_LINE])).unwrap();

        assert_eq!(distinct_regions(&records), vec!["North America"]);
        assert_eq!(
            distinct_countries(&records),
            vec![("USA".to_string(), "North America".to_string())]
        );
        assert_eq!(
            distinct_categories(&records),
            vec![("Toys".to_string(), "Fun toy".to_string())]
        );

        let products = distinct_products(&records);
        assert_eq!(products.len(), 2);
        assert_eq!(products[0].name, "Gadget");
        assert_eq!(products[0].unit_price, 19.99);
        assert_eq!(products[1].name, "Widget");
        assert_eq!(products[1].unit_price, 9.99);

        let customers = distinct_customers(&records).unwrap();
        assert_eq!(
            customers,
            vec![CustomerRow {
                first_name: "Jane".to_string(),
                last_name: "Doe".to_string(),
                address: "123 Elm St".to_string(),
                city: "Springfield".to_string(),
                country: "USA".to_string(),
            }]
        );

        // Two order lines: Jane Doe x Widget on 2023-01-01 qty 3,
        // Jane Doe x Gadget on 2023-01-02 qty 1
        let r = &records[0];
        assert_eq!(r.order_line_count(), 2);
        assert_eq!(
            normalize_order_date(&r.order_dates[0]).unwrap(),
            NaiveDate::from_ymd_opt(2023, 1, 1).unwrap()
        );
        assert_eq!(
            normalize_order_date(&r.order_dates[1]).unwrap(),
            NaiveDate::from_ymd_opt(2023, 1, 2).unwrap()
        );
        assert_eq!(r.quantities, vec![3, 1]);
    }
}
