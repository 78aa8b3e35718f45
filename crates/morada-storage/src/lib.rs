//! Listing persistence (upsert sink) + raw-page archive for Morada.

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use morada_core::{ListingRecord, Platform, StoredListing};
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPool;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "morada-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Counts reported by one batch upsert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertSummary {
    pub inserted: usize,
    pub updated: usize,
}

/// Insert-or-merge sink keyed by `(platform, platform_code)`. One call is one
/// unit of work: either the whole batch lands or none of it does.
#[async_trait]
pub trait ListingSink: Send + Sync {
    async fn upsert_batch(&self, records: &[ListingRecord]) -> Result<UpsertSummary, StoreError>;
}

/// Postgres-backed sink. The batch runs inside a single transaction.
#[derive(Debug, Clone)]
pub struct PgListingStore {
    pool: PgPool,
}

impl PgListingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        Ok(Self {
            pool: PgPool::connect(database_url).await?,
        })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!().run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl ListingSink for PgListingStore {
    async fn upsert_batch(&self, records: &[ListingRecord]) -> Result<UpsertSummary, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut summary = UpsertSummary::default();

        for record in records {
            let existing: Option<(i64,)> = sqlx::query_as(
                "SELECT id FROM listings WHERE platform = $1 AND platform_code = $2",
            )
            .bind(record.platform.as_str())
            .bind(&record.platform_code)
            .fetch_optional(&mut *tx)
            .await?;

            match existing {
                Some((id,)) => {
                    // COALESCE keeps the stored value wherever the new
                    // sighting carried nothing.
                    sqlx::query(
                        r#"
                        UPDATE listings
                           SET description = $2,
                               price = COALESCE($3, price),
                               condo_fee = COALESCE($4, condo_fee),
                               location = COALESCE($5, location),
                               address = COALESCE($6, address),
                               url = COALESCE($7, url),
                               area = COALESCE($8, area),
                               rooms = COALESCE($9, rooms),
                               bathrooms = COALESCE($10, bathrooms),
                               scraped_at = $11
                         WHERE id = $1
                        "#,
                    )
                    .bind(id)
                    .bind(&record.description)
                    .bind(record.price)
                    .bind(record.condo_fee)
                    .bind(&record.location)
                    .bind(&record.address)
                    .bind(&record.url)
                    .bind(record.area)
                    .bind(record.rooms)
                    .bind(record.bathrooms)
                    .bind(record.scraped_at)
                    .execute(&mut *tx)
                    .await?;
                    summary.updated += 1;
                }
                None => {
                    sqlx::query(
                        r#"
                        INSERT INTO listings
                            (platform, platform_code, description, price, condo_fee,
                             location, address, url, area, rooms, bathrooms, scraped_at)
                        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                        "#,
                    )
                    .bind(record.platform.as_str())
                    .bind(&record.platform_code)
                    .bind(&record.description)
                    .bind(record.price)
                    .bind(record.condo_fee)
                    .bind(&record.location)
                    .bind(&record.address)
                    .bind(&record.url)
                    .bind(record.area)
                    .bind(record.rooms)
                    .bind(record.bathrooms)
                    .bind(record.scraped_at)
                    .execute(&mut *tx)
                    .await?;
                    summary.inserted += 1;
                }
            }
        }

        tx.commit().await?;
        Ok(summary)
    }
}

/// In-memory sink with the same merge semantics. Used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryListingStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    rows: Vec<StoredListing>,
    next_id: i64,
}

impl MemoryListingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> Vec<StoredListing> {
        self.inner.lock().await.rows.clone()
    }
}

#[async_trait]
impl ListingSink for MemoryListingStore {
    async fn upsert_batch(&self, records: &[ListingRecord]) -> Result<UpsertSummary, StoreError> {
        let mut inner = self.inner.lock().await;
        let mut summary = UpsertSummary::default();

        for record in records {
            match inner.rows.iter_mut().find(|row| {
                row.platform == record.platform && row.platform_code == record.platform_code
            }) {
                Some(row) => {
                    row.merge_from(record);
                    summary.updated += 1;
                }
                None => {
                    inner.next_id += 1;
                    let id = inner.next_id;
                    inner.rows.push(StoredListing::from_record(id, record));
                    summary.inserted += 1;
                }
            }
        }

        Ok(summary)
    }
}

#[derive(Debug, Clone)]
pub struct ArchivedPage {
    pub content_hash: String,
    pub path: PathBuf,
    pub deduplicated: bool,
}

/// Hash-addressed snapshots of fetched pages, written atomically. Re-fetching
/// identical markup on the same day is a no-op.
#[derive(Debug, Clone)]
pub struct PageArchive {
    root: PathBuf,
}

impl PageArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub async fn store_page(
        &self,
        scraped_at: DateTime<FixedOffset>,
        platform: Platform,
        html: &str,
    ) -> anyhow::Result<ArchivedPage> {
        let content_hash = Self::sha256_hex(html.as_bytes());
        let day = scraped_at.format("%Y%m%d").to_string();
        let path = self
            .root
            .join(day)
            .join(platform.as_str())
            .join(format!("{content_hash}.html"));

        let parent = path.parent().expect("archive path always has a parent");
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating archive directory {}", parent.display()))?;

        if fs::try_exists(&path)
            .await
            .with_context(|| format!("checking archive path {}", path.display()))?
        {
            debug!(path = %path.display(), "page already archived");
            return Ok(ArchivedPage {
                content_hash,
                path,
                deduplicated: true,
            });
        }

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp archive file {}", temp_path.display()))?;
        file.write_all(html.as_bytes())
            .await
            .with_context(|| format!("writing temp archive file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp archive file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &path).await {
            Ok(()) => Ok(ArchivedPage {
                content_hash,
                path,
                deduplicated: false,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(ArchivedPage {
                    content_hash,
                    path,
                    deduplicated: true,
                })
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err)
                    .with_context(|| format!("renaming temp archive file to {}", path.display()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use morada_core::brasilia_offset;
    use rust_decimal::Decimal;
    use std::str::FromStr;
    use tempfile::tempdir;

    fn scraped_at() -> DateTime<FixedOffset> {
        brasilia_offset()
            .with_ymd_and_hms(2025, 1, 1, 12, 0, 0)
            .single()
            .unwrap()
    }

    fn record(code: &str, price: Option<&str>, area: Option<&str>) -> ListingRecord {
        ListingRecord {
            platform: Platform::ZapImoveis,
            platform_code: code.to_string(),
            description: format!("Apartamento {code}"),
            price: price.map(|p| Decimal::from_str(p).unwrap()),
            condo_fee: None,
            location: Some("Córrego Grande, Florianópolis".into()),
            address: None,
            url: Some(format!("https://www.zapimoveis.com.br/imovel/{code}")),
            area: area.map(|a| Decimal::from_str(a).unwrap()),
            rooms: Some(Decimal::from_str("2").unwrap()),
            bathrooms: None,
            scraped_at: scraped_at(),
        }
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let store = MemoryListingStore::new();
        let batch = vec![
            record("z-1", Some("450000"), Some("72")),
            record("z-2", Some("380000.50"), None),
        ];

        let first = store.upsert_batch(&batch).await.unwrap();
        assert_eq!(first, UpsertSummary { inserted: 2, updated: 0 });

        let after_first = store.snapshot().await;
        let second = store.upsert_batch(&batch).await.unwrap();
        assert_eq!(second, UpsertSummary { inserted: 0, updated: 2 });
        assert_eq!(store.snapshot().await, after_first);
    }

    #[tokio::test]
    async fn upsert_never_clobbers_with_null() {
        let store = MemoryListingStore::new();
        store
            .upsert_batch(&[record("z-1", Some("450000"), Some("72"))])
            .await
            .unwrap();

        let summary = store
            .upsert_batch(&[record("z-1", None, None)])
            .await
            .unwrap();
        assert_eq!(summary, UpsertSummary { inserted: 0, updated: 1 });

        let rows = store.snapshot().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].price, Some(Decimal::from_str("450000").unwrap()));
        assert_eq!(rows[0].area, Some(Decimal::from_str("72").unwrap()));
    }

    #[tokio::test]
    async fn upsert_overwrites_present_fields() {
        let store = MemoryListingStore::new();
        store
            .upsert_batch(&[record("z-1", Some("450000"), None)])
            .await
            .unwrap();
        store
            .upsert_batch(&[record("z-1", Some("439000"), Some("70"))])
            .await
            .unwrap();

        let rows = store.snapshot().await;
        assert_eq!(rows[0].price, Some(Decimal::from_str("439000").unwrap()));
        assert_eq!(rows[0].area, Some(Decimal::from_str("70").unwrap()));
    }

    #[tokio::test]
    async fn archive_deduplicates_identical_pages() {
        let dir = tempdir().expect("tempdir");
        let archive = PageArchive::new(dir.path());

        let first = archive
            .store_page(scraped_at(), Platform::ImovelWeb, "<html>same</html>")
            .await
            .expect("first store");
        let second = archive
            .store_page(scraped_at(), Platform::ImovelWeb, "<html>same</html>")
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.content_hash, second.content_hash);
        assert_eq!(first.path, second.path);
        assert!(first.path.exists());
    }
}
