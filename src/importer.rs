//! Per-type importers and the registry the fetch orchestrator resolves them from.
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::db::{self, ObjectLink, Pool};
use crate::hail::client::{id_of, name_of};
use crate::hail::HailApi;
use crate::model::{FetchTarget, HailObject, ObjectType};

/// Everything an importer needs for one `(organisation, type)` unit.
#[derive(Clone, Copy)]
pub struct ImportContext<'a> {
    pub api: &'a dyn HailApi,
    pub org_id: &'a str,
    pub job_id: i64,
    /// Listing offset to start from.
    pub cursor: usize,
    pub verbose: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ImportStats {
    pub seen: usize,
    pub imported: usize,
    pub skipped: usize,
}

/// Imports one remote object type. Must be safe to call again for the same
/// organisation: a failed fetch is only ever recovered by running it again.
#[async_trait]
pub trait Importer: Send + Sync {
    fn object_type(&self) -> ObjectType;

    async fn fetch_for_org(&self, ctx: ImportContext<'_>) -> Result<ImportStats>;
}

/// Paginates an organisation's listing and upserts stale or missing records.
#[derive(Debug, Clone)]
pub struct ListingImporter {
    object_type: ObjectType,
    pool: Pool,
    page_size: usize,
}

impl ListingImporter {
    pub fn new(object_type: ObjectType, pool: Pool, page_size: usize) -> Self {
        Self {
            object_type,
            pool,
            page_size: page_size.max(1),
        }
    }

    async fn is_fresh(
        &self,
        hail_id: &str,
        refresh_rate: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let fetched_at = db::object_fetched_at(&self.pool, self.object_type, hail_id).await?;
        Ok(fetched_at.is_some_and(|at| now - at < refresh_rate))
    }

    async fn store(&self, org_id: &str, hail_id: &str, payload: Value) -> Result<()> {
        let object = HailObject {
            object_type: self.object_type,
            hail_id: hail_id.to_string(),
            org_id: org_id.to_string(),
            name: name_of(&payload),
            fetched_at: Utc::now(),
            payload,
        };
        db::upsert_object(&self.pool, &object).await?;
        let links = extract_links(&object.payload);
        db::replace_object_links(&self.pool, self.object_type, hail_id, &links).await?;
        Ok(())
    }
}

#[async_trait]
impl Importer for ListingImporter {
    fn object_type(&self) -> ObjectType {
        self.object_type
    }

    #[instrument(
        skip_all,
        fields(object_type = %self.object_type, org_id = %ctx.org_id, job_id = ctx.job_id)
    )]
    async fn fetch_for_org(&self, ctx: ImportContext<'_>) -> Result<ImportStats> {
        let listing = self.object_type.listing_uri(ctx.org_id);
        let refresh_rate = ctx.api.refresh_rate();
        let now = Utc::now();
        let mut stats = ImportStats::default();
        let mut offset = ctx.cursor;
        let mut listed: HashSet<String> = HashSet::new();

        loop {
            let params = [
                ("limit", self.page_size.to_string()),
                ("offset", offset.to_string()),
            ];
            let page = ctx
                .api
                .try_get(&listing, &params)
                .await
                .with_context(|| format!("failed to list {} at offset {}", listing, offset))?;
            let items = page_items(&page);
            let mut new_on_page = 0;

            for item in items {
                let Some(hail_id) = id_of(item) else {
                    debug!(?item, "listing entry without id");
                    continue;
                };
                if !listed.insert(hail_id.clone()) {
                    continue;
                }
                new_on_page += 1;
                stats.seen += 1;

                if self.is_fresh(&hail_id, refresh_rate, now).await? {
                    stats.skipped += 1;
                    continue;
                }

                let payload = if self.object_type.listing_is_complete() {
                    item.clone()
                } else {
                    ctx.api
                        .get_one(self.object_type, &hail_id)
                        .await
                        .with_context(|| {
                            format!("failed to fetch {} {}", self.object_type, hail_id)
                        })?
                };
                self.store(ctx.org_id, &hail_id, payload).await?;
                stats.imported += 1;

                if ctx.verbose {
                    info!(hail_id = %hail_id, "imported");
                } else {
                    debug!(hail_id = %hail_id, "imported");
                }
            }

            if items.len() < self.page_size {
                break;
            }
            // A full page of ids already listed means the remote is not
            // honouring `offset`; paging further would never end.
            if new_on_page == 0 {
                warn!(offset, "listing page repeated earlier entries, stopping");
                break;
            }
            offset += items.len();
        }

        info!(
            seen = stats.seen,
            imported = stats.imported,
            skipped = stats.skipped,
            "import finished"
        );
        Ok(stats)
    }
}

/// Items of a listing page: a bare array or `{"data": [...]}`.
fn page_items(page: &Value) -> &[Value] {
    match page {
        Value::Array(items) => items.as_slice(),
        Value::Object(map) => match map.get("data") {
            Some(Value::Array(items)) => items.as_slice(),
            _ => &[],
        },
        _ => &[],
    }
}

/// Embedded relations worth keeping: tags, hero media and publication articles.
pub fn extract_links(payload: &Value) -> Vec<ObjectLink> {
    const MANY: [(&str, ObjectType); 3] = [
        ("tags", ObjectType::PublicTag),
        ("private_tags", ObjectType::PrivateTag),
        ("articles", ObjectType::Article),
    ];
    const ONE: [(&str, ObjectType); 2] = [
        ("hero_image", ObjectType::Image),
        ("hero_video", ObjectType::Video),
    ];

    let mut links = Vec::new();
    for (key, linked_type) in MANY {
        if let Some(Value::Array(items)) = payload.get(key) {
            links.extend(items.iter().filter_map(id_of).map(|id| ObjectLink {
                linked_type,
                linked_hail_id: id,
            }));
        }
    }
    for (key, linked_type) in ONE {
        if let Some(id) = payload.get(key).and_then(id_of) {
            links.push(ObjectLink {
                linked_type,
                linked_hail_id: id,
            });
        }
    }
    links
}

/// Explicit map from object type to the importer that handles it.
#[derive(Clone, Default)]
pub struct ImporterRegistry {
    importers: BTreeMap<ObjectType, Arc<dyn Importer>>,
}

impl ImporterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every known object type backed by a [`ListingImporter`].
    pub fn standard(pool: &Pool, page_size: usize) -> Self {
        let mut registry = Self::new();
        for object_type in ObjectType::ALL {
            registry.register(Arc::new(ListingImporter::new(
                object_type,
                pool.clone(),
                page_size,
            )));
        }
        registry
    }

    pub fn register(&mut self, importer: Arc<dyn Importer>) {
        self.importers.insert(importer.object_type(), importer);
    }

    pub fn get(&self, object_type: ObjectType) -> Option<&Arc<dyn Importer>> {
        self.importers.get(&object_type)
    }

    pub fn types(&self) -> Vec<ObjectType> {
        self.importers.keys().copied().collect()
    }

    /// Types a job should fetch: the whole registry for the wildcard, the
    /// named type when registered, nothing otherwise.
    pub fn resolve(&self, target: &FetchTarget) -> Vec<ObjectType> {
        match target {
            FetchTarget::All => self.types(),
            FetchTarget::Type(t) if self.importers.contains_key(t) => vec![*t],
            FetchTarget::Type(_) | FetchTarget::Unknown(_) => Vec::new(),
        }
    }
}
