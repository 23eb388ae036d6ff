//! Fetch orchestrator: drains `Starting` fetch jobs one at a time.
//!
//! A job walks organisations (outer) × object types (inner) and hands each
//! pair to the registered importer. Any failure stops the job, marks it
//! `Error` and is returned to the caller; retrying means enqueueing a new job.
use anyhow::Context;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use crate::db::{self, Pool};
use crate::hail::{HailApi, TokenStore};
use crate::importer::{ImportContext, ImporterRegistry};
use crate::model::{FetchJob, FetchStatus, ObjectType};
use crate::notice::NoticeSink;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("fetch job {job_id} failed: {source:#}")]
    JobFailed {
        job_id: i64,
        #[source]
        source: anyhow::Error,
    },
    #[error("fetch queue error: {0:#}")]
    Store(#[from] anyhow::Error),
}

pub struct Fetcher {
    pool: Pool,
    api: Arc<dyn HailApi>,
    tokens: Arc<dyn TokenStore>,
    registry: ImporterRegistry,
    notices: Arc<dyn NoticeSink>,
    verbose: bool,
}

impl Fetcher {
    pub fn new(
        pool: Pool,
        api: Arc<dyn HailApi>,
        tokens: Arc<dyn TokenStore>,
        registry: ImporterRegistry,
        notices: Arc<dyn NoticeSink>,
    ) -> Self {
        Self {
            pool,
            api,
            tokens,
            registry,
            notices,
            verbose: false,
        }
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Process every `Starting` job, oldest first. Returns how many jobs this
    /// worker ran. Stops at the first failed job.
    #[instrument(skip_all)]
    pub async fn run_pending(&self) -> Result<usize, FetchError> {
        let jobs = db::starting_fetch_jobs(&self.pool).await?;
        let mut processed = 0;
        for job in jobs {
            if self.run_job(&job).await? {
                processed += 1;
            }
        }
        Ok(processed)
    }

    /// Claim and run one job. Returns `Ok(false)` if another worker claimed it first.
    #[instrument(skip_all, fields(job_id = job.id, to_fetch = %job.to_fetch))]
    pub async fn run_job(&self, job: &FetchJob) -> Result<bool, FetchError> {
        if !db::claim_fetch_job(&self.pool, job.id).await? {
            info!("fetch job already claimed, skipping");
            return Ok(false);
        }

        match self.execute(job).await {
            Ok(()) => {
                db::finish_fetch_job(&self.pool, job.id, FetchStatus::Done, None).await?;
                info!("fetch job done");
                Ok(true)
            }
            Err(source) => {
                let message = format!("{source:#}");
                error!(error = %message, "fetch job failed");
                db::finish_fetch_job(&self.pool, job.id, FetchStatus::Error, Some(&message))
                    .await?;
                self.notices
                    .error(&format!("Hail fetch job {} failed: {}", job.id, message))
                    .await;
                Err(FetchError::JobFailed {
                    job_id: job.id,
                    source,
                })
            }
        }
    }

    /// Everything after the claim. Any error here must end the job as `Error`.
    async fn execute(&self, job: &FetchJob) -> anyhow::Result<()> {
        let types = self.registry.resolve(&job.target());
        if types.is_empty() {
            warn!("no registered importer for fetch target");
        }
        let organisations = self
            .tokens
            .load()
            .await
            .context("failed to read Hail organisations")?
            .organisations;
        if organisations.is_empty() {
            warn!("no Hail organisations configured, nothing to fetch");
            return Ok(());
        }

        let total = (types.len() * organisations.len()) as i64;
        db::set_fetch_job_total(&self.pool, job.id, total).await?;
        info!(total, "fetch job started");
        self.fetch_units(job.id, &organisations, &types).await
    }

    async fn fetch_units(
        &self,
        job_id: i64,
        organisations: &[String],
        types: &[ObjectType],
    ) -> anyhow::Result<()> {
        for org_id in organisations {
            for object_type in types {
                let importer = self
                    .registry
                    .get(*object_type)
                    .with_context(|| format!("no importer registered for {}", object_type))?;
                let ctx = ImportContext {
                    api: self.api.as_ref(),
                    org_id,
                    job_id,
                    cursor: 0,
                    verbose: self.verbose,
                };
                importer.fetch_for_org(ctx).await.with_context(|| {
                    format!("importing {} for organisation {}", object_type, org_id)
                })?;
                let done = db::increment_fetch_job_done(&self.pool, job_id).await?;
                info!(done, org_id = %org_id, object_type = %object_type, "fetch unit complete");
            }
        }
        Ok(())
    }
}
