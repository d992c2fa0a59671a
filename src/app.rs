use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use url::Url;

use crate::auth::CredentialStore;
use crate::config::Config;
use crate::db::Repository;
use crate::error::{AppError, Result};
use crate::link;
use crate::models::{DatasetRecord, FilterListRecord, Site};
use crate::pipeline::{self, BaseUrlRewrite, BearerAuth, Pipeline};
use crate::services::{CurtainApi, Downloader, ProgressFn};
use crate::sites::SiteRegistry;

/// Wires the cache, site registry, credentials and request pipeline
/// together and exposes the sync operations the UI layer calls.
pub struct App {
    pub repository: Repository,
    pub sites: Arc<SiteRegistry>,
    pub credentials: Arc<CredentialStore>,
    api: CurtainApi,
    downloader: Downloader,
    fallback: Url,
    frontend: Url,
}

impl App {
    pub async fn new(config: &Config) -> Result<Self> {
        let repository = Repository::new(&config.db_path).await?;
        Self::with_repository(config, repository).await
    }

    pub async fn with_repository(config: &Config, repository: Repository) -> Result<Self> {
        let fallback = Url::parse(&config.fallback_base_url)?;
        let frontend = Url::parse(&config.frontend_base_url)?;
        let client = pipeline::http_client(config.connect_timeout(), config.read_timeout())?;

        let sites = Arc::new(SiteRegistry::load(repository.clone()).await?);
        let credentials = Arc::new(CredentialStore::new(
            client.clone(),
            sites.clone(),
            fallback.clone(),
        ));

        // Base-address rewrite must run before credentials are attached.
        let requests = Pipeline::builder(client.clone())
            .connect_retries(config.connect_retries)
            .with(BaseUrlRewrite::new(sites.clone()))
            .with(BearerAuth::new(credentials.clone()))
            .build();

        Ok(Self {
            repository,
            sites,
            credentials,
            api: CurtainApi::new(Arc::new(requests), fallback.clone()),
            downloader: Downloader::new(client),
            fallback,
            frontend,
        })
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<()> {
        self.credentials.obtain(username, password).await
    }

    /// Activates a site and forgets the previous site's credentials.
    /// Cached datasets from other sites stay until they are re-fetched.
    pub async fn switch_site(&self, hostname: &str) -> Result<()> {
        self.sites.activate(hostname).await?;
        self.credentials.clear();
        Ok(())
    }

    pub async fn remove_site(&self, hostname: &str) -> Result<()> {
        if self.sites.remove(hostname).await? {
            self.credentials.clear();
        }
        Ok(())
    }

    /// Hostname that fetched records are attributed to. Without an active
    /// site the fallback backend is registered on first use.
    async fn source_site(&self) -> Result<String> {
        if let Some(hostname) = self.sites.active_hostname() {
            return Ok(hostname);
        }

        let hostname = self.fallback.origin().ascii_serialization();
        if self.repository.get_site(&hostname).await?.is_none() {
            self.sites.register(Site::new(hostname.clone())).await?;
        }
        Ok(hostname)
    }

    /// Fetches every dataset from the active backend and writes them to the
    /// cache as one batch.
    pub async fn sync_datasets(&self) -> Result<usize> {
        let source = self.source_site().await?;
        let records: Vec<DatasetRecord> = self
            .api
            .list_datasets()
            .await?
            .into_iter()
            .map(|dto| dto.into_record(&source, &self.frontend))
            .collect();

        let count = self.repository.upsert_datasets(records).await?;
        self.repository.touch_site_sync(&source, Utc::now()).await?;
        tracing::info!("Synced {} datasets from {}", count, source);
        Ok(count)
    }

    pub async fn fetch_dataset(&self, id: &str) -> Result<DatasetRecord> {
        let source = self.source_site().await?;
        let record = self
            .api
            .get_dataset(id)
            .await?
            .into_record(&source, &self.frontend);
        self.repository.upsert_dataset(record.clone()).await?;
        Ok(record)
    }

    /// Resolves a scanned or pasted share link. Links without a dataset id
    /// give `Ok(None)`.
    pub async fn open_shared_link(&self, raw: &str) -> Result<Option<DatasetRecord>> {
        let Some(id) = link::extract_record_id(raw) else {
            tracing::debug!("No dataset id in {:?}", raw);
            return Ok(None);
        };
        self.fetch_dataset(&id).await.map(Some)
    }

    pub async fn sync_filter_lists(&self, category: Option<&str>) -> Result<usize> {
        let lists: Vec<FilterListRecord> = self
            .api
            .list_filter_lists(category)
            .await?
            .into_iter()
            .map(FilterListRecord::from)
            .collect();
        let count = self.repository.upsert_filter_lists(lists).await?;
        tracing::info!("Synced {} filter lists", count);
        Ok(count)
    }

    /// Downloads a cached dataset's full payload into `dir`.
    pub async fn download_payload(
        &self,
        id: &str,
        dir: &Path,
        on_progress: Option<&ProgressFn>,
    ) -> Result<PathBuf> {
        let record = self
            .repository
            .get_dataset(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("dataset {}", id)))?;

        let destination = dir.join(payload_file_name(&record));
        self.downloader
            .download_to_path(&record.payload_ref, &destination, on_progress)
            .await
    }
}

fn payload_file_name(record: &DatasetRecord) -> String {
    Url::parse(&record.payload_ref)
        .ok()
        .and_then(|url| {
            url.path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| format!("{}.json", record.id))
}
