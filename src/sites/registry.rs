use futures::stream::Stream;
use tokio::sync::{watch, Mutex};
use url::Url;

use crate::db::Repository;
use crate::error::Result;
use crate::models::Site;
use crate::pipeline::BaseAddressSource;

/// Known backends plus a live view of the active one, so resolving the base
/// address on every request never touches the database. The view follows
/// every write to the sites table, whichever handle made it.
pub struct SiteRegistry {
    repository: Repository,
    active: watch::Receiver<Option<Site>>,
    switch: Mutex<()>,
}

impl SiteRegistry {
    pub async fn load(repository: Repository) -> Result<Self> {
        let active = repository.watch_active_site();
        Ok(Self {
            repository,
            active,
            switch: Mutex::new(()),
        })
    }

    /// Address of the active site, or `None` when requests should fall back
    /// to the default backend.
    pub fn get_active_base_address(&self) -> Option<Url> {
        let active = self.active.borrow();
        let site = active.as_ref()?;
        let address = site.address();
        if address.is_none() {
            tracing::warn!("Active site {:?} has no usable address", site.hostname);
        }
        address
    }

    pub fn active_hostname(&self) -> Option<String> {
        self.active.borrow().as_ref().map(|site| site.hostname.clone())
    }

    /// Live view of every registered site.
    pub fn list_sites(&self) -> impl Stream<Item = Result<Vec<Site>>> + Send + 'static {
        self.repository.observe_sites()
    }

    pub async fn sites(&self) -> Result<Vec<Site>> {
        self.repository.get_all_sites().await
    }

    /// Adds a site or updates its key and notes. The active flag and sync
    /// time of an existing row are kept; `site.active` activates it.
    pub async fn register(&self, site: Site) -> Result<()> {
        let _switch = self.switch.lock().await;
        let activate = site.active;
        let hostname = site.hostname.clone();

        let merged = match self.repository.get_site(&site.hostname).await? {
            Some(existing) => Site {
                active: existing.active,
                last_sync: existing.last_sync,
                ..site
            },
            None => Site {
                active: false,
                ..site
            },
        };
        self.repository.upsert_site(merged).await?;

        if activate {
            self.activate_locked(&hostname).await?;
        }
        Ok(())
    }

    /// Makes `hostname` the only active site.
    pub async fn activate(&self, hostname: &str) -> Result<()> {
        let _switch = self.switch.lock().await;
        self.activate_locked(hostname).await
    }

    async fn activate_locked(&self, hostname: &str) -> Result<()> {
        self.repository.activate_site(hostname).await?;
        tracing::info!("Active site is now {}", hostname);
        Ok(())
    }

    /// Deletes a site together with its cached datasets. Returns whether the
    /// removed site was the active one.
    pub async fn remove(&self, hostname: &str) -> Result<bool> {
        let _switch = self.switch.lock().await;
        let was_active = self.active_hostname().as_deref() == Some(hostname);
        if self.repository.delete_site(hostname).await? {
            tracing::info!("Removed site {}", hostname);
        }
        Ok(was_active)
    }
}

impl BaseAddressSource for SiteRegistry {
    fn active_base_address(&self) -> Option<Url> {
        self.get_active_base_address()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn no_sites_means_no_address() {
        let registry = SiteRegistry::load(Repository::in_memory().await.unwrap())
            .await
            .unwrap();
        assert!(registry.get_active_base_address().is_none());
    }

    #[tokio::test]
    async fn activation_updates_resolved_address() {
        let registry = SiteRegistry::load(Repository::in_memory().await.unwrap())
            .await
            .unwrap();
        registry.register(Site::new("https://alpha.example")).await.unwrap();
        registry.register(Site::new("http://beta.example:8080")).await.unwrap();
        assert!(registry.get_active_base_address().is_none());

        registry.activate("https://alpha.example").await.unwrap();
        assert_eq!(
            registry.get_active_base_address().unwrap().as_str(),
            "https://alpha.example/"
        );

        registry.activate("http://beta.example:8080").await.unwrap();
        let address = registry.get_active_base_address().unwrap();
        assert_eq!(address.host_str(), Some("beta.example"));
        assert_eq!(address.port(), Some(8080));
    }

    #[tokio::test]
    async fn active_site_survives_reload() {
        let repo = Repository::in_memory().await.unwrap();
        let registry = SiteRegistry::load(repo.clone()).await.unwrap();
        let mut site = Site::new("https://alpha.example");
        site.active = true;
        registry.register(site).await.unwrap();

        let reopened = SiteRegistry::load(repo).await.unwrap();
        assert_eq!(reopened.active_hostname().as_deref(), Some("https://alpha.example"));
    }

    #[tokio::test]
    async fn re_registering_keeps_activation() {
        let registry = SiteRegistry::load(Repository::in_memory().await.unwrap())
            .await
            .unwrap();
        registry.register(Site::new("https://alpha.example")).await.unwrap();
        registry.activate("https://alpha.example").await.unwrap();

        registry
            .register(Site::new("https://alpha.example").with_api_key("secret"))
            .await
            .unwrap();

        let site = &registry.sites().await.unwrap()[0];
        assert!(site.active);
        assert_eq!(site.api_key.as_deref(), Some("secret"));
    }

    #[tokio::test]
    async fn removing_active_site_falls_back() {
        let registry = SiteRegistry::load(Repository::in_memory().await.unwrap())
            .await
            .unwrap();
        registry.register(Site::new("https://alpha.example")).await.unwrap();
        registry.activate("https://alpha.example").await.unwrap();

        assert!(registry.remove("https://alpha.example").await.unwrap());
        assert!(registry.get_active_base_address().is_none());
    }

    #[tokio::test]
    async fn follows_direct_cache_writes() {
        let repo = Repository::in_memory().await.unwrap();
        let registry = SiteRegistry::load(repo.clone()).await.unwrap();

        let mut alpha = Site::new("https://alpha.example");
        alpha.active = true;
        repo.upsert_site(alpha.clone()).await.unwrap();
        assert_eq!(registry.active_hostname().as_deref(), Some("https://alpha.example"));

        alpha.active = false;
        assert!(repo.update_site(alpha).await.unwrap());
        assert!(registry.get_active_base_address().is_none());

        repo.upsert_site(Site::new("http://beta.example:8080")).await.unwrap();
        repo.activate_site("http://beta.example:8080").await.unwrap();
        assert_eq!(
            registry.get_active_base_address().unwrap().as_str(),
            "http://beta.example:8080/"
        );

        assert!(repo.delete_site("http://beta.example:8080").await.unwrap());
        assert!(registry.active_hostname().is_none());
    }
}
