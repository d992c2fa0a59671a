use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use url::Url;

use crate::error::{AppError, Result};
use crate::models::{DatasetRecord, FilterListRecord};
use crate::pipeline::Pipeline;

const DATASETS_PATH: &str = "curtain/";
const FILTER_LISTS_PATH: &str = "data_filter_list/";

#[derive(Debug, Deserialize)]
struct Page<T> {
    results: Vec<T>,
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Listing<T> {
    Paged(Page<T>),
    Plain(Vec<T>),
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatasetDto {
    pub link_id: String,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub updated: Option<DateTime<Utc>>,
    pub file: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_enabled")]
    pub enable: bool,
    #[serde(default = "default_kind")]
    pub curtain_type: String,
}

fn default_enabled() -> bool {
    true
}

fn default_kind() -> String {
    "TP".to_string()
}

impl DatasetDto {
    /// Converts to a cache row owned by `source_site`, with a shareable
    /// link of the form `<frontend>/#/<id>`.
    pub fn into_record(self, source_site: &str, frontend: &Url) -> DatasetRecord {
        let mut link = frontend.clone();
        link.set_fragment(Some(&format!("/{}", self.link_id)));

        DatasetRecord {
            updated_at: self.updated.unwrap_or(self.created),
            created_at: self.created,
            payload_ref: self.file,
            description: self.description.unwrap_or_default(),
            enabled: self.enable,
            kind: self.curtain_type,
            source_site: source_site.to_string(),
            frontend_link: Some(link.to_string()),
            id: self.link_id,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FilterListDto {
    pub id: i64,
    pub name: String,
    pub category: String,
    pub data: String,
    #[serde(default)]
    pub default: bool,
    #[serde(default)]
    pub user: Option<i64>,
}

impl From<FilterListDto> for FilterListRecord {
    fn from(dto: FilterListDto) -> Self {
        Self {
            id: dto.id,
            name: dto.name,
            category: dto.category,
            serialized_data: dto.data,
            is_default: dto.default,
            owner_id: dto.user,
        }
    }
}

/// Curtain REST endpoints, called through the request pipeline. URLs are
/// built against the fallback address; the pipeline points them at the
/// active site.
pub struct CurtainApi {
    pipeline: Arc<Pipeline>,
    fallback: Url,
}

impl CurtainApi {
    pub fn new(pipeline: Arc<Pipeline>, fallback: Url) -> Self {
        Self { pipeline, fallback }
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        Ok(self.fallback.join(path)?)
    }

    async fn get(&self, url: Url) -> Result<Response> {
        let request = self.pipeline.client().get(url).build()?;
        let response = self.pipeline.execute(request).await?;
        check_status(response).await
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T> {
        Ok(self.get(url).await?.json().await?)
    }

    /// Collects every page of a listing endpoint.
    async fn get_listing<T: DeserializeOwned>(&self, url: Url) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut visited = HashSet::new();
        let mut current = url;
        loop {
            visited.insert(current.clone());
            let page: Listing<T> = self.get_json(current.clone()).await?;
            let next = match page {
                Listing::Plain(mut all) => {
                    items.append(&mut all);
                    None
                }
                Listing::Paged(mut page) => {
                    items.append(&mut page.results);
                    page.next
                }
            };

            let Some(next) = next else { break };
            let next = match Url::parse(&next) {
                Ok(url) => url,
                Err(_) => self.fallback.join(&next)?,
            };
            if visited.contains(&next) {
                tracing::warn!("Pagination loops back to {}; stopping", next);
                break;
            }
            current = next;
        }
        Ok(items)
    }

    pub async fn list_datasets(&self) -> Result<Vec<DatasetDto>> {
        let datasets = self.get_listing(self.endpoint(DATASETS_PATH)?).await?;
        tracing::debug!("Fetched {} datasets", datasets.len());
        Ok(datasets)
    }

    pub async fn get_dataset(&self, link_id: &str) -> Result<DatasetDto> {
        let mut url = self.endpoint(DATASETS_PATH)?;
        url.path_segments_mut()
            .map_err(|_| AppError::Config(format!("{} cannot be a base URL", self.fallback)))?
            .pop_if_empty()
            .push(link_id)
            .push("");

        match self.get_json(url).await {
            Err(AppError::Api { status: 404, .. }) => {
                Err(AppError::NotFound(format!("dataset {}", link_id)))
            }
            other => other,
        }
    }

    pub async fn list_filter_lists(&self, category: Option<&str>) -> Result<Vec<FilterListDto>> {
        let mut url = self.endpoint(FILTER_LISTS_PATH)?;
        if let Some(category) = category {
            url.query_pairs_mut().append_pair("category", category);
        }
        self.get_listing(url).await
    }
}

/// A 401 reaching this point has already been through the refresh retry.
async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::UNAUTHORIZED {
        return Err(AppError::Unauthorized);
    }
    let message = response.text().await.unwrap_or_default();
    Err(AppError::Api {
        status: status.as_u16(),
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dataset_dto_maps_to_record() {
        let dto: DatasetDto = serde_json::from_value(serde_json::json!({
            "id": 12,
            "link_id": "f4b009f3-ac3c-470a-a68b-55fcadf68d0f",
            "created": "2024-01-05T10:00:00Z",
            "file": "https://files.example/media/f4b0.json",
            "description": null,
            "enable": false,
        }))
        .unwrap();

        let frontend = Url::parse("https://curtain.proteo.info/").unwrap();
        let record = dto.into_record("https://alpha.example", &frontend);

        assert_eq!(record.id, "f4b009f3-ac3c-470a-a68b-55fcadf68d0f");
        assert_eq!(record.updated_at, record.created_at);
        assert_eq!(record.kind, "TP");
        assert_eq!(record.description, "");
        assert!(!record.enabled);
        assert_eq!(
            record.frontend_link.as_deref(),
            Some("https://curtain.proteo.info/#/f4b009f3-ac3c-470a-a68b-55fcadf68d0f")
        );
    }

    #[test]
    fn listing_accepts_pages_and_plain_arrays() {
        let paged: Listing<i64> =
            serde_json::from_str(r#"{"count": 2, "next": null, "previous": null, "results": [1, 2]}"#)
                .unwrap();
        assert!(matches!(paged, Listing::Paged(Page { ref results, .. }) if results == &[1, 2]));

        let plain: Listing<i64> = serde_json::from_str("[3]").unwrap();
        assert!(matches!(plain, Listing::Plain(ref all) if all == &[3]));
    }
}
