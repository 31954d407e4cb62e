//! Sonarr / Radarr v3 API client.
//!
//! Both managers share the same API shape; only resource names and the
//! rescan command differ.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::config::MediaManagerConfig;
use crate::metrics;
use crate::snapshot::FileNode;

use super::types::{
    EntryLayout, MediaEntry, MediaKind, MediaManager, MediaManagerError, NotifyOutcome,
};

/// Which *arr application a client talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StarrFlavor {
    Sonarr,
    Radarr,
}

impl StarrFlavor {
    fn name(self) -> &'static str {
        match self {
            StarrFlavor::Sonarr => "sonarr",
            StarrFlavor::Radarr => "radarr",
        }
    }

    fn kind(self) -> MediaKind {
        match self {
            StarrFlavor::Sonarr => MediaKind::Series,
            StarrFlavor::Radarr => MediaKind::Movie,
        }
    }

    fn resource(self) -> &'static str {
        match self {
            StarrFlavor::Sonarr => "series",
            StarrFlavor::Radarr => "movie",
        }
    }

    fn file_resource(self) -> &'static str {
        match self {
            StarrFlavor::Sonarr => "episodefile",
            StarrFlavor::Radarr => "moviefile",
        }
    }

    fn id_param(self) -> &'static str {
        match self {
            StarrFlavor::Sonarr => "seriesId",
            StarrFlavor::Radarr => "movieId",
        }
    }

    fn rescan_command(self) -> &'static str {
        match self {
            StarrFlavor::Sonarr => "RescanSeries",
            StarrFlavor::Radarr => "RescanMovie",
        }
    }
}

/// Sonarr or Radarr client.
pub struct StarrClient {
    client: Client,
    base_url: String,
    api_key: String,
    flavor: StarrFlavor,
}

impl StarrClient {
    /// Create a new client.
    pub fn new(flavor: StarrFlavor, config: &MediaManagerConfig) -> Result<Self, MediaManagerError> {
        if config.api_key.is_empty() {
            return Err(MediaManagerError::NotConfigured(format!(
                "{} API key is required",
                flavor.name()
            )));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs as u64))
            .build()?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            flavor,
        })
    }

    pub fn sonarr(config: &MediaManagerConfig) -> Result<Self, MediaManagerError> {
        Self::new(StarrFlavor::Sonarr, config)
    }

    pub fn radarr(config: &MediaManagerConfig) -> Result<Self, MediaManagerError> {
        Self::new(StarrFlavor::Radarr, config)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v3/{}", self.base_url, path)
    }

    fn parse_id(&self, entry_id: &str) -> Result<i64, MediaManagerError> {
        entry_id.parse().map_err(|_| {
            MediaManagerError::NotFound(format!("{} id '{}'", self.flavor.name(), entry_id))
        })
    }

    async fn send(&self, request: RequestBuilder, method: &str) -> Result<Response, MediaManagerError> {
        metrics::EXTERNAL_REQUESTS_TOTAL
            .with_label_values(&[self.flavor.name(), method])
            .inc();

        let response = request.header("X-Api-Key", &self.api_key).send().await?;

        let status = response.status();
        if status == 404 {
            let url = response.url().to_string();
            return Err(MediaManagerError::NotFound(url));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MediaManagerError::ApiError {
                status: status.as_u16(),
                message: body,
            });
        }
        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, MediaManagerError> {
        let request = self.client.get(self.url(path)).query(query);
        let response = self.send(request, "get").await?;
        response.json().await.map_err(|e| {
            MediaManagerError::ParseError(format!(
                "Failed to parse {} response from {}: {}",
                path,
                self.flavor.name(),
                e
            ))
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StarrEntity {
    id: i64,
    title: String,
    #[serde(default)]
    original_title: Option<String>,
    #[serde(default)]
    alternate_titles: Vec<StarrAlternateTitle>,
    #[serde(default)]
    year: Option<u32>,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    seasons: Vec<StarrSeason>,
}

#[derive(Debug, Deserialize)]
struct StarrAlternateTitle {
    title: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StarrSeason {
    season_number: u32,
    #[serde(default = "default_monitored")]
    monitored: bool,
    #[serde(default)]
    statistics: Option<StarrSeasonStatistics>,
}

fn default_monitored() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StarrSeasonStatistics {
    #[serde(default)]
    episode_file_count: u32,
}

impl StarrSeason {
    /// Monitored season with files on disk. Missing statistics count as files.
    fn has_files(&self) -> bool {
        self.season_number > 0
            && self.monitored
            && self
                .statistics
                .as_ref()
                .map(|s| s.episode_file_count > 0)
                .unwrap_or(true)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StarrFile {
    #[serde(default)]
    relative_path: Option<String>,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    size: i64,
}

impl StarrEntity {
    fn into_media_entry(self, kind: MediaKind) -> Option<MediaEntry> {
        let path = self.path.filter(|p| !p.is_empty())?;

        let mut alternates: Vec<String> = Vec::new();
        if let Some(original) = self.original_title.filter(|t| *t != self.title) {
            alternates.push(original);
        }
        for alt in self.alternate_titles {
            if alt.title != self.title && !alternates.contains(&alt.title) {
                alternates.push(alt.title);
            }
        }

        let seasons: BTreeSet<u32> = self
            .seasons
            .iter()
            .filter(|s| s.has_files())
            .map(|s| s.season_number)
            .collect();

        Some(
            MediaEntry::new(self.id.to_string(), kind, self.title, path)
                .with_alternate_titles(alternates)
                .with_seasons(seasons.into_iter().collect())
                .with_year(self.year.filter(|y| *y > 0)),
        )
    }
}

/// Expected layout from the manager's tracked files.
fn layout_from_files(root: &Path, files: Vec<StarrFile>) -> EntryLayout {
    let mut directories = BTreeSet::new();
    let mut expected = Vec::new();

    for file in files {
        let relative = match (file.relative_path, file.path) {
            (Some(rel), _) if !rel.is_empty() => rel,
            (_, Some(abs)) => match Path::new(&abs).strip_prefix(root) {
                Ok(rel) => rel.to_string_lossy().into_owned(),
                Err(_) => continue,
            },
            _ => continue,
        };
        let relative = relative.replace('\\', "/");

        let mut parent = relative.as_str();
        while let Some((dir, _)) = parent.rsplit_once('/') {
            directories.insert(dir.to_string());
            parent = dir;
        }
        expected.push(FileNode::file(relative, file.size.max(0) as u64, None));
    }

    let mut nodes: Vec<FileNode> = directories.into_iter().map(FileNode::directory).collect();
    nodes.extend(expected);
    nodes.sort_by(FileNode::restore_order);

    EntryLayout {
        root: root.to_path_buf(),
        expected: nodes,
    }
}

#[async_trait]
impl MediaManager for StarrClient {
    fn name(&self) -> &str {
        self.flavor.name()
    }

    fn kind(&self) -> MediaKind {
        self.flavor.kind()
    }

    async fn list_catalog(&self) -> Result<Vec<MediaEntry>, MediaManagerError> {
        let entities: Vec<StarrEntity> = self.get_json(self.flavor.resource(), &[]).await?;
        let kind = self.flavor.kind();
        let catalog: Vec<MediaEntry> = entities
            .into_iter()
            .filter_map(|e| e.into_media_entry(kind))
            .collect();
        debug!(manager = self.name(), entries = catalog.len(), "Fetched catalog");
        Ok(catalog)
    }

    async fn get_entry_layout(&self, entry_id: &str) -> Result<EntryLayout, MediaManagerError> {
        let id = self.parse_id(entry_id)?;
        let entity: StarrEntity = self
            .get_json(&format!("{}/{}", self.flavor.resource(), id), &[])
            .await?;
        let root = entity.path.ok_or_else(|| {
            MediaManagerError::ParseError(format!("{} {} has no path", self.flavor.resource(), id))
        })?;

        let files: Vec<StarrFile> = self
            .get_json(
                self.flavor.file_resource(),
                &[(self.flavor.id_param(), id.to_string())],
            )
            .await?;

        Ok(layout_from_files(Path::new(&root), files))
    }

    async fn notify_path_changed(
        &self,
        entry_id: &str,
        new_root: &Path,
    ) -> Result<NotifyOutcome, MediaManagerError> {
        let id = self.parse_id(entry_id)?;
        let resource_path = format!("{}/{}", self.flavor.resource(), id);
        let new_root_str = new_root.to_string_lossy().into_owned();

        let mut entity: Value = self.get_json(&resource_path, &[]).await?;
        let unchanged = entity.get("path").and_then(Value::as_str) == Some(new_root_str.as_str());

        let outcome = if unchanged {
            NotifyOutcome::Unchanged
        } else {
            let object = entity.as_object_mut().ok_or_else(|| {
                MediaManagerError::ParseError(format!("{} is not an object", resource_path))
            })?;
            object.insert("path".to_string(), Value::String(new_root_str.clone()));

            let request = self
                .client
                .put(self.url(&resource_path))
                .query(&[("moveFiles", "false")])
                .json(&entity);
            self.send(request, "put").await?;
            info!(
                manager = self.name(),
                entry_id,
                path = %new_root_str,
                "Updated media manager path"
            );
            NotifyOutcome::Updated
        };

        let mut command = Map::new();
        command.insert(
            "name".to_string(),
            Value::from(self.flavor.rescan_command()),
        );
        command.insert(self.flavor.id_param().to_string(), Value::from(id));
        let request = self.client.post(self.url("command")).json(&command);
        self.send(request, "post").await?;

        Ok(outcome)
    }
}
