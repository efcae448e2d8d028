//! Region sync orchestration: region configuration, merge, canonical writes, scheduling.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use parksync_adapters::{
    adapter_for, AdapterError, Credentials, FetchContext, NameOverride, NormalizeContext,
    ProviderAdapter, ProviderDescriptor, RawRecord,
};
use parksync_core::{
    entity_id, slug, url_slug, CanonicalFragment, CanonicalPark, CanonicalTrail, Coordinates,
    LinkType, NearDuplicate, OfficialLink, ParkCategory, ParkFragment, RecordMetadata, RegionIndex,
    RunErrorKind, RunStatus, SourceAttribution, SyncPhase, SyncRun, TrailFragment, TrailSummary,
};
use parksync_storage::{
    read_json, write_json, FsObjectStore, HttpClientConfig, HttpFetcher, ObjectStore, PutOutcome,
    StoreError,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "parksync-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub store_dir: PathBuf,
    pub regions_path: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub region_concurrency: usize,
    pub write_concurrency: usize,
    pub link_timeout_secs: u64,
    pub link_pace_ms: u64,
    pub merge: MergeConfig,
    pub credentials: Credentials,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from("./store"),
            regions_path: PathBuf::from("./regions.yaml"),
            user_agent: "parksync/0.1".to_string(),
            http_timeout_secs: 30,
            region_concurrency: 2,
            write_concurrency: 8,
            link_timeout_secs: 10,
            link_pace_ms: 500,
            merge: MergeConfig::default(),
            credentials: Credentials::new(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let mut credentials = Credentials::new();
        if let Ok(key) = std::env::var("RIDB_API_KEY") {
            if !key.trim().is_empty() {
                credentials = credentials.with("ridb", key.trim());
            }
        }
        Self {
            store_dir: std::env::var("PARKSYNC_STORE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.store_dir),
            regions_path: std::env::var("PARKSYNC_REGIONS")
                .map(PathBuf::from)
                .unwrap_or(defaults.regions_path),
            user_agent: std::env::var("PARKSYNC_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("PARKSYNC_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            region_concurrency: env_parse("PARKSYNC_REGION_CONCURRENCY", defaults.region_concurrency),
            write_concurrency: env_parse("PARKSYNC_WRITE_CONCURRENCY", defaults.write_concurrency),
            link_timeout_secs: env_parse("PARKSYNC_LINK_TIMEOUT_SECS", defaults.link_timeout_secs),
            link_pace_ms: env_parse("PARKSYNC_LINK_PACE_MS", defaults.link_pace_ms),
            merge: MergeConfig {
                policy: std::env::var("PARKSYNC_MERGE_POLICY")
                    .ok()
                    .and_then(|v| MergePolicy::parse(&v))
                    .unwrap_or_default(),
                ..defaults.merge
            },
            credentials,
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceRole {
    #[default]
    Primary,
    Supplementary,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default)]
    pub role: SourceRole,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(flatten)]
    pub descriptor: ProviderDescriptor,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authority {
    pub name: String,
    #[serde(default)]
    pub url: Option<String>,
}

/// One jurisdiction's sources, lookup tables, and cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionConfig {
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub authority: Authority,
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default)]
    pub link_templates: BTreeMap<LinkType, String>,
    #[serde(default)]
    pub designations: BTreeMap<String, String>,
    #[serde(default)]
    pub name_overrides: Vec<NameOverride>,
    pub sources: Vec<SourceConfig>,
}

impl RegionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.code.is_empty() || !self.code.chars().all(|c| c.is_ascii_alphanumeric()) {
            bail!("region code {:?} must be non-empty ASCII alphanumerics", self.code);
        }
        if !self
            .sources
            .iter()
            .any(|s| s.enabled && s.role == SourceRole::Primary)
        {
            bail!("region {} has no enabled primary source", self.code);
        }
        let mut seen = BTreeSet::new();
        for source in &self.sources {
            if !seen.insert(source.descriptor.provider_id.as_str()) {
                bail!(
                    "region {} lists provider {} twice",
                    self.code,
                    source.descriptor.provider_id
                );
            }
        }
        Ok(())
    }

    pub fn normalize_context(&self) -> NormalizeContext {
        NormalizeContext {
            region: self.code.clone(),
            designations: self.designations.clone(),
            name_overrides: self.name_overrides.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegionRegistry {
    pub regions: Vec<RegionConfig>,
}

impl RegionRegistry {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text).context("parsing region registry")?;
        let mut codes = BTreeSet::new();
        for region in &registry.regions {
            region.validate()?;
            if !codes.insert(region.code.to_ascii_lowercase()) {
                bail!("region {} is defined twice", region.code);
            }
        }
        Ok(registry)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("loading {}", path.display()))
    }

    /// All regions, or just the one whose code matches `code` (case-insensitive).
    pub fn select(&self, code: Option<&str>) -> Result<Vec<RegionConfig>> {
        match code {
            None => Ok(self.regions.clone()),
            Some(code) => {
                let found = self
                    .regions
                    .iter()
                    .filter(|r| r.code.eq_ignore_ascii_case(code))
                    .cloned()
                    .collect::<Vec<_>>();
                if found.is_empty() {
                    bail!("unknown region {code}");
                }
                Ok(found)
            }
        }
    }
}

/// What happens when a fresh fragment matches an entity that already exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Keep existing values, fill absent ones, union list-like fields.
    #[default]
    FillMissing,
    /// Leave the existing entity as it is.
    SkipOnMatch,
}

impl MergePolicy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "fill_missing" => Some(Self::FillMissing),
            "skip_on_match" => Some(Self::SkipOnMatch),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MergeConfig {
    pub policy: MergePolicy,
    /// Same-slug entities further apart than this are distinct places.
    pub collision_km: f64,
    pub review_threshold: f64,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            policy: MergePolicy::FillMissing,
            collision_km: 50.0,
            review_threshold: 0.94,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CanonicalState {
    pub parks: BTreeMap<String, CanonicalPark>,
    pub trails: BTreeMap<String, CanonicalTrail>,
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("{entity_id}: fragment from {provider_id} is {distance_km:.1} km from the existing entity")]
pub struct MergeConflict {
    pub entity_id: String,
    pub provider_id: String,
    pub distance_km: f64,
}

#[derive(Debug, Clone, Default)]
pub struct MergeOutcome {
    pub state: CanonicalState,
    /// Ids created or matched this run; only these are rewritten.
    pub touched_parks: BTreeSet<String>,
    pub touched_trails: BTreeSet<String>,
    pub created_parks: BTreeSet<String>,
    pub created_trails: BTreeSet<String>,
    pub processed: usize,
    pub carried_forward: usize,
    pub conflicts: Vec<MergeConflict>,
    pub reviews: Vec<NearDuplicate>,
}

impl MergeOutcome {
    pub fn created(&self) -> usize {
        self.created_parks.len() + self.created_trails.len()
    }

    pub fn updated(&self) -> usize {
        self.touched_parks.len() + self.touched_trails.len() - self.created()
    }
}

/// Reconciles a normalized batch against the stored canonical set for one region.
///
/// Entities are keyed by `entity_id(region, name)`. Existing entities that the
/// batch does not mention are carried forward untouched, so an empty or partial
/// fetch never drops stored data.
#[derive(Debug, Clone, Default)]
pub struct MergeEngine {
    config: MergeConfig,
}

impl MergeEngine {
    pub fn new(config: MergeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MergeConfig {
        &self.config
    }

    pub fn merge(
        &self,
        region: &str,
        existing: CanonicalState,
        fragments: Vec<CanonicalFragment>,
        now: DateTime<Utc>,
    ) -> MergeOutcome {
        let stored_ids = existing
            .parks
            .keys()
            .chain(existing.trails.keys())
            .cloned()
            .collect::<BTreeSet<_>>();
        let mut out = MergeOutcome {
            state: existing,
            ..Default::default()
        };
        let mut parent_hints = BTreeMap::new();

        for fragment in fragments {
            out.processed += 1;
            match fragment {
                CanonicalFragment::Park(park) => self.merge_park(region, park, now, &mut out),
                CanonicalFragment::Trail(trail) => {
                    let parent = trail.park_name.clone();
                    if let Some(id) = self.merge_trail(region, trail, now, &mut out) {
                        if let Some(parent) = parent {
                            parent_hints.entry(id).or_insert(parent);
                        }
                    }
                }
            }
        }

        link_trails_to_parks(region, &parent_hints, &mut out);

        out.carried_forward = stored_ids
            .iter()
            .filter(|id| !out.touched_parks.contains(*id) && !out.touched_trails.contains(*id))
            .count();
        out.reviews = self.near_duplicates(&out);
        out
    }

    fn collision(&self, a: Option<Coordinates>, b: Option<Coordinates>) -> Option<f64> {
        let distance = a?.distance_km(&b?);
        (distance > self.config.collision_km).then_some(distance)
    }

    fn merge_park(
        &self,
        region: &str,
        fragment: ParkFragment,
        now: DateTime<Utc>,
        out: &mut MergeOutcome,
    ) {
        let id = entity_id(region, &fragment.name);
        let Some(park) = out.state.parks.get_mut(&id) else {
            out.state
                .parks
                .insert(id.clone(), CanonicalPark::from_fragment(region, &fragment, now));
            out.created_parks.insert(id.clone());
            out.touched_parks.insert(id);
            return;
        };
        if let Some(distance_km) = self.collision(park.coordinates, fragment.coordinates) {
            out.conflicts.push(MergeConflict {
                entity_id: id,
                provider_id: fragment.provider_id,
                distance_km,
            });
            return;
        }
        if self.config.policy == MergePolicy::FillMissing {
            fill_park(park, &fragment);
        }
        out.touched_parks.insert(id);
    }

    fn merge_trail(
        &self,
        region: &str,
        fragment: TrailFragment,
        now: DateTime<Utc>,
        out: &mut MergeOutcome,
    ) -> Option<String> {
        let id = entity_id(region, &fragment.name);
        let Some(trail) = out.state.trails.get_mut(&id) else {
            out.state
                .trails
                .insert(id.clone(), CanonicalTrail::from_fragment(region, &fragment, now));
            out.created_trails.insert(id.clone());
            out.touched_trails.insert(id.clone());
            return Some(id);
        };
        if let Some(distance_km) = self.collision(trail.trailhead, fragment.trailhead) {
            out.conflicts.push(MergeConflict {
                entity_id: id,
                provider_id: fragment.provider_id,
                distance_km,
            });
            return None;
        }
        if self.config.policy == MergePolicy::FillMissing {
            fill_trail(trail, &fragment);
        }
        out.touched_trails.insert(id.clone());
        Some(id)
    }

    fn near_duplicates(&self, out: &MergeOutcome) -> Vec<NearDuplicate> {
        let keyed = out
            .state
            .parks
            .values()
            .map(|p| (p.id.as_str(), slug(&p.name)))
            .collect::<Vec<_>>();
        let mut reviews = Vec::new();
        for (i, (id_a, slug_a)) in keyed.iter().enumerate() {
            for (id_b, slug_b) in &keyed[i + 1..] {
                if !out.touched_parks.contains(*id_a) && !out.touched_parks.contains(*id_b) {
                    continue;
                }
                let score = jaro_winkler(slug_a, slug_b);
                if score >= self.config.review_threshold {
                    reviews.push(NearDuplicate {
                        id_a: id_a.to_string(),
                        id_b: id_b.to_string(),
                        score,
                    });
                }
            }
        }
        reviews.sort_by(|a, b| b.score.total_cmp(&a.score));
        reviews
    }
}

fn fill<T: Clone>(slot: &mut Option<T>, candidate: &Option<T>) {
    if slot.is_none() {
        slot.clone_from(candidate);
    }
}

fn fill_park(park: &mut CanonicalPark, fragment: &ParkFragment) {
    fill(&mut park.designation, &fragment.designation);
    if park.category == ParkCategory::Other {
        if let Some(category) = fragment
            .category
            .or_else(|| fragment.designation.as_deref().map(ParkCategory::from_designation))
        {
            park.category = category;
        }
    }
    fill(&mut park.coordinates, &fragment.coordinates);
    fill(&mut park.acreage, &fragment.acreage);
    fill(&mut park.popularity, &fragment.popularity);
    fill(&mut park.contact.phone, &fragment.contact.phone);
    fill(&mut park.contact.email, &fragment.contact.email);
    fill(&mut park.contact.website, &fragment.contact.website);
    fill(&mut park.contact.address, &fragment.contact.address);
    for link in &fragment.links {
        park.add_link(link.clone());
    }
    for campground in &fragment.campgrounds {
        park.add_campground(campground.clone());
    }
    park.activities.extend(fragment.activities.iter().cloned());
    if let Some(external_id) = &fragment.external_id {
        park.external_ids
            .entry(fragment.provider_id.clone())
            .or_insert_with(|| external_id.clone());
    }
    park.metadata.add_source(&fragment.provider_id);
}

fn fill_trail(trail: &mut CanonicalTrail, fragment: &TrailFragment) {
    fill(&mut trail.length_miles, &fragment.length_miles);
    fill(&mut trail.trailhead, &fragment.trailhead);
    // explicit difficulty supersedes a length-based guess
    let explicit = fragment.difficulty.filter(|_| !fragment.difficulty_inferred);
    if trail.difficulty.is_none() || (trail.difficulty_inferred && explicit.is_some()) {
        trail.difficulty = fragment.difficulty;
        trail.difficulty_inferred = fragment.difficulty_inferred;
    }
    trail.allowed_uses.extend(fragment.allowed_uses.iter().copied());
    if !trail
        .sources
        .iter()
        .any(|s| s.provider_id == fragment.provider_id)
    {
        trail.sources.push(SourceAttribution {
            provider_id: fragment.provider_id.clone(),
            external_id: fragment.external_id.clone(),
        });
    }
    trail.metadata.add_source(&fragment.provider_id);
}

/// Resolves trail parents by name and refreshes each park's nested trail list.
fn link_trails_to_parks(region: &str, hints: &BTreeMap<String, String>, out: &mut MergeOutcome) {
    for (trail_id, park_name) in hints {
        let park_id = entity_id(region, park_name);
        if !out.state.parks.contains_key(&park_id) {
            continue;
        }
        if let Some(trail) = out.state.trails.get_mut(trail_id) {
            if trail.park_id.is_none() {
                trail.park_id = Some(park_id);
            }
        }
    }

    let mut by_park: BTreeMap<String, Vec<TrailSummary>> = BTreeMap::new();
    for trail in out.state.trails.values() {
        if let Some(park_id) = &trail.park_id {
            by_park.entry(park_id.clone()).or_default().push(TrailSummary {
                id: trail.id.clone(),
                name: trail.name.clone(),
                length_miles: trail.length_miles,
            });
        }
    }

    for (park_id, mut summaries) in by_park {
        let Some(park) = out.state.parks.get_mut(&park_id) else {
            continue;
        };
        for previous in &park.trails {
            if !summaries.iter().any(|s| s.id == previous.id) {
                summaries.push(previous.clone());
            }
        }
        summaries.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        if park.trails != summaries {
            park.trails = summaries;
            out.touched_parks.insert(park_id);
        }
    }
}

/// Renders `{slug}`, `{url_slug}`, `{name}` and `{external_id}` for one park.
/// Substituted values are percent-encoded.
pub fn render_link_template(template: &str, park: &CanonicalPark) -> Option<String> {
    let mut url = template
        .replace("{slug}", &urlencoding::encode(&slug(&park.name)))
        .replace("{url_slug}", &urlencoding::encode(&url_slug(&park.name)))
        .replace("{name}", &urlencoding::encode(&park.name));
    if url.contains("{external_id}") {
        let external_id = park.external_ids.values().next()?;
        url = url.replace("{external_id}", &urlencoding::encode(external_id));
    }
    Some(url)
}

/// Adds templated links to touched parks that lack a link of that type.
pub fn apply_link_templates(
    templates: &BTreeMap<LinkType, String>,
    outcome: &mut MergeOutcome,
) -> usize {
    let mut added = 0;
    for id in &outcome.touched_parks {
        let Some(park) = outcome.state.parks.get_mut(id) else {
            continue;
        };
        for (link_type, template) in templates {
            if park.has_link(*link_type) {
                continue;
            }
            if let Some(url) = render_link_template(template, park) {
                let link = OfficialLink {
                    link_type: *link_type,
                    url,
                    title: None,
                };
                if park.add_link(link) {
                    added += 1;
                }
            }
        }
    }
    added
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("writing {entity_id}: {source}")]
    Store {
        entity_id: String,
        #[source]
        source: StoreError,
    },
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("primary provider {provider_id} failed: {source}")]
    PrimaryFetch {
        provider_id: String,
        #[source]
        source: AdapterError,
    },
    #[error("loading canonical state for {region}: {source}")]
    LoadState {
        region: String,
        #[source]
        source: StoreError,
    },
}

impl SyncError {
    fn kind(&self) -> RunErrorKind {
        match self {
            Self::PrimaryFetch { .. } => RunErrorKind::Transport,
            Self::LoadState { .. } => RunErrorKind::Store,
        }
    }

    fn provider_id(&self) -> Option<&str> {
        match self {
            Self::PrimaryFetch { provider_id, .. } => Some(provider_id.as_str()),
            _ => None,
        }
    }
}

/// Records that carry [`RecordMetadata`] stamped by the store writer.
pub trait Versioned {
    fn id(&self) -> &str;
    fn metadata(&self) -> &RecordMetadata;
    fn metadata_mut(&mut self) -> &mut RecordMetadata;
}

impl Versioned for CanonicalPark {
    fn id(&self) -> &str {
        &self.id
    }

    fn metadata(&self) -> &RecordMetadata {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut RecordMetadata {
        &mut self.metadata
    }
}

impl Versioned for CanonicalTrail {
    fn id(&self) -> &str {
        &self.id
    }

    fn metadata(&self) -> &RecordMetadata {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut RecordMetadata {
        &mut self.metadata
    }
}

/// Canonical object layout on top of an [`ObjectStore`].
#[derive(Clone)]
pub struct CanonicalStore {
    store: Arc<dyn ObjectStore>,
}

impl CanonicalStore {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    pub fn open_dir(dir: impl Into<PathBuf>) -> Self {
        Self::new(Arc::new(FsObjectStore::new(dir)))
    }

    pub fn object_store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn park_key(region: &str, id: &str) -> String {
        format!("regions/{}/parks/{id}.json", region.to_ascii_lowercase())
    }

    pub fn trail_key(region: &str, id: &str) -> String {
        format!("regions/{}/trails/{id}.json", region.to_ascii_lowercase())
    }

    pub fn index_key(region: &str) -> String {
        format!("regions/{}/index.json", region.to_ascii_lowercase())
    }

    pub fn run_key(region: &str, run_id: Uuid) -> String {
        format!("regions/{}/runs/{run_id}.json", region.to_ascii_lowercase())
    }

    /// Loads every stored park and trail for a region. Objects that fail to
    /// decode are left out and returned alongside the state.
    pub async fn load_state(
        &self,
        region: &str,
    ) -> Result<(CanonicalState, Vec<StoreError>), StoreError> {
        let region = region.to_ascii_lowercase();
        let mut skipped = Vec::new();
        let parks = self
            .load_all(&format!("regions/{region}/parks/"), &mut skipped)
            .await?;
        let trails = self
            .load_all(&format!("regions/{region}/trails/"), &mut skipped)
            .await?;
        Ok((CanonicalState { parks, trails }, skipped))
    }

    async fn load_all<T>(
        &self,
        prefix: &str,
        skipped: &mut Vec<StoreError>,
    ) -> Result<BTreeMap<String, T>, StoreError>
    where
        T: Versioned + DeserializeOwned + Send,
    {
        let mut records = BTreeMap::new();
        for key in self.store.list(prefix).await? {
            if !key.ends_with(".json") {
                continue;
            }
            match read_json::<T>(self.store.as_ref(), &key).await {
                Ok(Some(record)) => {
                    records.insert(record.id().to_string(), record);
                }
                Ok(None) => {}
                Err(err @ StoreError::Decode { .. }) => {
                    warn!(key = %key, error = %err, "skipping undecodable record");
                    skipped.push(err);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(records)
    }

    pub async fn read_park(&self, region: &str, id: &str) -> Result<Option<CanonicalPark>, StoreError> {
        read_json(self.store.as_ref(), &Self::park_key(region, id)).await
    }

    pub async fn read_trail(&self, region: &str, id: &str) -> Result<Option<CanonicalTrail>, StoreError> {
        read_json(self.store.as_ref(), &Self::trail_key(region, id)).await
    }

    pub async fn read_index(&self, region: &str) -> Result<Option<RegionIndex>, StoreError> {
        read_json(self.store.as_ref(), &Self::index_key(region)).await
    }

    pub async fn read_run(&self, region: &str, run_id: Uuid) -> Result<Option<SyncRun>, StoreError> {
        read_json(self.store.as_ref(), &Self::run_key(region, run_id)).await
    }

    pub async fn write_park(
        &self,
        park: CanonicalPark,
        now: DateTime<Utc>,
    ) -> Result<CanonicalPark, WriteError> {
        let key = Self::park_key(&park.region, &park.id);
        self.write_versioned(key, park, now).await
    }

    pub async fn write_trail(
        &self,
        trail: CanonicalTrail,
        now: DateTime<Utc>,
    ) -> Result<CanonicalTrail, WriteError> {
        let key = Self::trail_key(&trail.region, &trail.id);
        self.write_versioned(key, trail, now).await
    }

    /// Reads the stored copy first: `createdAt` is kept, `version` goes up by one.
    async fn write_versioned<T>(
        &self,
        key: String,
        mut record: T,
        now: DateTime<Utc>,
    ) -> Result<T, WriteError>
    where
        T: Versioned + Serialize + DeserializeOwned + Send + Sync,
    {
        let entity_id = record.id().to_string();
        let wrap = |source: StoreError| WriteError::Store {
            entity_id: entity_id.clone(),
            source,
        };
        let previous = match read_json::<T>(self.store.as_ref(), &key).await {
            Err(err @ StoreError::Decode { .. }) => {
                warn!(key = %key, error = %err, "overwriting undecodable record");
                None
            }
            other => other.map_err(wrap)?,
        };

        let meta = record.metadata_mut();
        match previous {
            Some(prev) => {
                meta.created_at = prev.metadata().created_at;
                meta.version = prev.metadata().version + 1;
            }
            None => meta.version = 1,
        }
        meta.updated_at = now;
        let version = meta.version;

        write_json(self.store.as_ref(), &key, &record)
            .await
            .map_err(wrap)?;
        debug!(key = %key, version, "record written");
        Ok(record)
    }

    pub async fn write_index(&self, index: &RegionIndex) -> Result<PutOutcome, StoreError> {
        write_json(self.store.as_ref(), &Self::index_key(&index.region), index).await
    }

    pub async fn write_run(&self, run: &SyncRun) -> Result<PutOutcome, StoreError> {
        write_json(self.store.as_ref(), &Self::run_key(&run.region, run.run_id), run).await
    }
}

pub struct RegisteredSource {
    pub role: SourceRole,
    pub adapter: Box<dyn ProviderAdapter>,
}

/// Drives one region through fetch, normalize, merge and write.
///
/// A failing primary provider fails the run before anything canonical is
/// written; the run record itself is always persisted.
pub struct RegionSyncer {
    region: RegionConfig,
    sources: Vec<RegisteredSource>,
    http: Arc<HttpFetcher>,
    store: CanonicalStore,
    merge: MergeEngine,
    credentials: Credentials,
    write_concurrency: usize,
    phase: SyncPhase,
}

impl RegionSyncer {
    pub fn new(
        region: RegionConfig,
        sources: Vec<RegisteredSource>,
        http: Arc<HttpFetcher>,
        store: CanonicalStore,
    ) -> Self {
        Self {
            region,
            sources,
            http,
            store,
            merge: MergeEngine::default(),
            credentials: Credentials::new(),
            write_concurrency: 8,
            phase: SyncPhase::Idle,
        }
    }

    /// Builds adapters for every enabled source through the provider registry.
    pub fn from_config(
        region: RegionConfig,
        http: Arc<HttpFetcher>,
        store: CanonicalStore,
        config: &SyncConfig,
    ) -> Self {
        let sources = region
            .sources
            .iter()
            .filter(|s| s.enabled)
            .map(|s| RegisteredSource {
                role: s.role,
                adapter: adapter_for(&s.descriptor),
            })
            .collect();
        Self::new(region, sources, http, store)
            .with_merge_config(config.merge)
            .with_credentials(config.credentials.clone())
            .with_write_concurrency(config.write_concurrency)
    }

    pub fn with_merge_config(mut self, config: MergeConfig) -> Self {
        self.merge = MergeEngine::new(config);
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_write_concurrency(mut self, write_concurrency: usize) -> Self {
        self.write_concurrency = write_concurrency.max(1);
        self
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    fn advance(&mut self, run: &mut SyncRun, next: SyncPhase) {
        if !self.phase.can_advance_to(next) {
            warn!(from = ?self.phase, to = ?next, "unexpected phase transition");
        }
        debug!(from = ?self.phase, to = ?next, "phase");
        self.phase = next;
        run.phase = next;
    }

    pub async fn run(&mut self) -> SyncRun {
        self.phase = SyncPhase::Idle;
        let mut run = SyncRun::start(&self.region.code, Utc::now());
        let span = info_span!("region_sync", region = %run.region, run_id = %run.run_id);
        async move {
            info!("region sync started");
            match self.execute(&mut run).await {
                Ok(()) => {
                    self.advance(&mut run, SyncPhase::Complete);
                    run.status = RunStatus::Completed;
                }
                Err(err) => {
                    error!(error = %err, "region sync failed");
                    run.record_error(err.kind(), err.provider_id(), None, err.to_string());
                    self.advance(&mut run, SyncPhase::Failed);
                    run.status = RunStatus::Failed;
                }
            }
            run.finished_at = Some(Utc::now());
            if let Err(err) = self.store.write_run(&run).await {
                error!(error = %err, "writing run metadata failed");
                run.record_error(
                    RunErrorKind::Store,
                    None,
                    None,
                    format!("writing run metadata: {err}"),
                );
            }
            info!(
                status = ?run.status,
                processed = run.processed,
                created = run.created,
                updated = run.updated,
                failed = run.failed,
                carried_forward = run.carried_forward,
                "region sync finished"
            );
            run
        }
        .instrument(span)
        .await
    }

    async fn fetch_role(
        &self,
        run: &mut SyncRun,
        role: SourceRole,
        ctx: &FetchContext,
    ) -> Result<Vec<(usize, Vec<RawRecord>)>, SyncError> {
        let mut batches = Vec::new();
        for (idx, source) in self.sources.iter().enumerate() {
            if source.role != role {
                continue;
            }
            let provider_id = source.adapter.provider_id();
            match source.adapter.fetch(&self.http, ctx).await {
                Ok(records) => {
                    info!(provider_id, records = records.len(), "provider fetched");
                    run.source_stats_mut(provider_id).fetched = records.len();
                    batches.push((idx, records));
                }
                Err(source) if role == SourceRole::Primary => {
                    return Err(SyncError::PrimaryFetch {
                        provider_id: provider_id.to_string(),
                        source,
                    });
                }
                Err(err) => {
                    warn!(provider_id, error = %err, "supplementary provider failed, continuing");
                    run.source_stats_mut(provider_id);
                    run.record_error(RunErrorKind::Transport, Some(provider_id), None, err.to_string());
                }
            }
        }
        Ok(batches)
    }

    fn normalize(
        &self,
        run: &mut SyncRun,
        batches: &[(usize, Vec<RawRecord>)],
    ) -> Vec<CanonicalFragment> {
        let ctx = self.region.normalize_context();
        let mut fragments = Vec::new();
        for (idx, records) in batches {
            let adapter = &self.sources[*idx].adapter;
            let provider_id = adapter.provider_id();
            for record in records {
                match adapter.normalize(record, &ctx) {
                    Ok(fragment) => {
                        run.source_stats_mut(provider_id).normalized += 1;
                        fragments.push(fragment);
                    }
                    Err(err) if err.is_exclusion() => {
                        debug!(provider_id, reason = %err, "record excluded");
                        run.source_stats_mut(provider_id).skipped += 1;
                    }
                    Err(err) => {
                        warn!(provider_id, error = %err, "record skipped");
                        run.source_stats_mut(provider_id).failed += 1;
                        run.failed += 1;
                        run.record_error(
                            RunErrorKind::Normalization,
                            Some(provider_id),
                            None,
                            err.to_string(),
                        );
                    }
                }
            }
        }
        fragments
    }

    async fn execute(&mut self, run: &mut SyncRun) -> Result<(), SyncError> {
        let region = self.region.code.clone();
        let ctx = FetchContext {
            region: region.clone(),
            credentials: self.credentials.clone(),
        };

        self.advance(run, SyncPhase::FetchingPrimary);
        let mut batches = self.fetch_role(run, SourceRole::Primary, &ctx).await?;

        if self
            .sources
            .iter()
            .any(|s| s.role == SourceRole::Supplementary)
        {
            self.advance(run, SyncPhase::FetchingSupplementary);
            batches.extend(self.fetch_role(run, SourceRole::Supplementary, &ctx).await?);
        }

        self.advance(run, SyncPhase::Normalizing);
        let fragments = self.normalize(run, &batches);
        drop(batches);

        self.advance(run, SyncPhase::Merging);
        let (existing, skipped) = self
            .store
            .load_state(&region)
            .await
            .map_err(|source| SyncError::LoadState {
                region: region.clone(),
                source,
            })?;
        for err in skipped {
            run.record_error(RunErrorKind::Store, None, None, format!("skipped stored record: {err}"));
        }
        let now = Utc::now();
        let previous = existing.clone();
        let mut outcome = self.merge.merge(&region, existing, fragments, now);
        let templated = apply_link_templates(&self.region.link_templates, &mut outcome);
        for conflict in &outcome.conflicts {
            warn!(entity_id = %conflict.entity_id, provider_id = %conflict.provider_id, "slug collision");
            run.record_error(
                RunErrorKind::MergeConflict,
                Some(&conflict.provider_id),
                Some(&conflict.entity_id),
                conflict.to_string(),
            );
        }
        run.failed += outcome.conflicts.len();
        run.processed = outcome.processed;
        run.created = outcome.created();
        run.updated = outcome.updated();
        run.carried_forward = outcome.carried_forward;
        run.reviews = outcome.reviews.clone();
        info!(
            processed = outcome.processed,
            templated,
            reviews = outcome.reviews.len(),
            "merge complete"
        );

        self.advance(run, SyncPhase::Writing);
        self.write_entities(run, &mut outcome, &previous, now).await;
        let index = RegionIndex::build(&region, outcome.state.parks.values(), now);
        if let Err(err) = self.store.write_index(&index).await {
            error!(error = %err, "index write failed");
            run.record_error(
                RunErrorKind::Store,
                None,
                None,
                format!("writing index for {region}: {err}"),
            );
        }
        Ok(())
    }

    /// Writes trails, then parks. A failed write puts the stored copy back into
    /// `outcome.state` so the index is always built from what is on disk.
    async fn write_entities(
        &self,
        run: &mut SyncRun,
        outcome: &mut MergeOutcome,
        previous: &CanonicalState,
        now: DateTime<Utc>,
    ) {
        let store = &self.store;
        let limit = self.write_concurrency;

        let trails = outcome
            .touched_trails
            .iter()
            .filter_map(|id| outcome.state.trails.get(id).cloned())
            .collect::<Vec<_>>();
        let trail_results = stream::iter(trails)
            .map(|trail| async move {
                let id = trail.id.clone();
                (id, store.write_trail(trail, now).await)
            })
            .buffer_unordered(limit)
            .collect::<Vec<_>>()
            .await;
        for (id, result) in trail_results {
            match result {
                Ok(written) => {
                    outcome.state.trails.insert(id, written);
                }
                Err(err) => {
                    warn!(entity_id = %id, error = %err, "trail write failed");
                    restore_trail(outcome, previous, &id);
                    run.failed += 1;
                    run.record_error(RunErrorKind::Write, None, Some(&id), err.to_string());
                }
            }
        }

        let parks = outcome
            .touched_parks
            .iter()
            .filter_map(|id| outcome.state.parks.get(id).cloned())
            .collect::<Vec<_>>();
        let park_results = stream::iter(parks)
            .map(|park| async move {
                let id = park.id.clone();
                (id, store.write_park(park, now).await)
            })
            .buffer_unordered(limit)
            .collect::<Vec<_>>()
            .await;
        for (id, result) in park_results {
            match result {
                Ok(written) => {
                    outcome.state.parks.insert(id, written);
                }
                Err(err) => {
                    warn!(entity_id = %id, error = %err, "park write failed");
                    match previous.parks.get(&id) {
                        Some(stored) => {
                            outcome.state.parks.insert(id.clone(), stored.clone());
                        }
                        None => {
                            outcome.state.parks.remove(&id);
                        }
                    }
                    run.failed += 1;
                    run.record_error(RunErrorKind::Write, None, Some(&id), err.to_string());
                }
            }
        }
    }
}

/// Rolls one trail back to its stored copy, along with its summary on the parent park.
fn restore_trail(outcome: &mut MergeOutcome, previous: &CanonicalState, id: &str) {
    let parent = outcome
        .state
        .trails
        .get(id)
        .and_then(|t| t.park_id.clone());
    match previous.trails.get(id) {
        Some(stored) => {
            outcome.state.trails.insert(id.to_string(), stored.clone());
        }
        None => {
            outcome.state.trails.remove(id);
        }
    }

    let Some(park_id) = parent else {
        return;
    };
    let Some(park) = outcome.state.parks.get_mut(&park_id) else {
        return;
    };
    let stored_summary = previous
        .parks
        .get(&park_id)
        .and_then(|p| p.trails.iter().find(|s| s.id == id))
        .cloned();
    match (park.trails.iter().position(|s| s.id == id), stored_summary) {
        (Some(pos), Some(summary)) => park.trails[pos] = summary,
        (Some(pos), None) => {
            park.trails.remove(pos);
        }
        (None, Some(summary)) => park.trails.push(summary),
        (None, None) => {}
    }
}

/// Runs every region with at most `region_concurrency` in flight.
///
/// Regions share the HTTP transport (and its per-provider rate limiters) but
/// never the same store objects, so one region's failure stays local.
pub async fn run_regions(
    config: &SyncConfig,
    regions: Vec<RegionConfig>,
    http: Arc<HttpFetcher>,
    store: CanonicalStore,
) -> Vec<SyncRun> {
    let mut runs = stream::iter(regions)
        .map(|region| {
            let http = http.clone();
            let store = store.clone();
            async move {
                let mut syncer = RegionSyncer::from_config(region, http, store, config);
                syncer.run().await
            }
        })
        .buffer_unordered(config.region_concurrency.max(1))
        .collect::<Vec<_>>()
        .await;
    runs.sort_by(|a, b| a.region.cmp(&b.region));
    runs
}

/// Loads the region registry named by `config` and runs the selected regions once.
pub async fn run_sync(config: &SyncConfig, region: Option<&str>) -> Result<Vec<SyncRun>> {
    let registry = RegionRegistry::load(&config.regions_path).await?;
    let regions = registry.select(region)?;
    let http = Arc::new(HttpFetcher::new(config.http_client_config())?);
    let store = CanonicalStore::open_dir(config.store_dir.clone());
    Ok(run_regions(config, regions, http, store).await)
}


/// One cron job per region that declares a `cron` expression.
pub async fn build_scheduler(
    config: SyncConfig,
    regions: Vec<RegionConfig>,
    http: Arc<HttpFetcher>,
    store: CanonicalStore,
) -> Result<Option<JobScheduler>> {
    let scheduled = regions
        .into_iter()
        .filter_map(|r| r.cron.clone().map(|cron| (cron, r)))
        .collect::<Vec<_>>();
    if scheduled.is_empty() {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let config = Arc::new(config);
    for (cron, region) in scheduled {
        let code = region.code.clone();
        let (config, http, store) = (config.clone(), http.clone(), store.clone());
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let region = region.clone();
            let (config, http, store) = (config.clone(), http.clone(), store.clone());
            Box::pin(async move {
                let mut syncer = RegionSyncer::from_config(region, http, store, &config);
                let run = syncer.run().await;
                info!(region = %run.region, status = ?run.status, "scheduled sync finished");
            })
        })
        .with_context(|| format!("creating scheduler job for {code} ({cron})"))?;
        sched.add(job).await.context("adding scheduler job")?;
        info!(region = %code, cron = %cron, "region sync scheduled");
    }
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use parksync_adapters::{NormalizationError, ProviderKind};
    use parksync_core::{CampgroundSummary, ContactInfo, Difficulty, IndexEntry, TrailUse};
    use parksync_storage::{BackoffPolicy, MemoryObjectStore, TokenBucketConfig, TransportError};
    use tempfile::tempdir;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, hour, 0, 0).single().unwrap()
    }

    fn fixture_bytes(kind: &str, file: &str) -> Vec<u8> {
        let path = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../fixtures")
            .join(kind)
            .join(file);
        std::fs::read(path).expect("read fixture")
    }

    /// Serves fixed fragments, or fails the fetch like an unreachable provider.
    struct StaticAdapter {
        provider_id: String,
        fragments: Vec<CanonicalFragment>,
        fail: bool,
    }

    impl StaticAdapter {
        fn boxed(provider_id: &str, fragments: Vec<CanonicalFragment>) -> Box<dyn ProviderAdapter> {
            Box::new(Self {
                provider_id: provider_id.to_string(),
                fragments,
                fail: false,
            })
        }

        fn failing(provider_id: &str) -> Box<dyn ProviderAdapter> {
            Box::new(Self {
                provider_id: provider_id.to_string(),
                fragments: Vec::new(),
                fail: true,
            })
        }
    }

    #[async_trait]
    impl ProviderAdapter for StaticAdapter {
        fn provider_id(&self) -> &str {
            &self.provider_id
        }

        fn kind(&self) -> ProviderKind {
            ProviderKind::FeatureQueryParks
        }

        async fn fetch(
            &self,
            _http: &HttpFetcher,
            _ctx: &FetchContext,
        ) -> Result<Vec<RawRecord>, AdapterError> {
            if self.fail {
                return Err(AdapterError::Transport(TransportError::HttpStatus {
                    status: 503,
                    url: "http://provider.invalid/query".into(),
                }));
            }
            Ok((0..self.fragments.len())
                .map(|i| {
                    let mut attrs = serde_json::Map::new();
                    attrs.insert("i".into(), serde_json::Value::from(i));
                    RawRecord::from_attributes(attrs)
                })
                .collect())
        }

        fn normalize(
            &self,
            record: &RawRecord,
            _ctx: &NormalizeContext,
        ) -> Result<CanonicalFragment, NormalizationError> {
            let i = record
                .attributes
                .get("i")
                .and_then(serde_json::Value::as_u64)
                .unwrap_or(u64::MAX) as usize;
            self.fragments
                .get(i)
                .cloned()
                .ok_or(NormalizationError::MissingName {
                    external_id: Some(i.to_string()),
                })
        }
    }

    fn park(provider: &str, name: &str) -> ParkFragment {
        ParkFragment {
            provider_id: provider.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    fn at(lat: f64, lon: f64) -> Option<Coordinates> {
        Coordinates::new(lat, lon)
    }

    fn wi_region() -> RegionConfig {
        RegionConfig {
            code: "WI".into(),
            name: "Wisconsin".into(),
            authority: Authority::default(),
            cron: None,
            link_templates: BTreeMap::new(),
            designations: BTreeMap::new(),
            name_overrides: Vec::new(),
            sources: Vec::new(),
        }
    }

    fn test_http() -> Arc<HttpFetcher> {
        Arc::new(
            HttpFetcher::new(HttpClientConfig {
                timeout: Duration::from_secs(5),
                backoff: BackoffPolicy {
                    max_retries: 0,
                    base_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(1),
                },
                rate_limit: TokenBucketConfig {
                    capacity: 100,
                    refill_every: Duration::from_millis(1),
                },
                ..Default::default()
            })
            .unwrap(),
        )
    }

    fn syncer(store: &CanonicalStore, sources: Vec<(SourceRole, Box<dyn ProviderAdapter>)>) -> RegionSyncer {
        RegionSyncer::new(
            wi_region(),
            sources
                .into_iter()
                .map(|(role, adapter)| RegisteredSource { role, adapter })
                .collect(),
            test_http(),
            store.clone(),
        )
    }

    fn devils_lake_providers() -> Vec<(SourceRole, Box<dyn ProviderAdapter>)> {
        let dnr = ParkFragment {
            designation: Some("State Park".into()),
            coordinates: at(43.42, -89.725),
            external_id: Some("1".into()),
            contact: ContactInfo {
                website: Some("https://dnr.wisconsin.gov/topic/parks/devilslake".into()),
                ..Default::default()
            },
            links: vec![OfficialLink {
                link_type: LinkType::Official,
                url: "https://dnr.wisconsin.gov/topic/parks/devilslake".into(),
                title: None,
            }],
            ..park("wi-dnr", "Devil's Lake State Park")
        };
        let gis = ParkFragment {
            acreage: Some(9217.4),
            coordinates: at(43.43, -89.72),
            contact: ContactInfo {
                phone: Some("608-356-8301".into()),
                ..Default::default()
            },
            ..park("wi-gis", "Devils Lake State Park")
        };
        vec![
            (SourceRole::Primary, StaticAdapter::boxed("wi-dnr", vec![CanonicalFragment::Park(dnr)])),
            (SourceRole::Supplementary, StaticAdapter::boxed("wi-gis", vec![CanonicalFragment::Park(gis)])),
        ]
    }

    fn ridb_campground() -> (SourceRole, Box<dyn ProviderAdapter>) {
        let ridb = ParkFragment {
            coordinates: at(43.41, -89.73),
            campgrounds: vec![CampgroundSummary {
                name: "Devils Lake Campground".into(),
                sites: Some(407),
                reservable: Some(true),
                reservation_url: Some("https://www.recreation.gov/camping/campgrounds/232401".into()),
                source_id: "ridb".into(),
            }],
            activities: vec!["Camping".into()],
            ..park("ridb", "Devils Lake")
        };
        (SourceRole::Supplementary, StaticAdapter::boxed("ridb", vec![CanonicalFragment::Park(ridb)]))
    }

    #[test]
    fn region_registry_parses_and_validates() {
        let yaml = r#"
regions:
  - code: WI
    name: Wisconsin
    authority: { name: Wisconsin DNR, url: "https://dnr.wisconsin.gov" }
    cron: "0 0 5 * * *"
    link_templates:
      official: "https://dnr.wisconsin.gov/topic/parks/{slug}"
    designations: { SP: State Park }
    name_overrides:
      - contains: maintenance
        exclude: true
    sources:
      - provider_id: wi-dnr-parks
        kind: feature_query_parks
        endpoint:
          base_url: "https://example.invalid/query"
          filters: { where: "PROP_TYPE IN ('SP','SF')" }
        rate_limit: { capacity: 2, refill_ms: 500 }
      - provider_id: ridb-wi
        kind: ridb_facilities
        role: supplementary
        credential: ridb
        endpoint:
          base_url: "https://ridb.recreation.gov/api/v1/facilities"
          page_size: 50
          filters: { state: WI, full: "true" }
"#;
        let registry = RegionRegistry::from_yaml(yaml).unwrap();
        let wi = &registry.select(Some("wi")).unwrap()[0];
        assert_eq!(wi.sources.len(), 2);
        assert_eq!(wi.sources[0].role, SourceRole::Primary);
        assert_eq!(wi.sources[0].descriptor.endpoint.page_size, 1000);
        assert_eq!(
            wi.sources[0].descriptor.rate_limit.map(|r| r.refill_every),
            Some(Duration::from_millis(500))
        );
        assert_eq!(wi.sources[1].descriptor.kind, ProviderKind::RidbFacilities);
        assert_eq!(wi.link_templates.len(), 1);
        assert!(registry.select(Some("MN")).is_err());

        let no_primary = yaml.replace("        role: supplementary\n", "").replace(
            "      - provider_id: wi-dnr-parks\n",
            "      - provider_id: wi-dnr-parks\n        role: supplementary\n",
        );
        assert!(RegionRegistry::from_yaml(&no_primary).is_ok());
        let all_supplementary = yaml.replace(
            "      - provider_id: wi-dnr-parks\n",
            "      - provider_id: wi-dnr-parks\n        role: supplementary\n",
        );
        assert!(RegionRegistry::from_yaml(&all_supplementary).is_err());
    }

    #[test]
    fn same_slug_collapses_into_one_entity() {
        let engine = MergeEngine::default();
        let out = engine.merge(
            "WI",
            CanonicalState::default(),
            vec![
                CanonicalFragment::Park(ParkFragment { coordinates: at(43.42, -89.72), ..park("a", "Devil's Lake State Park") }),
                CanonicalFragment::Park(ParkFragment { acreage: Some(9217.4), ..park("b", "Devils Lake State Park") }),
            ],
            ts(1),
        );
        assert_eq!(out.state.parks.len(), 1);
        let merged = &out.state.parks["wi-devilslake"];
        assert_eq!(merged.name, "Devil's Lake State Park");
        assert_eq!(merged.acreage, Some(9217.4));
        assert_eq!(merged.metadata.sources, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(out.processed, 2);
        assert_eq!(out.created(), 1);
        assert_eq!(out.updated(), 0);
    }

    #[test]
    fn empty_batch_carries_everything_forward() {
        let engine = MergeEngine::default();
        let first = engine.merge(
            "WI",
            CanonicalState::default(),
            ["Peninsula", "Devil's Lake", "Mirror Lake"]
                .into_iter()
                .map(|n| CanonicalFragment::Park(park("a", n)))
                .collect(),
            ts(1),
        );
        let before = first.state.clone();
        let second = engine.merge("WI", first.state, Vec::new(), ts(2));
        assert_eq!(second.state, before);
        assert_eq!(second.carried_forward, 3);
        assert!(second.touched_parks.is_empty());
        assert_eq!(second.processed, 0);
    }

    #[test]
    fn fill_missing_never_overwrites_existing_values() {
        let engine = MergeEngine::default();
        let first = engine.merge(
            "WI",
            CanonicalState::default(),
            vec![CanonicalFragment::Park(ParkFragment {
                acreage: Some(100.0),
                activities: vec!["Hiking".into()],
                ..park("a", "Peninsula State Park")
            })],
            ts(1),
        );
        let out = engine.merge(
            "WI",
            first.state,
            vec![CanonicalFragment::Park(ParkFragment {
                acreage: Some(3776.0),
                popularity: Some(1_000_000),
                designation: Some("State Park".into()),
                activities: vec!["Camping".into()],
                ..park("b", "Peninsula")
            })],
            ts(2),
        );
        let p = &out.state.parks["wi-peninsula"];
        assert_eq!(p.acreage, Some(100.0));
        assert_eq!(p.popularity, Some(1_000_000));
        assert_eq!(p.category, ParkCategory::StatePark);
        assert_eq!(p.activities.len(), 2);
        assert_eq!(out.updated(), 1);
    }

    #[test]
    fn skip_on_match_leaves_existing_entity_alone() {
        let engine = MergeEngine::new(MergeConfig {
            policy: MergePolicy::SkipOnMatch,
            ..Default::default()
        });
        let first = engine.merge("WI", CanonicalState::default(), vec![CanonicalFragment::Park(park("a", "Peninsula"))], ts(1));
        let before = first.state.parks["wi-peninsula"].clone();
        let out = engine.merge(
            "WI",
            first.state,
            vec![CanonicalFragment::Park(ParkFragment { acreage: Some(3776.0), ..park("b", "Peninsula State Park") })],
            ts(2),
        );
        assert_eq!(out.state.parks["wi-peninsula"], before);
        assert!(out.touched_parks.contains("wi-peninsula"));
    }

    #[test]
    fn distant_slug_collision_is_a_conflict() {
        let engine = MergeEngine::default();
        let out = engine.merge(
            "WI",
            CanonicalState::default(),
            vec![
                CanonicalFragment::Park(ParkFragment { coordinates: at(43.0, -89.4), ..park("a", "Lake Park") }),
                CanonicalFragment::Park(ParkFragment { coordinates: at(46.5, -90.9), acreage: Some(5.0), ..park("b", "Lake Park") }),
            ],
            ts(1),
        );
        assert_eq!(out.conflicts.len(), 1);
        assert_eq!(out.conflicts[0].entity_id, "wi-lakepark");
        assert_eq!(out.conflicts[0].provider_id, "b");
        assert!(out.conflicts[0].distance_km > 300.0);
        assert_eq!(out.state.parks["wi-lakepark"].acreage, None);
    }

    #[test]
    fn trails_attach_to_parent_parks() {
        let engine = MergeEngine::default();
        let out = engine.merge(
            "WI",
            CanonicalState::default(),
            vec![
                CanonicalFragment::Park(park("a", "Devil's Lake State Park")),
                CanonicalFragment::Trail(TrailFragment {
                    provider_id: "t".into(),
                    name: "East Bluff Trail".into(),
                    park_name: Some("Devils Lake State Park".into()),
                    length_miles: Some(1.3),
                    difficulty: Some(Difficulty::Easy),
                    difficulty_inferred: true,
                    allowed_uses: [TrailUse::Hiking].into(),
                    ..Default::default()
                }),
                CanonicalFragment::Trail(TrailFragment {
                    provider_id: "u".into(),
                    name: "East Bluff Trail".into(),
                    difficulty: Some(Difficulty::Difficult),
                    allowed_uses: [TrailUse::Skiing].into(),
                    ..Default::default()
                }),
            ],
            ts(1),
        );
        let trail = &out.state.trails["wi-eastblufftrail"];
        assert_eq!(trail.park_id.as_deref(), Some("wi-devilslake"));
        assert_eq!(trail.difficulty, Some(Difficulty::Difficult));
        assert!(!trail.difficulty_inferred);
        assert_eq!(trail.allowed_uses.len(), 2);
        assert_eq!(trail.sources.len(), 2);
        let parent = &out.state.parks["wi-devilslake"];
        assert_eq!(parent.trails.len(), 1);
        assert_eq!(parent.trails[0].id, "wi-eastblufftrail");
    }

    #[test]
    fn similar_slugs_are_queued_for_review() {
        let engine = MergeEngine::default();
        let out = engine.merge(
            "WI",
            CanonicalState::default(),
            ["Mirror Lake State Park", "Mirror Lakes", "Peninsula State Park"]
                .into_iter()
                .map(|n| CanonicalFragment::Park(park("a", n)))
                .collect(),
            ts(1),
        );
        assert_eq!(out.state.parks.len(), 3);
        assert_eq!(out.reviews.len(), 1);
        assert_eq!(out.reviews[0].id_a, "wi-mirrorlake");
        assert_eq!(out.reviews[0].id_b, "wi-mirrorlakes");
    }

    #[test]
    fn link_templates_fill_missing_link_types() {
        let engine = MergeEngine::default();
        let mut out = engine.merge(
            "WI",
            CanonicalState::default(),
            vec![CanonicalFragment::Park(ParkFragment {
                external_id: Some("77".into()),
                ..park("a", "Big Foot Beach State Park")
            })],
            ts(1),
        );
        let templates = BTreeMap::from([
            (LinkType::Official, "https://dnr.wi.gov/parks/{url_slug}".to_string()),
            (LinkType::Reservation, "https://reserve.example/{external_id}".to_string()),
        ]);
        assert_eq!(apply_link_templates(&templates, &mut out), 2);
        let p = &out.state.parks["wi-bigfootbeach"];
        assert!(p.links.iter().any(|l| l.url == "https://dnr.wi.gov/parks/big-foot-beach"));
        assert!(p.links.iter().any(|l| l.url == "https://reserve.example/77"));
        assert_eq!(apply_link_templates(&templates, &mut out), 0);
    }

    #[test]
    fn link_template_values_are_percent_encoded() {
        let mut p = CanonicalPark::from_fragment("WI", &park("a", "Rock & Roll Park"), ts(1));
        let url = render_link_template(
            "https://www.google.com/maps/search/?api=1&query={name}%20Wisconsin",
            &p,
        )
        .unwrap();
        assert_eq!(
            url,
            "https://www.google.com/maps/search/?api=1&query=Rock%20%26%20Roll%20Park%20Wisconsin"
        );

        p.external_ids.insert("ridb".into(), "a/b#1".into());
        assert_eq!(
            render_link_template("https://reserve.example/{external_id}", &p).as_deref(),
            Some("https://reserve.example/a%2Fb%231")
        );
        p.name = "Lac Vieux Désert".into();
        assert_eq!(
            render_link_template("https://x.example/{name}", &p).as_deref(),
            Some("https://x.example/Lac%20Vieux%20D%C3%A9sert")
        );
    }

    #[tokio::test]
    async fn run_sync_reads_the_configured_registry() {
        let dir = tempdir().unwrap();
        let regions_path = dir.path().join("regions.yaml");
        std::fs::write(
            &regions_path,
            "regions:\n  - code: WI\n    name: Wisconsin\n    sources:\n      - provider_id: wi-dnr-parks\n        kind: feature_query_parks\n        endpoint: { base_url: \"http://127.0.0.1:9/query\" }\n",
        )
        .unwrap();
        let config = SyncConfig {
            regions_path,
            store_dir: dir.path().join("store"),
            ..Default::default()
        };

        let err = run_sync(&config, Some("MN")).await.unwrap_err();
        assert!(err.to_string().contains("unknown region MN"));

        let missing = SyncConfig {
            regions_path: dir.path().join("absent.yaml"),
            ..config
        };
        assert!(run_sync(&missing, None).await.is_err());
    }

    #[tokio::test]
    async fn store_writer_bumps_version_and_keeps_created_at() {
        let dir = tempdir().unwrap();
        let store = CanonicalStore::open_dir(dir.path());
        let record = CanonicalPark::from_fragment("WI", &park("a", "Peninsula"), ts(1));

        let first = store.write_park(record.clone(), ts(1)).await.unwrap();
        assert_eq!(first.metadata.version, 1);

        let mut again = record.clone();
        again.metadata.created_at = ts(5);
        let second = store.write_park(again, ts(2)).await.unwrap();
        assert_eq!(second.metadata.version, 2);
        assert_eq!(second.metadata.created_at, ts(1));
        assert_eq!(second.metadata.updated_at, ts(2));

        let stored = store.read_park("wi", "wi-peninsula").await.unwrap().unwrap();
        assert_eq!(stored, second);
        let (state, skipped) = store.load_state("WI").await.unwrap();
        assert!(skipped.is_empty());
        assert_eq!(state.parks.len(), 1);
        assert!(state.trails.is_empty());
    }

    #[tokio::test]
    async fn devils_lake_end_to_end_across_two_runs() {
        let store = CanonicalStore::new(Arc::new(MemoryObjectStore::new()));

        let run1 = syncer(&store, devils_lake_providers()).run().await;
        assert_eq!(run1.status, RunStatus::Completed);
        assert_eq!(run1.phase, SyncPhase::Complete);
        assert_eq!(run1.created, 1);
        let after1 = store.read_park("WI", "wi-devilslake").await.unwrap().unwrap();
        assert_eq!(after1.metadata.version, 1);
        assert_eq!(after1.metadata.sources, vec!["wi-dnr".to_string(), "wi-gis".to_string()]);
        assert!(store.read_park("WI", "wi-devilslakestatepark").await.unwrap().is_none());

        let mut providers = devils_lake_providers();
        providers.push(ridb_campground());
        let run2 = syncer(&store, providers).run().await;
        assert_eq!(run2.status, RunStatus::Completed);
        assert_eq!(run2.updated, 1);
        assert_eq!(run2.created, 0);

        let after2 = store.read_park("WI", "wi-devilslake").await.unwrap().unwrap();
        assert_eq!(after2.metadata.version, 2);
        assert_eq!(after2.metadata.created_at, after1.metadata.created_at);
        assert_eq!(after2.campgrounds.len(), 1);
        assert_eq!(after2.name, after1.name);
        assert_eq!(after2.acreage, after1.acreage);
        assert_eq!(after2.contact.phone, after1.contact.phone);
        assert_eq!(after2.contact.website, after1.contact.website);
        assert_eq!(after2.links, after1.links);
        assert_eq!(after2.coordinates, after1.coordinates);
        assert!(after2.activities.contains("Camping"));

        let index = store.read_index("WI").await.unwrap().unwrap();
        assert_eq!(index.entries.len(), 1);
        assert!(index.entries[0].has_camping);
        let stored_run = store.read_run("WI", run2.run_id).await.unwrap().unwrap();
        assert_eq!(stored_run.updated, 1);
    }

    #[tokio::test]
    async fn rerun_without_upstream_change_only_moves_version() {
        let store = CanonicalStore::new(Arc::new(MemoryObjectStore::new()));
        syncer(&store, devils_lake_providers()).run().await;
        let first = store.read_park("WI", "wi-devilslake").await.unwrap().unwrap();
        syncer(&store, devils_lake_providers()).run().await;
        let mut second = store.read_park("WI", "wi-devilslake").await.unwrap().unwrap();

        assert_eq!(second.metadata.version, first.metadata.version + 1);
        second.metadata.version = first.metadata.version;
        second.metadata.updated_at = first.metadata.updated_at;
        assert_eq!(second, first);
    }

    #[tokio::test]
    async fn primary_failure_writes_nothing_canonical() {
        let store = CanonicalStore::new(Arc::new(MemoryObjectStore::new()));
        syncer(&store, devils_lake_providers()).run().await;

        let run = syncer(
            &store,
            vec![
                (SourceRole::Primary, StaticAdapter::failing("wi-dnr")),
                ridb_campground(),
            ],
        )
        .run()
        .await;
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.phase, SyncPhase::Failed);
        assert_eq!(run.errors[0].kind, RunErrorKind::Transport);
        assert_eq!(run.errors[0].provider_id.as_deref(), Some("wi-dnr"));

        let kept = store.read_park("WI", "wi-devilslake").await.unwrap().unwrap();
        assert_eq!(kept.metadata.version, 1);
        assert!(kept.campgrounds.is_empty());
        let stored_run = store.read_run("WI", run.run_id).await.unwrap().unwrap();
        assert_eq!(stored_run.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn supplementary_failure_is_recorded_not_fatal() {
        let store = CanonicalStore::new(Arc::new(MemoryObjectStore::new()));
        let mut providers = devils_lake_providers();
        providers.truncate(1);
        providers.push((SourceRole::Supplementary, StaticAdapter::failing("ridb")));
        let run = syncer(&store, providers).run().await;
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.errors.len(), 1);
        assert_eq!(run.errors[0].kind, RunErrorKind::Transport);
        assert_eq!(run.failed, 0);
        assert!(store.read_park("WI", "wi-devilslake").await.unwrap().is_some());
    }

    /// Fails every put whose key contains the current needle.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryObjectStore,
        needle: std::sync::RwLock<Option<String>>,
    }

    impl FlakyStore {
        fn failing(needle: &str) -> Arc<Self> {
            let store = Arc::new(Self::default());
            store.fail_on(needle);
            store
        }

        fn fail_on(&self, needle: &str) {
            *self.needle.write().unwrap() = Some(needle.to_string());
        }
    }

    #[async_trait]
    impl ObjectStore for FlakyStore {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, bytes: &[u8]) -> Result<PutOutcome, StoreError> {
            let fails = match self.needle.read().unwrap().as_deref() {
                Some(needle) => key.contains(needle),
                None => false,
            };
            if fails {
                return Err(StoreError::Io {
                    key: key.to_string(),
                    source: std::io::Error::other("disk full"),
                });
            }
            self.inner.put(key, bytes).await
        }

        async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
            self.inner.list(prefix).await
        }
    }

    #[tokio::test]
    async fn write_failures_are_counted_and_the_run_continues() {
        let store = CanonicalStore::new(FlakyStore::failing("parks/wi-peninsula"));
        let fragments = ["Peninsula State Park", "Devil's Lake State Park"]
            .into_iter()
            .map(|n| CanonicalFragment::Park(park("a", n)))
            .collect();
        let run = syncer(&store, vec![(SourceRole::Primary, StaticAdapter::boxed("a", fragments))])
            .run()
            .await;
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.failed, 1);
        assert_eq!(run.errors[0].kind, RunErrorKind::Write);
        assert_eq!(run.errors[0].entity_id.as_deref(), Some("wi-peninsula"));
        assert!(store.read_park("WI", "wi-devilslake").await.unwrap().is_some());
        let index = store.read_index("WI").await.unwrap().unwrap();
        assert_eq!(index.entries.len(), 1);
    }

    #[tokio::test]
    async fn failed_update_keeps_index_on_the_stored_record() {
        let flaky = Arc::new(FlakyStore::default());
        let store = CanonicalStore::new(flaky.clone());
        let run1 = syncer(&store, devils_lake_providers()).run().await;
        assert_eq!(run1.failed, 0);

        flaky.fail_on("parks/wi-devilslake");
        let mut providers = devils_lake_providers();
        providers.push(ridb_campground());
        let run2 = syncer(&store, providers).run().await;
        assert_eq!(run2.status, RunStatus::Completed);
        assert_eq!(run2.failed, 1);

        let stored = store.read_park("WI", "wi-devilslake").await.unwrap().unwrap();
        assert_eq!(stored.metadata.version, 1);
        assert!(stored.campgrounds.is_empty());
        let index = store.read_index("WI").await.unwrap().unwrap();
        assert_eq!(index.entries, vec![IndexEntry::from(&stored)]);
        assert!(!index.entries[0].has_camping);
    }

    #[tokio::test]
    async fn failed_new_trail_is_not_summarized_on_its_park() {
        let flaky = Arc::new(FlakyStore::default());
        let store = CanonicalStore::new(flaky.clone());
        syncer(&store, devils_lake_providers()).run().await;

        flaky.fail_on("trails/");
        let trail = TrailFragment {
            provider_id: "trails".into(),
            name: "East Bluff Trail".into(),
            park_name: Some("Devils Lake State Park".into()),
            ..Default::default()
        };
        let mut providers = devils_lake_providers();
        providers.push((
            SourceRole::Supplementary,
            StaticAdapter::boxed("trails", vec![CanonicalFragment::Trail(trail)]),
        ));
        let run = syncer(&store, providers).run().await;
        assert_eq!(run.failed, 1);
        assert_eq!(run.errors[0].entity_id.as_deref(), Some("wi-eastblufftrail"));

        assert!(store.read_trail("WI", "wi-eastblufftrail").await.unwrap().is_none());
        let stored = store.read_park("WI", "wi-devilslake").await.unwrap().unwrap();
        assert!(stored.trails.is_empty());
        let index = store.read_index("WI").await.unwrap().unwrap();
        assert_eq!(index.entries, vec![IndexEntry::from(&stored)]);
        assert!(!index.entries[0].has_trails);
    }

    #[tokio::test]
    async fn undecodable_stored_records_are_skipped() {
        let store = CanonicalStore::new(Arc::new(MemoryObjectStore::new()));
        syncer(&store, devils_lake_providers()).run().await;
        store
            .object_store()
            .put("regions/wi/parks/wi-other.json", b"{not json")
            .await
            .unwrap();

        let run = syncer(&store, devils_lake_providers()).run().await;
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.errors.len(), 1);
        assert_eq!(run.errors[0].kind, RunErrorKind::Store);
        assert!(run.errors[0].message.contains("regions/wi/parks/wi-other.json"));
        let park = store.read_park("WI", "wi-devilslake").await.unwrap().unwrap();
        assert_eq!(park.metadata.version, 2);
        let index = store.read_index("WI").await.unwrap().unwrap();
        assert_eq!(index.entries.len(), 1);
    }

    #[tokio::test]
    async fn undecodable_record_is_rewritten_from_fresh_data() {
        let store = CanonicalStore::new(Arc::new(MemoryObjectStore::new()));
        store
            .object_store()
            .put("regions/wi/parks/wi-devilslake.json", b"{oops")
            .await
            .unwrap();

        let run = syncer(&store, devils_lake_providers()).run().await;
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.created, 1);
        assert_eq!(run.failed, 0);
        let park = store.read_park("WI", "wi-devilslake").await.unwrap().unwrap();
        assert_eq!(park.metadata.version, 1);
    }

    #[tokio::test]
    async fn index_write_failure_keeps_the_run_completed() {
        let store = CanonicalStore::new(FlakyStore::failing("index.json"));
        let run = syncer(&store, devils_lake_providers()).run().await;
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.phase, SyncPhase::Complete);
        assert_eq!(run.errors.len(), 1);
        assert_eq!(run.errors[0].kind, RunErrorKind::Store);
        assert!(store.read_park("WI", "wi-devilslake").await.unwrap().is_some());
        assert!(store.read_index("WI").await.unwrap().is_none());
        let stored_run = store.read_run("WI", run.run_id).await.unwrap().unwrap();
        assert_eq!(stored_run.errors, run.errors);
    }

    #[tokio::test]
    async fn regions_run_through_real_adapters_in_isolation() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/wi/parks"))
            .and(query_param("resultOffset", "0"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(fixture_bytes("feature_query_parks", "page1.json")))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/wi/parks"))
            .and(query_param("resultOffset", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(fixture_bytes("feature_query_parks", "page2.json")))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/wi/trails"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(fixture_bytes("feature_query_trails", "page1.json")))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/mn/parks"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let yaml = format!(
            r#"
regions:
  - code: WI
    name: Wisconsin
    link_templates:
      official: "https://dnr.wisconsin.gov/topic/parks/{{slug}}"
    designations: {{ SP: State Park }}
    name_overrides:
      - contains: kettle moraine
        designation: State Forest
      - contains: maintenance
        exclude: true
    sources:
      - provider_id: wi-parks
        kind: feature_query_parks
        endpoint: {{ base_url: "{base}/wi/parks" }}
      - provider_id: wi-trails
        kind: feature_query_trails
        role: supplementary
        endpoint: {{ base_url: "{base}/wi/trails" }}
  - code: MN
    name: Minnesota
    sources:
      - provider_id: mn-parks
        kind: feature_query_parks
        endpoint: {{ base_url: "{base}/mn/parks" }}
"#,
            base = server.uri()
        );
        let regions = RegionRegistry::from_yaml(&yaml).unwrap().select(None).unwrap();
        let dir = tempdir().unwrap();
        let store = CanonicalStore::open_dir(dir.path());
        let config = SyncConfig {
            store_dir: dir.path().to_path_buf(),
            ..SyncConfig::default()
        };

        let runs = run_regions(&config, regions, test_http(), store.clone()).await;
        assert_eq!(runs.len(), 2);
        let (mn, wi) = (&runs[0], &runs[1]);

        assert_eq!(mn.region, "MN");
        assert_eq!(mn.status, RunStatus::Failed);
        assert!(store.read_index("MN").await.unwrap().is_none());

        assert_eq!(wi.status, RunStatus::Completed);
        assert_eq!(wi.created, 4);
        assert_eq!(wi.failed, 1);
        let parks_stats = wi.sources.iter().find(|s| s.provider_id == "wi-parks").unwrap();
        assert_eq!(parks_stats.fetched, 4);
        assert_eq!(parks_stats.normalized, 2);
        assert_eq!(parks_stats.skipped, 1);
        assert_eq!(parks_stats.failed, 1);

        let devils = store.read_park("WI", "wi-devilslake").await.unwrap().unwrap();
        assert_eq!(devils.trails.len(), 1);
        assert_eq!(devils.trails[0].id, "wi-eastblufftrail");
        assert_eq!(devils.links.len(), 1);

        let kettle = store
            .read_park("WI", "wi-kettlemorainenorthernunit")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(kettle.category, ParkCategory::StateForest);
        assert_eq!(
            kettle.links[0].url,
            "https://dnr.wisconsin.gov/topic/parks/kettlemorainenorthernunit"
        );

        let trail = store.read_trail("WI", "wi-eastblufftrail").await.unwrap().unwrap();
        assert_eq!(trail.park_id.as_deref(), Some("wi-devilslake"));

        let index = store.read_index("WI").await.unwrap().unwrap();
        assert_eq!(index.entries.len(), 2);
        assert_eq!(index.entries[0].id, "wi-devilslake");
        assert!(index.entries[0].has_trails);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn scheduler_only_registers_regions_with_cron() {
        let store = CanonicalStore::new(Arc::new(MemoryObjectStore::new()));
        let none = build_scheduler(SyncConfig::default(), vec![wi_region()], test_http(), store.clone())
            .await
            .unwrap();
        assert!(none.is_none());

        let mut region = wi_region();
        region.cron = Some("0 0 5 * * *".into());
        let sched = build_scheduler(SyncConfig::default(), vec![region], test_http(), store)
            .await
            .unwrap();
        assert!(sched.is_some());
    }
}
