//! Canonical park/trail model, identity derivation, and run metadata types for parksync.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "parksync-core";

pub const METERS_PER_MILE: f64 = 1609.344;

const EARTH_RADIUS_KM: f64 = 6371.0088;

/// Designation suffixes removed before slugging, longest first so compound
/// designations win over their tails.
const DESIGNATION_SUFFIXES: &[&str] = &[
    "state park and recreation area",
    "national recreation area",
    "state recreation area",
    "state historic site",
    "state wildlife area",
    "state natural area",
    "state trail park",
    "national forest",
    "national park",
    "state forest",
    "state beach",
    "state park",
    "state trail",
    "recreation area",
    "county park",
];

/// Lowercases, strips trailing designations, and hyphenates the remaining words.
///
/// Apostrophes are dropped rather than treated as separators so possessives
/// ("Devil's") slug the same as their unpunctuated spelling ("Devils").
pub fn url_slug(name: &str) -> String {
    let base = strip_designation(name);
    let mut out = String::with_capacity(base.len());
    let mut pending_hyphen = false;
    for ch in base.chars() {
        if matches!(ch, '\'' | '\u{2019}' | '`') {
            continue;
        }
        if ch.is_ascii_alphanumeric() {
            if pending_hyphen && !out.is_empty() {
                out.push('-');
            }
            pending_hyphen = false;
            out.push(ch);
        } else {
            pending_hyphen = true;
        }
    }
    out
}

/// Identity slug: the hyphenated slug with separators removed.
///
/// `slug("Devil's Lake State Park") == "devilslake"`, and slugging a slug is a no-op.
pub fn slug(name: &str) -> String {
    url_slug(name).replace('-', "")
}

/// Deterministic entity id for a place: lowercased region code + identity slug.
pub fn entity_id(region: &str, name: &str) -> String {
    format!("{}-{}", region.trim().to_ascii_lowercase(), slug(name))
}

fn strip_designation(name: &str) -> String {
    let mut base = name
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    loop {
        let stripped = DESIGNATION_SUFFIXES.iter().find_map(|suffix| {
            base.strip_suffix(suffix)
                .filter(|rest| !rest.is_empty() && rest.ends_with(' '))
                .map(|rest| rest.trim_end().to_string())
        });
        match stripped {
            Some(rest) => base = rest,
            None => return base,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Option<Self> {
        let valid = latitude.is_finite()
            && longitude.is_finite()
            && (-90.0..=90.0).contains(&latitude)
            && (-180.0..=180.0).contains(&longitude)
            && !(latitude == 0.0 && longitude == 0.0);
        valid.then_some(Self {
            latitude,
            longitude,
        })
    }

    /// Great-circle distance in kilometres.
    pub fn distance_km(&self, other: &Coordinates) -> f64 {
        let (lat1, lat2) = (self.latitude.to_radians(), other.latitude.to_radians());
        let dlat = lat2 - lat1;
        let dlon = (other.longitude - self.longitude).to_radians();
        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    Official,
    Reservation,
    Map,
    Directions,
    Facility,
    Other,
}

impl LinkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Official => "official",
            Self::Reservation => "reservation",
            Self::Map => "map",
            Self::Directions => "directions",
            Self::Facility => "facility",
            Self::Other => "other",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfficialLink {
    pub link_type: LinkType,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl ContactInfo {
    pub fn is_empty(&self) -> bool {
        self.phone.is_none() && self.email.is_none() && self.website.is_none() && self.address.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampgroundSummary {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sites: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reservable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reservation_url: Option<String>,
    pub source_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrailSummary {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length_miles: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParkCategory {
    StatePark,
    StateForest,
    RecreationArea,
    NaturalArea,
    Federal,
    Campground,
    Other,
}

impl ParkCategory {
    pub fn from_designation(designation: &str) -> Self {
        let lower = designation.to_ascii_lowercase();
        if lower.contains("national") || lower.contains("federal") {
            Self::Federal
        } else if lower.contains("forest") {
            Self::StateForest
        } else if lower.contains("recreation area") {
            Self::RecreationArea
        } else if lower.contains("natural area") || lower.contains("wildlife") {
            Self::NaturalArea
        } else if lower.contains("campground") {
            Self::Campground
        } else if lower.contains("park") {
            Self::StatePark
        } else {
            Self::Other
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Easy,
    Moderate,
    Difficult,
}

impl Difficulty {
    /// Fallback when a provider gives no difficulty: under 2 miles is easy,
    /// under 5 is moderate, anything longer is difficult.
    pub fn infer_from_miles(miles: f64) -> Self {
        if miles < 2.0 {
            Self::Easy
        } else if miles < 5.0 {
            Self::Moderate
        } else {
            Self::Difficult
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let lower = raw.trim().to_ascii_lowercase();
        if lower.is_empty() {
            return None;
        }
        if lower.contains("easy") || lower.contains("beginner") || lower == "1" {
            Some(Self::Easy)
        } else if lower.contains("moderate") || lower.contains("intermediate") || lower == "2" {
            Some(Self::Moderate)
        } else if lower.contains("difficult")
            || lower.contains("hard")
            || lower.contains("strenuous")
            || lower.contains("advanced")
            || lower == "3"
        {
            Some(Self::Difficult)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrailUse {
    Hiking,
    Biking,
    Equestrian,
    Paddling,
    Skiing,
    Snowmobile,
    Motorized,
    Accessible,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordMetadata {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// 0 until the store writer persists the record; 1 after the first write.
    pub version: u64,
    pub sources: Vec<String>,
}

impl RecordMetadata {
    pub fn new(now: DateTime<Utc>, source: &str) -> Self {
        Self {
            created_at: now,
            updated_at: now,
            version: 0,
            sources: vec![source.to_string()],
        }
    }

    /// Adds a contributing provider, keeping the list sorted and unique.
    /// Returns true when the provider was not yet listed.
    pub fn add_source(&mut self, source: &str) -> bool {
        match self.sources.binary_search_by(|s| s.as_str().cmp(source)) {
            Ok(_) => false,
            Err(pos) => {
                self.sources.insert(pos, source.to_string());
                true
            }
        }
    }
}

/// Canonical persisted park representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalPark {
    pub id: String,
    pub name: String,
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub designation: Option<String>,
    pub category: ParkCategory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<Coordinates>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acreage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub popularity: Option<u32>,
    #[serde(default)]
    pub contact: ContactInfo,
    #[serde(default)]
    pub links: Vec<OfficialLink>,
    #[serde(default)]
    pub campgrounds: Vec<CampgroundSummary>,
    #[serde(default)]
    pub trails: Vec<TrailSummary>,
    #[serde(default)]
    pub activities: BTreeSet<String>,
    #[serde(default)]
    pub external_ids: BTreeMap<String, String>,
    pub metadata: RecordMetadata,
}

impl CanonicalPark {
    pub fn from_fragment(region: &str, fragment: &ParkFragment, now: DateTime<Utc>) -> Self {
        let category = fragment.category.unwrap_or_else(|| {
            fragment
                .designation
                .as_deref()
                .map(ParkCategory::from_designation)
                .unwrap_or(ParkCategory::Other)
        });
        let mut park = Self {
            id: entity_id(region, &fragment.name),
            name: fragment.name.clone(),
            region: region.to_ascii_uppercase(),
            designation: fragment.designation.clone(),
            category,
            coordinates: fragment.coordinates,
            acreage: fragment.acreage,
            popularity: fragment.popularity,
            contact: fragment.contact.clone(),
            links: Vec::new(),
            campgrounds: Vec::new(),
            trails: Vec::new(),
            activities: fragment.activities.iter().cloned().collect(),
            external_ids: BTreeMap::new(),
            metadata: RecordMetadata::new(now, &fragment.provider_id),
        };
        for link in &fragment.links {
            park.add_link(link.clone());
        }
        for campground in &fragment.campgrounds {
            park.add_campground(campground.clone());
        }
        if let Some(external_id) = &fragment.external_id {
            park.external_ids
                .insert(fragment.provider_id.clone(), external_id.clone());
        }
        park
    }

    pub fn has_link(&self, link_type: LinkType) -> bool {
        self.links.iter().any(|l| l.link_type == link_type)
    }

    /// Adds a link unless the same (type, url) pair is already present.
    pub fn add_link(&mut self, link: OfficialLink) -> bool {
        if self
            .links
            .iter()
            .any(|l| l.link_type == link.link_type && l.url == link.url)
        {
            return false;
        }
        self.links.push(link);
        true
    }

    /// Adds a campground unless one with the same slug already exists.
    pub fn add_campground(&mut self, campground: CampgroundSummary) -> bool {
        let key = slug(&campground.name);
        if self.campgrounds.iter().any(|c| slug(&c.name) == key) {
            return false;
        }
        self.campgrounds.push(campground);
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceAttribution {
    pub provider_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalTrail {
    pub id: String,
    pub name: String,
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub park_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length_miles: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<Difficulty>,
    #[serde(default)]
    pub difficulty_inferred: bool,
    #[serde(default)]
    pub allowed_uses: BTreeSet<TrailUse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trailhead: Option<Coordinates>,
    #[serde(default)]
    pub sources: Vec<SourceAttribution>,
    pub metadata: RecordMetadata,
}

impl CanonicalTrail {
    pub fn from_fragment(region: &str, fragment: &TrailFragment, now: DateTime<Utc>) -> Self {
        Self {
            id: entity_id(region, &fragment.name),
            name: fragment.name.clone(),
            region: region.to_ascii_uppercase(),
            park_id: None,
            length_miles: fragment.length_miles,
            difficulty: fragment.difficulty,
            difficulty_inferred: fragment.difficulty_inferred,
            allowed_uses: fragment.allowed_uses.clone(),
            trailhead: fragment.trailhead,
            sources: vec![SourceAttribution {
                provider_id: fragment.provider_id.clone(),
                external_id: fragment.external_id.clone(),
            }],
            metadata: RecordMetadata::new(now, &fragment.provider_id),
        }
    }
}

/// Mapper output for a park-like place, before identity assignment and merge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParkFragment {
    pub provider_id: String,
    pub external_id: Option<String>,
    pub name: String,
    pub designation: Option<String>,
    pub category: Option<ParkCategory>,
    pub coordinates: Option<Coordinates>,
    pub acreage: Option<f64>,
    pub popularity: Option<u32>,
    pub contact: ContactInfo,
    pub links: Vec<OfficialLink>,
    pub campgrounds: Vec<CampgroundSummary>,
    pub activities: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrailFragment {
    pub provider_id: String,
    pub external_id: Option<String>,
    pub name: String,
    pub park_name: Option<String>,
    pub length_miles: Option<f64>,
    pub difficulty: Option<Difficulty>,
    pub difficulty_inferred: bool,
    pub allowed_uses: BTreeSet<TrailUse>,
    pub trailhead: Option<Coordinates>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CanonicalFragment {
    Park(ParkFragment),
    Trail(TrailFragment),
}

impl CanonicalFragment {
    pub fn name(&self) -> &str {
        match self {
            Self::Park(p) => &p.name,
            Self::Trail(t) => &t.name,
        }
    }

    pub fn provider_id(&self) -> &str {
        match self {
            Self::Park(p) => &p.provider_id,
            Self::Trail(t) => &t.provider_id,
        }
    }
}

/// Lightweight listing descriptor; always derived from a full park record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexEntry {
    pub id: String,
    pub name: String,
    pub category: ParkCategory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub designation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<Coordinates>,
    pub has_camping: bool,
    pub has_trails: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub popularity: Option<u32>,
}

impl From<&CanonicalPark> for IndexEntry {
    fn from(park: &CanonicalPark) -> Self {
        Self {
            id: park.id.clone(),
            name: park.name.clone(),
            category: park.category,
            designation: park.designation.clone(),
            coordinates: park.coordinates,
            has_camping: !park.campgrounds.is_empty()
                || park.activities.iter().any(|a| a.to_ascii_lowercase().contains("camping")),
            has_trails: !park.trails.is_empty(),
            popularity: park.popularity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionIndex {
    pub region: String,
    pub generated_at: DateTime<Utc>,
    pub entries: Vec<IndexEntry>,
}

impl RegionIndex {
    /// Builds the index from full records, most popular first, then by name.
    pub fn build<'a>(
        region: &str,
        parks: impl IntoIterator<Item = &'a CanonicalPark>,
        generated_at: DateTime<Utc>,
    ) -> Self {
        let mut entries: Vec<IndexEntry> = parks.into_iter().map(IndexEntry::from).collect();
        entries.sort_by(|a, b| {
            b.popularity
                .unwrap_or(0)
                .cmp(&a.popularity.unwrap_or(0))
                .then_with(|| a.name.cmp(&b.name))
                .then_with(|| a.id.cmp(&b.id))
        });
        Self {
            region: region.to_ascii_uppercase(),
            generated_at,
            entries,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    FetchingPrimary,
    FetchingSupplementary,
    Normalizing,
    Merging,
    Writing,
    Complete,
    Failed,
}

impl SyncPhase {
    /// Whether `next` is a legal successor of `self`.
    ///
    /// Supplementary fetching is optional, and any non-terminal phase may fail.
    pub fn can_advance_to(self, next: SyncPhase) -> bool {
        use SyncPhase::*;
        match (self, next) {
            (Complete | Failed, _) => false,
            (_, Failed) => true,
            (Idle, FetchingPrimary) => true,
            (FetchingPrimary, FetchingSupplementary | Normalizing) => true,
            (FetchingSupplementary, Normalizing) => true,
            (Normalizing, Merging) => true,
            (Merging, Writing) => true,
            (Writing, Complete) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunErrorKind {
    Transport,
    Normalization,
    MergeConflict,
    Write,
    Store,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunError {
    pub kind: RunErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRunStats {
    pub provider_id: String,
    pub fetched: usize,
    pub normalized: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Pair of distinct entities whose names are suspiciously close.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NearDuplicate {
    pub id_a: String,
    pub id_b: String,
    pub score: f64,
}

/// Audit record persisted once per region run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRun {
    pub run_id: Uuid,
    pub region: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub phase: SyncPhase,
    pub processed: usize,
    pub created: usize,
    pub updated: usize,
    pub failed: usize,
    pub carried_forward: usize,
    #[serde(default)]
    pub errors: Vec<RunError>,
    #[serde(default)]
    pub sources: Vec<SourceRunStats>,
    #[serde(default)]
    pub reviews: Vec<NearDuplicate>,
}

impl SyncRun {
    pub fn start(region: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            region: region.to_ascii_uppercase(),
            started_at,
            finished_at: None,
            status: RunStatus::Running,
            phase: SyncPhase::Idle,
            processed: 0,
            created: 0,
            updated: 0,
            failed: 0,
            carried_forward: 0,
            errors: Vec::new(),
            sources: Vec::new(),
            reviews: Vec::new(),
        }
    }

    pub fn record_error(
        &mut self,
        kind: RunErrorKind,
        provider_id: Option<&str>,
        entity_id: Option<&str>,
        message: impl Into<String>,
    ) {
        self.errors.push(RunError {
            kind,
            provider_id: provider_id.map(ToString::to_string),
            entity_id: entity_id.map(ToString::to_string),
            message: message.into(),
        });
    }

    pub fn source_stats_mut(&mut self, provider_id: &str) -> &mut SourceRunStats {
        let pos = match self.sources.iter().position(|s| s.provider_id == provider_id) {
            Some(pos) => pos,
            None => {
                self.sources.push(SourceRunStats {
                    provider_id: provider_id.to_string(),
                    ..Default::default()
                });
                self.sources.len() - 1
            }
        };
        &mut self.sources[pos]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap()
    }

    #[test]
    fn slug_strips_designation_and_punctuation() {
        assert_eq!(slug("Devil's Lake State Park"), "devilslake");
        assert_eq!(slug("Devils Lake State Park"), "devilslake");
        assert_eq!(url_slug("Kettle Moraine State Forest - Northern Unit"), "kettle-moraine-state-forest-northern-unit");
        assert_eq!(url_slug("Peninsula State Park"), "peninsula");
        assert_eq!(url_slug("  Big   Foot Beach  State   Park "), "big-foot-beach");
    }

    #[test]
    fn slug_is_idempotent() {
        for name in [
            "Devil's Lake State Park",
            "Mirror Lake State Park and Recreation Area",
            "Governor Dodge",
            "Point Beach State Forest",
            "State Park",
        ] {
            let once = slug(name);
            assert_eq!(slug(&once), once, "slug not idempotent for {name}");
            let hyphenated = url_slug(name);
            assert_eq!(url_slug(&hyphenated), hyphenated);
        }
    }

    #[test]
    fn designation_only_names_are_not_emptied() {
        assert_eq!(slug("State Park"), "statepark");
        assert_eq!(slug("Mirror Lake State Park and Recreation Area"), "mirrorlake");
    }

    #[test]
    fn entity_id_is_region_scoped_and_deterministic() {
        assert_eq!(entity_id("WI", "Devil's Lake State Park"), "wi-devilslake");
        assert_eq!(entity_id("wi", "Devils Lake State Park"), "wi-devilslake");
        assert_ne!(entity_id("MN", "Devils Lake"), entity_id("WI", "Devils Lake"));
    }

    #[test]
    fn difficulty_fallback_thresholds() {
        assert_eq!(Difficulty::infer_from_miles(0.5), Difficulty::Easy);
        assert_eq!(Difficulty::infer_from_miles(1.99), Difficulty::Easy);
        assert_eq!(Difficulty::infer_from_miles(2.0), Difficulty::Moderate);
        assert_eq!(Difficulty::infer_from_miles(4.9), Difficulty::Moderate);
        assert_eq!(Difficulty::infer_from_miles(5.0), Difficulty::Difficult);
        assert_eq!(Difficulty::parse("More Difficult"), Some(Difficulty::Difficult));
        assert_eq!(Difficulty::parse("Intermediate"), Some(Difficulty::Moderate));
        assert_eq!(Difficulty::parse(""), None);
    }

    #[test]
    fn coordinates_reject_null_island_and_out_of_range() {
        assert!(Coordinates::new(0.0, 0.0).is_none());
        assert!(Coordinates::new(91.0, 10.0).is_none());
        let madison = Coordinates::new(43.0731, -89.4012).unwrap();
        let baraboo = Coordinates::new(43.4272, -89.7312).unwrap();
        let d = madison.distance_km(&baraboo);
        assert!((40.0..55.0).contains(&d), "unexpected distance {d}");
    }

    #[test]
    fn park_from_fragment_dedups_links_and_campgrounds() {
        let fragment = ParkFragment {
            provider_id: "wi-dnr".into(),
            external_id: Some("42".into()),
            name: "Devil's Lake State Park".into(),
            designation: Some("State Park".into()),
            links: vec![
                OfficialLink { link_type: LinkType::Official, url: "https://a".into(), title: None },
                OfficialLink { link_type: LinkType::Official, url: "https://a".into(), title: None },
            ],
            campgrounds: vec![
                CampgroundSummary { name: "Quartzite".into(), sites: None, reservable: None, reservation_url: None, source_id: "x".into() },
                CampgroundSummary { name: "quartzite".into(), sites: Some(3), reservable: None, reservation_url: None, source_id: "y".into() },
            ],
            ..Default::default()
        };
        let park = CanonicalPark::from_fragment("WI", &fragment, ts());
        assert_eq!(park.id, "wi-devilslake");
        assert_eq!(park.category, ParkCategory::StatePark);
        assert_eq!(park.links.len(), 1);
        assert_eq!(park.campgrounds.len(), 1);
        assert_eq!(park.external_ids.get("wi-dnr").map(String::as_str), Some("42"));
        assert_eq!(park.metadata.version, 0);
    }

    #[test]
    fn index_entries_derive_from_full_records() {
        let mut a = CanonicalPark::from_fragment(
            "WI",
            &ParkFragment { provider_id: "p".into(), name: "Alpha".into(), popularity: Some(10), ..Default::default() },
            ts(),
        );
        a.trails.push(TrailSummary { id: "wi-alphaloop".into(), name: "Alpha Loop".into(), length_miles: None });
        let b = CanonicalPark::from_fragment(
            "WI",
            &ParkFragment {
                provider_id: "p".into(),
                name: "Beta".into(),
                popularity: Some(50),
                activities: vec!["Camping".into()],
                ..Default::default()
            },
            ts(),
        );
        let index = RegionIndex::build("wi", [&a, &b], ts());
        assert_eq!(index.region, "WI");
        assert_eq!(index.entries[0].id, "wi-beta");
        assert!(index.entries[0].has_camping);
        assert!(!index.entries[0].has_trails);
        assert!(index.entries[1].has_trails);
        assert_eq!(index.entries[1], IndexEntry::from(&a));
    }

    #[test]
    fn phase_transitions_follow_the_pipeline() {
        assert!(SyncPhase::Idle.can_advance_to(SyncPhase::FetchingPrimary));
        assert!(SyncPhase::FetchingPrimary.can_advance_to(SyncPhase::Normalizing));
        assert!(SyncPhase::FetchingPrimary.can_advance_to(SyncPhase::FetchingSupplementary));
        assert!(SyncPhase::Writing.can_advance_to(SyncPhase::Complete));
        assert!(SyncPhase::Merging.can_advance_to(SyncPhase::Failed));
        assert!(!SyncPhase::Idle.can_advance_to(SyncPhase::Writing));
        assert!(!SyncPhase::Complete.can_advance_to(SyncPhase::Failed));
    }

    #[test]
    fn metadata_sources_stay_sorted_and_unique() {
        let mut meta = RecordMetadata::new(ts(), "ridb");
        assert!(meta.add_source("arcgis"));
        assert!(!meta.add_source("ridb"));
        assert_eq!(meta.sources, vec!["arcgis".to_string(), "ridb".to_string()]);
    }

    #[test]
    fn outbound_records_use_camel_case() {
        let run = SyncRun::start("wi", ts());
        let json = serde_json::to_value(&run).unwrap();
        assert!(json.get("runId").is_some());
        assert!(json.get("carriedForward").is_some());
        assert_eq!(json["phase"], "idle");
    }
}
