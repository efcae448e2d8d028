//! Provider contracts, paginated retrieval, and per-provider field mappers.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use parksync_core::{
    slug, CampgroundSummary, CanonicalFragment, ContactInfo, Coordinates, Difficulty, LinkType,
    OfficialLink, ParkCategory, ParkFragment, TrailFragment, TrailUse, METERS_PER_MILE,
};
use parksync_storage::{HttpFetcher, HttpRequest, TokenBucketConfig, TransportError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "parksync-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    FeatureQueryParks,
    FeatureQueryTrails,
    RidbFacilities,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("provider {provider_id} returned an unreadable page: {message}")]
    Decode { provider_id: String, message: String },
    #[error("provider {provider_id} needs credential {credential:?}")]
    MissingCredential {
        provider_id: String,
        credential: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizationError {
    #[error("record {external_id:?} has no usable name")]
    MissingName { external_id: Option<String> },
    #[error("record {name:?} excluded by override {rule:?}")]
    Excluded { name: String, rule: String },
}

impl NormalizationError {
    /// Exclusions are curated skips, not failures.
    pub fn is_exclusion(&self) -> bool {
        matches!(self, Self::Excluded { .. })
    }
}

/// Named secrets for one run, resolved by the caller and handed to adapters.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    values: BTreeMap<String, String>,
}

impl Credentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }
}

#[derive(Debug, Clone, Default)]
pub struct FetchContext {
    pub region: String,
    pub credentials: Credentials,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameOverride {
    pub contains: String,
    #[serde(default)]
    pub designation: Option<String>,
    #[serde(default)]
    pub exclude: bool,
}

/// Region-level lookup tables the mappers consult.
#[derive(Debug, Clone, Default)]
pub struct NormalizeContext {
    pub region: String,
    pub designations: BTreeMap<String, String>,
    pub name_overrides: Vec<NameOverride>,
}

impl NormalizeContext {
    fn override_for(&self, name: &str) -> Option<&NameOverride> {
        let lower = name.to_lowercase();
        self.name_overrides
            .iter()
            .find(|o| lower.contains(&o.contains.to_lowercase()))
    }

    /// Translates a designation code; unknown values pass through as-is.
    fn designation_for(&self, raw: &str) -> Option<String> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        let found = self
            .designations
            .iter()
            .find(|(code, _)| code.eq_ignore_ascii_case(raw))
            .map(|(_, display)| display.clone());
        Some(found.unwrap_or_else(|| raw.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Geometry {
    Point(Coordinates),
    Polyline(Vec<Vec<Coordinates>>),
    Polygon(Vec<Vec<Coordinates>>),
}

impl Geometry {
    /// Reads feature-query geometry (`x`/`y`, `paths`, or `rings`), expected in WGS84.
    pub fn from_feature_json(value: &JsonValue) -> Option<Self> {
        if let (Some(x), Some(y)) = (
            value.get("x").and_then(JsonValue::as_f64),
            value.get("y").and_then(JsonValue::as_f64),
        ) {
            return Coordinates::new(y, x).map(Self::Point);
        }
        if let Some(paths) = value.get("paths") {
            let paths = parse_vertex_lists(paths);
            return (!paths.is_empty()).then_some(Self::Polyline(paths));
        }
        if let Some(rings) = value.get("rings") {
            let rings = parse_vertex_lists(rings);
            return (!rings.is_empty()).then_some(Self::Polygon(rings));
        }
        None
    }

    /// Point itself, first vertex of a line, or vertex mean of a polygon's outer ring.
    pub fn representative_point(&self) -> Option<Coordinates> {
        match self {
            Self::Point(p) => Some(*p),
            Self::Polyline(paths) => paths.first().and_then(|p| p.first()).copied(),
            Self::Polygon(rings) => {
                let ring = rings.first()?;
                let open = match (ring.first(), ring.last()) {
                    (Some(a), Some(b)) if ring.len() > 1 && a == b => &ring[..ring.len() - 1],
                    _ => &ring[..],
                };
                if open.is_empty() {
                    return None;
                }
                let n = open.len() as f64;
                let lat = open.iter().map(|c| c.latitude).sum::<f64>() / n;
                let lon = open.iter().map(|c| c.longitude).sum::<f64>() / n;
                Coordinates::new(lat, lon)
            }
        }
    }

    pub fn length_miles(&self) -> Option<f64> {
        let Self::Polyline(paths) = self else {
            return None;
        };
        let km: f64 = paths
            .iter()
            .flat_map(|path| path.windows(2).map(|w| w[0].distance_km(&w[1])))
            .sum();
        (km > 0.0).then_some(km * 1000.0 / METERS_PER_MILE)
    }
}

fn parse_vertex_lists(value: &JsonValue) -> Vec<Vec<Coordinates>> {
    value
        .as_array()
        .map(|lists| {
            lists
                .iter()
                .filter_map(|list| {
                    let vertices = list
                        .as_array()?
                        .iter()
                        .filter_map(|pt| {
                            let pair = pt.as_array()?;
                            Coordinates::new(pair.get(1)?.as_f64()?, pair.first()?.as_f64()?)
                        })
                        .collect::<Vec<_>>();
                    (!vertices.is_empty()).then_some(vertices)
                })
                .collect()
        })
        .unwrap_or_default()
}

/// One provider record before mapping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRecord {
    pub attributes: Map<String, JsonValue>,
    pub geometry: Option<Geometry>,
}

impl RawRecord {
    pub fn from_attributes(attributes: Map<String, JsonValue>) -> Self {
        Self {
            attributes,
            geometry: None,
        }
    }

    fn value(&self, aliases: &[String]) -> Option<&JsonValue> {
        aliases.iter().find_map(|alias| {
            self.attributes.get(alias).or_else(|| {
                self.attributes
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(alias))
                    .map(|(_, v)| v)
            })
            .filter(|v| !v.is_null())
        })
    }

    /// First non-blank value among `aliases`, numbers rendered as text.
    pub fn text(&self, aliases: &[String]) -> Option<String> {
        aliases.iter().find_map(|alias| {
            let v = self.value(std::slice::from_ref(alias))?;
            let text = match v {
                JsonValue::String(s) => s.split_whitespace().collect::<Vec<_>>().join(" "),
                JsonValue::Number(n) => n.to_string(),
                _ => return None,
            };
            (!text.is_empty()).then_some(text)
        })
    }

    pub fn number(&self, aliases: &[String]) -> Option<f64> {
        aliases.iter().find_map(|alias| {
            let parsed = match self.value(std::slice::from_ref(alias))? {
                JsonValue::Number(n) => n.as_f64(),
                JsonValue::String(s) => s.trim().replace(',', "").parse::<f64>().ok(),
                _ => None,
            };
            parsed.filter(|n| n.is_finite())
        })
    }

    /// Accepts "Yes"/"Y"/"true"/"1", numeric 1, and JSON booleans (and their negatives).
    pub fn flag(&self, aliases: &[String]) -> Option<bool> {
        aliases.iter().find_map(|alias| {
            match self.value(std::slice::from_ref(alias))? {
                JsonValue::Bool(b) => Some(*b),
                JsonValue::Number(n) => n.as_f64().map(|v| v != 0.0),
                JsonValue::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                    "yes" | "y" | "true" | "t" | "1" => Some(true),
                    "no" | "n" | "false" | "f" | "0" => Some(false),
                    _ => None,
                },
                _ => None,
            }
        })
    }

    pub fn array(&self, aliases: &[String]) -> &[JsonValue] {
        self.value(aliases)
            .and_then(JsonValue::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Canonical field name -> provider attribute names, tried in order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AliasTable(BTreeMap<String, Vec<String>>);

impl AliasTable {
    pub fn with_defaults(defaults: &[(&str, &[&str])], overrides: &AliasTable) -> Self {
        let mut table = defaults
            .iter()
            .map(|(field, names)| {
                (
                    field.to_string(),
                    names.iter().map(|n| n.to_string()).collect(),
                )
            })
            .collect::<BTreeMap<_, Vec<String>>>();
        for (field, names) in &overrides.0 {
            table.insert(field.clone(), names.clone());
        }
        Self(table)
    }

    pub fn names(&self, field: &str) -> &[String] {
        self.0.get(field).map(Vec::as_slice).unwrap_or(&[])
    }
}

const PARK_ALIASES: &[(&str, &[&str])] = &[
    ("name", &["PROP_NAME", "PARK_NAME", "NAME", "SITE_NAME", "UNIT_NAME"]),
    ("external_id", &["OBJECTID", "PROP_ID", "FID", "GLOBALID"]),
    ("designation", &["PROP_TYPE", "DESIGNATION", "UNIT_TYPE", "TYPE"]),
    ("acreage", &["GIS_ACRES", "ACRES", "ACREAGE", "CALC_ACRES"]),
    ("popularity", &["VISITATION", "ANNUAL_VISITS", "POPULARITY"]),
    ("website", &["WEBSITE", "URL", "WEB_URL", "PARK_URL"]),
    ("reservation_url", &["RESERVE_URL", "RESERVATION_URL"]),
    ("map_url", &["MAP_URL", "PARK_MAP"]),
    ("phone", &["PHONE", "PHONE_NUM", "PHONE_NUMBER"]),
    ("email", &["EMAIL", "EMAIL_ADDR"]),
    ("address", &["ADDRESS", "ADDR", "STREET_ADDRESS"]),
    ("activities", &["ACTIVITIES", "AMENITIES"]),
];

const TRAIL_ALIASES: &[(&str, &[&str])] = &[
    ("name", &["TRAIL_NAME", "TRL_NAME", "NAME"]),
    ("external_id", &["OBJECTID", "TRAIL_ID", "FID"]),
    ("park_name", &["PROP_NAME", "PARK_NAME", "UNIT_NAME"]),
    ("length_miles", &["MILES", "LENGTH_MI", "GIS_MILES", "LEN_MILES"]),
    ("length_meters", &["LENGTH_M", "LENGTH_METERS", "SHAPE_LENGTH_M"]),
    ("difficulty", &["DIFFICULTY", "DIFF", "TRAIL_DIFF"]),
    ("uses", &["USES", "ALLOWED_USES", "USE_TYPE"]),
    ("hiking", &["HIKE", "HIKING", "FOOT"]),
    ("biking", &["BIKE", "BIKING", "MTB"]),
    ("equestrian", &["HORSE", "EQUESTRIAN"]),
    ("paddling", &["PADDLE", "WATER_TRAIL"]),
    ("skiing", &["SKI", "XC_SKI", "SKIING"]),
    ("snowmobile", &["SNOWMOBILE", "SNOWMOB"]),
    ("motorized", &["ATV", "OHV", "MOTORIZED"]),
    ("accessible", &["ADA", "ACCESSIBLE"]),
];

const RIDB_ALIASES: &[(&str, &[&str])] = &[
    ("name", &["FacilityName"]),
    ("external_id", &["FacilityID"]),
    ("type", &["FacilityTypeDescription"]),
    ("latitude", &["FacilityLatitude"]),
    ("longitude", &["FacilityLongitude"]),
    ("phone", &["FacilityPhone"]),
    ("email", &["FacilityEmail"]),
    ("reservation_url", &["FacilityReservationURL"]),
    ("map_url", &["FacilityMapURL"]),
    ("reservable", &["Reservable"]),
    ("sites", &["FacilityNumberOfSites", "NumberOfSites"]),
    ("links", &["LINK"]),
    ("activities", &["ACTIVITY"]),
    ("addresses", &["FACILITYADDRESS"]),
];

const TRAIL_USE_FIELDS: &[(&str, TrailUse)] = &[
    ("hiking", TrailUse::Hiking),
    ("biking", TrailUse::Biking),
    ("equestrian", TrailUse::Equestrian),
    ("paddling", TrailUse::Paddling),
    ("skiing", TrailUse::Skiing),
    ("snowmobile", TrailUse::Snowmobile),
    ("motorized", TrailUse::Motorized),
    ("accessible", TrailUse::Accessible),
];

fn default_page_size() -> usize {
    1000
}

fn default_max_pages() -> usize {
    500
}

/// Where and how to page through one provider call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    pub base_url: String,
    #[serde(default)]
    pub filters: BTreeMap<String, String>,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    pub provider_id: String,
    pub kind: ProviderKind,
    pub endpoint: EndpointDescriptor,
    #[serde(default)]
    pub aliases: AliasTable,
    #[serde(default)]
    pub rate_limit: Option<TokenBucketConfig>,
    /// Credential name looked up in [`Credentials`].
    #[serde(default)]
    pub credential: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Page {
    pub records: Vec<RawRecord>,
    /// Explicit continuation signal, when the provider sends one.
    pub more: Option<bool>,
    /// Total matching records, when the provider reports it. Overrides `more`.
    pub total: Option<usize>,
}

/// Builds page requests and decodes page bodies for one pagination dialect.
pub trait PageCodec: Send + Sync {
    fn request(&self, endpoint: &EndpointDescriptor, offset: usize) -> HttpRequest;
    fn decode(&self, body: &[u8], offset: usize) -> Result<Page, String>;
}

/// Pages through `descriptor.endpoint` until the provider signals exhaustion.
///
/// With a reported total, paging stops once `offset + returned` reaches it.
/// Otherwise more data is assumed when the page carries an explicit
/// continuation flag or returns exactly the requested page size. Any transport
/// failure aborts the whole fetch; nothing partial is returned. Hitting
/// `max_pages` returns what was read so far with a warning.
pub async fn fetch_all_pages(
    http: &HttpFetcher,
    descriptor: &ProviderDescriptor,
    codec: &dyn PageCodec,
) -> Result<Vec<RawRecord>, AdapterError> {
    let endpoint = &descriptor.endpoint;
    let provider_id = descriptor.provider_id.as_str();
    if let Some(rate_limit) = descriptor.rate_limit {
        http.limiters().configure(provider_id, rate_limit).await;
    }

    let mut records = Vec::new();
    let mut offset = 0usize;
    for page_no in 0..endpoint.max_pages.max(1) {
        let request = codec.request(endpoint, offset);
        let response = http.fetch(provider_id, &request).await?;
        let page = codec
            .decode(&response.body, offset)
            .map_err(|message| AdapterError::Decode {
                provider_id: provider_id.to_string(),
                message,
            })?;

        let returned = page.records.len();
        records.extend(page.records);
        debug!(provider_id, page_no, offset, returned, "page fetched");

        let more = match page.total {
            Some(total) => offset + returned < total,
            None => page.more == Some(true) || returned >= endpoint.page_size,
        };
        if !more || returned == 0 {
            info!(provider_id, pages = page_no + 1, records = records.len(), "fetch complete");
            return Ok(records);
        }
        offset += returned;
    }

    warn!(
        provider_id,
        max_pages = endpoint.max_pages,
        records = records.len(),
        "page cap reached before provider signalled exhaustion"
    );
    Ok(records)
}

/// Feature-query dialect: `resultOffset`/`resultRecordCount`, `exceededTransferLimit`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureQueryCodec;

impl PageCodec for FeatureQueryCodec {
    fn request(&self, endpoint: &EndpointDescriptor, offset: usize) -> HttpRequest {
        let mut request = HttpRequest::get(&endpoint.base_url);
        let mut params: BTreeMap<&str, String> = BTreeMap::from([
            ("where", "1=1".to_string()),
            ("outFields", "*".to_string()),
            ("returnGeometry", "true".to_string()),
            ("outSR", "4326".to_string()),
            ("f", "json".to_string()),
        ]);
        for (key, value) in &endpoint.filters {
            params.insert(key.as_str(), value.clone());
        }
        params.insert("resultOffset", offset.to_string());
        params.insert("resultRecordCount", endpoint.page_size.to_string());
        for (key, value) in params {
            request = request.query(key, value);
        }
        request
    }

    fn decode(&self, body: &[u8], _offset: usize) -> Result<Page, String> {
        let value: JsonValue = serde_json::from_slice(body).map_err(|e| e.to_string())?;
        if let Some(err) = value.get("error") {
            let message = err
                .get("message")
                .and_then(JsonValue::as_str)
                .unwrap_or("unknown error");
            return Err(format!("feature query error: {message}"));
        }
        let features = value
            .get("features")
            .and_then(JsonValue::as_array)
            .ok_or_else(|| "missing features array".to_string())?;
        let records = features
            .iter()
            .map(|feature| RawRecord {
                attributes: feature
                    .get("attributes")
                    .and_then(JsonValue::as_object)
                    .cloned()
                    .unwrap_or_default(),
                geometry: feature.get("geometry").and_then(Geometry::from_feature_json),
            })
            .collect();
        Ok(Page {
            records,
            more: value
                .get("exceededTransferLimit")
                .and_then(JsonValue::as_bool),
            total: None,
        })
    }
}

/// Facility-catalog dialect: `offset`/`limit`, `METADATA.RESULTS` counts.
#[derive(Debug, Clone, Copy, Default)]
pub struct CatalogCodec;

impl PageCodec for CatalogCodec {
    fn request(&self, endpoint: &EndpointDescriptor, offset: usize) -> HttpRequest {
        let mut request = HttpRequest::get(&endpoint.base_url);
        for (key, value) in &endpoint.filters {
            request = request.query(key.as_str(), value);
        }
        request
            .query("limit", endpoint.page_size)
            .query("offset", offset)
    }

    fn decode(&self, body: &[u8], offset: usize) -> Result<Page, String> {
        let value: JsonValue = serde_json::from_slice(body).map_err(|e| e.to_string())?;
        let recdata = value
            .get("RECDATA")
            .and_then(JsonValue::as_array)
            .ok_or_else(|| "missing RECDATA array".to_string())?;
        let records = recdata
            .iter()
            .filter_map(|r| r.as_object().cloned())
            .map(RawRecord::from_attributes)
            .collect::<Vec<_>>();
        let results = value.get("METADATA").and_then(|m| m.get("RESULTS"));
        let count = |name: &str| {
            results
                .and_then(|r| r.get(name))
                .and_then(JsonValue::as_u64)
                .map(|n| n as usize)
        };
        let total = count("TOTAL_COUNT");
        let more = match (count("CURRENT_COUNT"), total) {
            (Some(current), Some(total)) => Some(offset + current < total),
            _ => None,
        };
        Ok(Page {
            records,
            more,
            total,
        })
    }
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider_id(&self) -> &str;
    fn kind(&self) -> ProviderKind;

    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &FetchContext,
    ) -> Result<Vec<RawRecord>, AdapterError>;

    fn normalize(
        &self,
        record: &RawRecord,
        ctx: &NormalizeContext,
    ) -> Result<CanonicalFragment, NormalizationError>;
}

fn required_name(record: &RawRecord, aliases: &AliasTable) -> Result<String, NormalizationError> {
    record
        .text(aliases.names("name"))
        .filter(|name| !slug(name).is_empty())
        .ok_or_else(|| NormalizationError::MissingName {
            external_id: record.text(aliases.names("external_id")),
        })
}

fn check_exclusion(name: &str, ctx: &NormalizeContext) -> Result<(), NormalizationError> {
    match ctx.override_for(name) {
        Some(rule) if rule.exclude => Err(NormalizationError::Excluded {
            name: name.to_string(),
            rule: rule.contains.clone(),
        }),
        _ => Ok(()),
    }
}

/// Appends the designation to bare names ("Devil's Lake" + "State Park").
fn display_name(name: &str, designation: Option<&str>) -> String {
    match designation {
        Some(d) if !d.is_empty() && !name.to_lowercase().ends_with(&d.to_lowercase()) => {
            format!("{name} {d}")
        }
        _ => name.to_string(),
    }
}

fn title_case(raw: &str) -> String {
    raw.split_whitespace()
        .map(|word| {
            let lower = word.to_lowercase();
            let mut chars = lower.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn link(link_type: LinkType, url: Option<String>, title: Option<String>) -> Option<OfficialLink> {
    let url = url?.trim().to_string();
    (url.starts_with("http://") || url.starts_with("https://")).then_some(OfficialLink {
        link_type,
        url,
        title,
    })
}

#[derive(Debug, Clone)]
pub struct FeatureQueryParksAdapter {
    descriptor: ProviderDescriptor,
    aliases: AliasTable,
}

impl FeatureQueryParksAdapter {
    pub fn new(descriptor: ProviderDescriptor) -> Self {
        let aliases = AliasTable::with_defaults(PARK_ALIASES, &descriptor.aliases);
        Self {
            descriptor,
            aliases,
        }
    }
}

#[async_trait]
impl ProviderAdapter for FeatureQueryParksAdapter {
    fn provider_id(&self) -> &str {
        &self.descriptor.provider_id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::FeatureQueryParks
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        _ctx: &FetchContext,
    ) -> Result<Vec<RawRecord>, AdapterError> {
        fetch_all_pages(http, &self.descriptor, &FeatureQueryCodec).await
    }

    fn normalize(
        &self,
        record: &RawRecord,
        ctx: &NormalizeContext,
    ) -> Result<CanonicalFragment, NormalizationError> {
        let a = &self.aliases;
        let raw_name = required_name(record, a)?;
        check_exclusion(&raw_name, ctx)?;

        let designation = ctx
            .override_for(&raw_name)
            .and_then(|o| o.designation.clone())
            .or_else(|| {
                record
                    .text(a.names("designation"))
                    .and_then(|raw| ctx.designation_for(&raw))
            });
        let name = display_name(&raw_name, designation.as_deref());

        let website = record.text(a.names("website"));
        let links: Vec<OfficialLink> = [
            link(LinkType::Official, website.clone(), None),
            link(LinkType::Reservation, record.text(a.names("reservation_url")), None),
            link(LinkType::Map, record.text(a.names("map_url")), None),
        ]
        .into_iter()
        .flatten()
        .collect();

        let activities = record
            .text(a.names("activities"))
            .map(|s| {
                s.split([',', ';'])
                    .map(title_case)
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        Ok(CanonicalFragment::Park(ParkFragment {
            provider_id: self.descriptor.provider_id.clone(),
            external_id: record.text(a.names("external_id")),
            category: designation.as_deref().map(ParkCategory::from_designation),
            designation,
            name,
            coordinates: record.geometry.as_ref().and_then(Geometry::representative_point),
            acreage: record.number(a.names("acreage")).filter(|v| *v > 0.0),
            popularity: record
                .number(a.names("popularity"))
                .filter(|v| *v >= 0.0)
                .map(|v| v.min(u32::MAX as f64) as u32),
            contact: ContactInfo {
                phone: record.text(a.names("phone")),
                email: record.text(a.names("email")),
                website,
                address: record.text(a.names("address")),
            },
            links,
            campgrounds: Vec::new(),
            activities,
        }))
    }
}

#[derive(Debug, Clone)]
pub struct FeatureQueryTrailsAdapter {
    descriptor: ProviderDescriptor,
    aliases: AliasTable,
}

impl FeatureQueryTrailsAdapter {
    pub fn new(descriptor: ProviderDescriptor) -> Self {
        let aliases = AliasTable::with_defaults(TRAIL_ALIASES, &descriptor.aliases);
        Self {
            descriptor,
            aliases,
        }
    }
}

fn uses_from_text(text: &str) -> BTreeSet<TrailUse> {
    text.split([',', ';', '/'])
        .filter_map(|token| {
            let token = token.trim().to_ascii_lowercase();
            if token.contains("hik") || token.contains("walk") || token == "foot" {
                Some(TrailUse::Hiking)
            } else if token.contains("bik") || token.contains("cycl") || token == "mtb" {
                Some(TrailUse::Biking)
            } else if token.contains("horse") || token.contains("equest") {
                Some(TrailUse::Equestrian)
            } else if token.contains("paddl") || token.contains("canoe") || token.contains("kayak") {
                Some(TrailUse::Paddling)
            } else if token.contains("snowmobil") {
                Some(TrailUse::Snowmobile)
            } else if token.contains("ski") {
                Some(TrailUse::Skiing)
            } else if token.contains("atv") || token.contains("ohv") || token.contains("motor") {
                Some(TrailUse::Motorized)
            } else if token == "ada" || token.contains("accessib") {
                Some(TrailUse::Accessible)
            } else {
                None
            }
        })
        .collect()
}

#[async_trait]
impl ProviderAdapter for FeatureQueryTrailsAdapter {
    fn provider_id(&self) -> &str {
        &self.descriptor.provider_id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::FeatureQueryTrails
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        _ctx: &FetchContext,
    ) -> Result<Vec<RawRecord>, AdapterError> {
        fetch_all_pages(http, &self.descriptor, &FeatureQueryCodec).await
    }

    fn normalize(
        &self,
        record: &RawRecord,
        ctx: &NormalizeContext,
    ) -> Result<CanonicalFragment, NormalizationError> {
        let a = &self.aliases;
        let name = required_name(record, a)?;
        check_exclusion(&name, ctx)?;

        let length_miles = record
            .number(a.names("length_miles"))
            .or_else(|| {
                record
                    .number(a.names("length_meters"))
                    .map(|m| m / METERS_PER_MILE)
            })
            .or_else(|| record.geometry.as_ref().and_then(Geometry::length_miles))
            .filter(|miles| *miles > 0.0)
            .map(|miles| (miles * 100.0).round() / 100.0);

        let explicit = record
            .text(a.names("difficulty"))
            .and_then(|raw| Difficulty::parse(&raw));
        let inferred = explicit
            .is_none()
            .then(|| length_miles.map(Difficulty::infer_from_miles))
            .flatten();

        let mut allowed_uses = record
            .text(a.names("uses"))
            .map(|text| uses_from_text(&text))
            .unwrap_or_default();
        for (field, trail_use) in TRAIL_USE_FIELDS {
            if record.flag(a.names(field)) == Some(true) {
                allowed_uses.insert(*trail_use);
            }
        }

        Ok(CanonicalFragment::Trail(TrailFragment {
            provider_id: self.descriptor.provider_id.clone(),
            external_id: record.text(a.names("external_id")),
            name,
            park_name: record.text(a.names("park_name")),
            length_miles,
            difficulty: explicit.or(inferred),
            difficulty_inferred: inferred.is_some(),
            allowed_uses,
            trailhead: record.geometry.as_ref().and_then(Geometry::representative_point),
        }))
    }
}

#[derive(Debug, Clone)]
pub struct RidbFacilitiesAdapter {
    descriptor: ProviderDescriptor,
    aliases: AliasTable,
}

impl RidbFacilitiesAdapter {
    pub fn new(descriptor: ProviderDescriptor) -> Self {
        let aliases = AliasTable::with_defaults(RIDB_ALIASES, &descriptor.aliases);
        Self {
            descriptor,
            aliases,
        }
    }

    fn credential_name(&self) -> &str {
        self.descriptor.credential.as_deref().unwrap_or("ridb")
    }
}

const CAMPGROUND_SUFFIXES: &[&str] = &[" group campground", " campgrounds", " campground"];

/// "Devils Lake Campground" -> "Devils Lake"; names without the suffix are kept.
fn campground_parent_name(name: &str) -> String {
    let lower = name.to_lowercase();
    CAMPGROUND_SUFFIXES
        .iter()
        .find_map(|suffix| {
            let cut = lower.strip_suffix(suffix)?.len();
            name.get(..cut).map(|parent| parent.trim().to_string())
        })
        .filter(|parent| !parent.is_empty())
        .unwrap_or_else(|| name.to_string())
}

fn ridb_link_type(raw: &str) -> LinkType {
    let lower = raw.to_ascii_lowercase();
    if lower.contains("reserv") {
        LinkType::Reservation
    } else if lower.contains("map") {
        LinkType::Map
    } else if lower.contains("direction") {
        LinkType::Directions
    } else if lower.contains("official") || lower.contains("web site") || lower.contains("website") {
        LinkType::Official
    } else {
        LinkType::Other
    }
}

fn json_text(value: &JsonValue, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(JsonValue::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

#[async_trait]
impl ProviderAdapter for RidbFacilitiesAdapter {
    fn provider_id(&self) -> &str {
        &self.descriptor.provider_id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::RidbFacilities
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &FetchContext,
    ) -> Result<Vec<RawRecord>, AdapterError> {
        let credential = self.credential_name();
        let api_key = ctx
            .credentials
            .get(credential)
            .ok_or_else(|| AdapterError::MissingCredential {
                provider_id: self.descriptor.provider_id.clone(),
                credential: credential.to_string(),
            })?;
        fetch_all_pages(
            http,
            &self.descriptor,
            &KeyedCodec {
                inner: CatalogCodec,
                header: ("apikey", api_key.to_string()),
            },
        )
        .await
    }

    fn normalize(
        &self,
        record: &RawRecord,
        ctx: &NormalizeContext,
    ) -> Result<CanonicalFragment, NormalizationError> {
        let a = &self.aliases;
        let facility_name = required_name(record, a)?;
        check_exclusion(&facility_name, ctx)?;
        let facility_type = record.text(a.names("type")).unwrap_or_default();
        let is_campground = facility_type.to_ascii_lowercase().contains("campground");

        let coordinates = match (
            record.number(a.names("latitude")),
            record.number(a.names("longitude")),
        ) {
            (Some(lat), Some(lon)) => Coordinates::new(lat, lon),
            _ => None,
        };

        let mut links: Vec<OfficialLink> = record
            .array(a.names("links"))
            .iter()
            .filter_map(|l| {
                let link_type = ridb_link_type(&json_text(l, "LinkType").unwrap_or_default());
                link(link_type, json_text(l, "URL"), json_text(l, "Title"))
            })
            .collect();
        let reservation_url = record.text(a.names("reservation_url"));
        links.extend(link(LinkType::Reservation, reservation_url.clone(), None));
        links.extend(link(LinkType::Map, record.text(a.names("map_url")), None));

        let activities: Vec<String> = record
            .array(a.names("activities"))
            .iter()
            .filter_map(|act| json_text(act, "ActivityName"))
            .map(|name| title_case(&name))
            .collect();

        let address = record.array(a.names("addresses")).first().and_then(|addr| {
            let parts = ["FacilityStreetAddress1", "City", "AddressStateCode", "PostalCode"]
                .iter()
                .filter_map(|k| json_text(addr, k))
                .collect::<Vec<_>>();
            (!parts.is_empty()).then(|| parts.join(", "))
        });

        let (name, campgrounds) = if is_campground {
            let campground = CampgroundSummary {
                name: facility_name.clone(),
                sites: record
                    .number(a.names("sites"))
                    .filter(|n| *n >= 0.0)
                    .map(|n| n as u32),
                reservable: record.flag(a.names("reservable")),
                reservation_url: reservation_url
                    .filter(|u| u.starts_with("http"))
                    .or_else(|| {
                        links
                            .iter()
                            .find(|l| matches!(l.link_type, LinkType::Reservation | LinkType::Official))
                            .map(|l| l.url.clone())
                    }),
                source_id: self.descriptor.provider_id.clone(),
            };
            (campground_parent_name(&facility_name), vec![campground])
        } else {
            (facility_name, Vec::new())
        };

        Ok(CanonicalFragment::Park(ParkFragment {
            provider_id: self.descriptor.provider_id.clone(),
            external_id: record.text(a.names("external_id")),
            name,
            designation: None,
            category: None,
            coordinates,
            acreage: None,
            popularity: None,
            contact: ContactInfo {
                phone: record.text(a.names("phone")),
                email: record.text(a.names("email")),
                website: None,
                address,
            },
            links,
            campgrounds,
            activities,
        }))
    }
}

/// Wraps a codec and attaches an auth header to every page request.
struct KeyedCodec<C> {
    inner: C,
    header: (&'static str, String),
}

impl<C: PageCodec> PageCodec for KeyedCodec<C> {
    fn request(&self, endpoint: &EndpointDescriptor, offset: usize) -> HttpRequest {
        self.inner
            .request(endpoint, offset)
            .header(self.header.0, self.header.1.clone())
    }

    fn decode(&self, body: &[u8], offset: usize) -> Result<Page, String> {
        self.inner.decode(body, offset)
    }
}

/// Provider registry: one adapter per descriptor, chosen by kind.
pub fn adapter_for(descriptor: &ProviderDescriptor) -> Box<dyn ProviderAdapter> {
    match descriptor.kind {
        ProviderKind::FeatureQueryParks => Box::new(FeatureQueryParksAdapter::new(descriptor.clone())),
        ProviderKind::FeatureQueryTrails => {
            Box::new(FeatureQueryTrailsAdapter::new(descriptor.clone()))
        }
        ProviderKind::RidbFacilities => Box::new(RidbFacilitiesAdapter::new(descriptor.clone())),
    }
}
