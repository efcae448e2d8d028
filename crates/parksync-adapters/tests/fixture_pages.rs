// Every recorded provider page decodes and maps through the registered adapter.

use std::collections::BTreeMap;
use std::path::Path;

use parksync_adapters::{
    adapter_for, AliasTable, CatalogCodec, EndpointDescriptor, FeatureQueryCodec, NormalizeContext,
    PageCodec, ProviderDescriptor, ProviderKind,
};
use parksync_core::CanonicalFragment;

fn descriptor(kind: ProviderKind) -> ProviderDescriptor {
    ProviderDescriptor {
        provider_id: "fixture".into(),
        kind,
        endpoint: EndpointDescriptor {
            base_url: "http://fixture.invalid/query".into(),
            filters: BTreeMap::new(),
            page_size: 1000,
            max_pages: 1,
        },
        aliases: AliasTable::default(),
        rate_limit: None,
        credential: None,
    }
}

fn map_pages(kind: ProviderKind, dir: &str, codec: &dyn PageCodec) -> (Vec<CanonicalFragment>, usize) {
    let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures").join(dir);
    let adapter = adapter_for(&descriptor(kind));
    let ctx = NormalizeContext {
        region: "WI".into(),
        designations: BTreeMap::from([("SP".to_string(), "State Park".to_string())]),
        ..Default::default()
    };

    let mut pages = std::fs::read_dir(&root)
        .expect("fixture dir")
        .map(|e| e.expect("dir entry").path())
        .collect::<Vec<_>>();
    pages.sort();
    assert!(!pages.is_empty(), "no fixture pages under {}", root.display());

    let mut fragments = Vec::new();
    let mut rejected = 0;
    for page in pages {
        let bytes = std::fs::read(&page).expect("read fixture");
        let decoded = codec
            .decode(&bytes, 0)
            .unwrap_or_else(|e| panic!("{}: {e}", page.display()));
        for record in &decoded.records {
            match adapter.normalize(record, &ctx) {
                Ok(fragment) => fragments.push(fragment),
                Err(_) => rejected += 1,
            }
        }
    }
    (fragments, rejected)
}

#[test]
fn park_pages_map_to_park_fragments() {
    let (fragments, rejected) = map_pages(ProviderKind::FeatureQueryParks, "feature_query_parks", &FeatureQueryCodec);
    assert_eq!(fragments.len(), 3);
    assert_eq!(rejected, 1);
    assert!(fragments.iter().all(|f| matches!(f, CanonicalFragment::Park(_))));
    assert!(fragments.iter().all(|f| f.provider_id() == "fixture"));
}

#[test]
fn trail_pages_map_to_trail_fragments() {
    let (fragments, rejected) = map_pages(ProviderKind::FeatureQueryTrails, "feature_query_trails", &FeatureQueryCodec);
    assert_eq!(fragments.len(), 2);
    assert_eq!(rejected, 0);
    assert!(fragments.iter().all(|f| matches!(f, CanonicalFragment::Trail(_))));
}

#[test]
fn facility_pages_map_to_park_fragments() {
    let (fragments, rejected) = map_pages(ProviderKind::RidbFacilities, "ridb_facilities", &CatalogCodec);
    assert_eq!(fragments.len(), 2);
    assert_eq!(rejected, 0);
    let names = fragments.iter().map(|f| f.name()).collect::<Vec<_>>();
    assert!(names.contains(&"Devils Lake"));
}
