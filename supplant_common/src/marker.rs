//! The marker we leave on every object we create or rewrite.
//!
//! This is the only state that survives a crashed run, so a later run (or
//! `supplant clean`) can find substitute endpoints nobody cleaned up.

use crate::kubernetes::{Cluster, ObjectMeta, Service};
use crate::prelude::*;

/// Label and annotation key.
pub const MARKER_KEY: &str = "supplant";

/// Label and annotation value.
pub const MARKER_VALUE: &str = "true";

/// Label selector matching marked objects.
pub fn marker_selector() -> String {
    format!("{}={}", MARKER_KEY, MARKER_VALUE)
}

/// Tag `meta` with our marker, as both a label and an annotation.
pub fn apply_marker(meta: &mut ObjectMeta) {
    meta.labels
        .insert(MARKER_KEY.to_owned(), MARKER_VALUE.to_owned());
    meta.annotations
        .insert(MARKER_KEY.to_owned(), MARKER_VALUE.to_owned());
}

/// Does `meta` carry our marker label?
pub fn has_marker(meta: &ObjectMeta) -> bool {
    meta.labels.get(MARKER_KEY).map(String::as_str) == Some(MARKER_VALUE)
}

/// Delete every substitute endpoints object that still carries our marker,
/// including any left behind by a run that crashed. Returns how many we
/// deleted. Running this twice in a row deletes nothing the second time.
#[instrument(level = "debug", skip(cluster))]
pub fn sweep_marked_endpoints<C>(cluster: &C) -> Result<usize>
where
    C: Cluster + ?Sized,
{
    let mut deleted = 0;
    for ep in cluster.endpoints_matching(&marker_selector())? {
        let meta = &ep.metadata;
        if cluster
            .delete_endpoints(&meta.namespace, &meta.name)
            .with_context(|| {
                format!("error deleting endpoints {}/{}", meta.namespace, meta.name)
            })?
        {
            info!("deleted orphaned endpoints {}/{}", meta.namespace, meta.name);
            deleted += 1;
        }
    }
    Ok(deleted)
}

/// Services which still point at a developer machine. We can't restore these
/// without the snapshot from the run that changed them, so all we can do is
/// report them.
pub fn marked_services<C>(cluster: &C) -> Result<Vec<Service>>
where
    C: Cluster + ?Sized,
{
    cluster.services_matching(&marker_selector())
}

#[test]
fn marker_round_trips_through_metadata() {
    let mut meta = ObjectMeta::named("default", "api");
    assert!(!has_marker(&meta));
    apply_marker(&mut meta);
    assert!(has_marker(&meta));
    assert_eq!(meta.annotations[MARKER_KEY], MARKER_VALUE);
    assert_eq!(marker_selector(), "supplant=true");
}

#[test]
fn sweeping_twice_is_a_no_op() {
    use crate::kubernetes::{EndpointPort, Endpoints, Protocol};
    use crate::testing::FakeCluster;

    let cluster = FakeCluster::new();
    let ip = IpAddr::from([10, 0, 0, 9]);
    let port = EndpointPort {
        name: None,
        port: 9000,
        protocol: Protocol::Tcp,
    };
    let mut orphan = Endpoints::single_address("ns", "api", ip, vec![port.clone()]);
    apply_marker(&mut orphan.metadata);
    cluster.add_endpoints(orphan);
    cluster.add_endpoints(Endpoints::single_address("ns", "db", ip, vec![port]));

    assert_eq!(sweep_marked_endpoints(&cluster).expect("sweep"), 1);
    let after_first = cluster.mutations();
    assert_eq!(after_first, vec!["delete endpoints ns/api"]);
    assert!(cluster.get_endpoints("ns", "db").is_some());

    assert_eq!(sweep_marked_endpoints(&cluster).expect("sweep again"), 0);
    assert_eq!(cluster.mutations(), after_first);
}
