// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! End-to-end scenarios for the registration and observation stores.
//!
//! Everything runs against the in-process backend, the same way the stores
//! run against Redis in production: through the pooled connection trait,
//! the peer lock, and the real codec.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use fleet_store::{
    ExpirationListener, ExpirationSweeper, KvBackend, KvConnection, MemoryBackend, Observation,
    ObservationRecord, ObservationStore, Registration, RegistrationStore, RegistrationUpdate,
    ResourcePath, StoreConfig, Token,
};

fn harness(config: StoreConfig) -> (Arc<dyn KvBackend>, RegistrationStore, ObservationStore) {
    let backend: Arc<dyn KvBackend> = Arc::new(MemoryBackend::new());
    let registrations = RegistrationStore::new(Arc::clone(&backend), config.clone());
    let observations = ObservationStore::new(Arc::clone(&backend), config);
    (backend, registrations, observations)
}

fn registration(id: &str, endpoint: &str, addr: &str, lifetime: Duration) -> Registration {
    Registration::new(
        id,
        endpoint,
        addr.parse().unwrap(),
        lifetime,
        Bytes::from_static(b"</1/0>,</3/0>;ver=1.1"),
    )
}

fn record(token: &[u8], registration_id: &str, endpoint: &str, path: ResourcePath) -> ObservationRecord {
    ObservationRecord {
        token: Token::new(token.to_vec()),
        registration_id: registration_id.to_string(),
        endpoint: endpoint.to_string(),
        path,
        payload: Bytes::from_static(b"\x45\x01\xab\xcd"),
        context: BTreeMap::new(),
    }
}

/// Endpoints currently present in the expiration queue.
async fn expiration_queue(backend: &Arc<dyn KvBackend>) -> HashSet<String> {
    let mut conn = backend.acquire().await.unwrap();
    conn.zrangebyscore(b"EXP:EP", f64::MAX, usize::MAX)
        .await
        .unwrap()
        .into_iter()
        .map(|endpoint| String::from_utf8(endpoint).unwrap())
        .collect()
}

#[derive(Default)]
struct RecordingListener {
    expired: Mutex<Vec<(String, Vec<Observation>)>>,
}

#[async_trait]
impl ExpirationListener for RecordingListener {
    async fn registration_expired(
        &self,
        registration: Registration,
        observations: Vec<Observation>,
    ) -> anyhow::Result<()> {
        self.expired
            .lock()
            .push((registration.endpoint, observations));
        Ok(())
    }
}

// =============================================================================
// Registration scenarios
// =============================================================================

#[tokio::test]
async fn test_register_then_lookup_through_every_index() {
    let (_, registrations, _) = harness(StoreConfig::default());
    let r = registration("R1", "dev-A", "10.0.0.1:5683", Duration::from_secs(60));

    assert!(registrations.add(&r).await.unwrap().is_none());

    assert_eq!(registrations.get("R1").await.unwrap(), Some(r.clone()));
    assert_eq!(
        registrations.get_by_endpoint("dev-A").await.unwrap(),
        Some(r.clone())
    );
    assert_eq!(
        registrations
            .get_by_address(&"10.0.0.1:5683".parse().unwrap())
            .await
            .unwrap(),
        Some(r)
    );
}

#[tokio::test]
async fn test_reregistration_supersedes_prior_session() {
    let (_, registrations, _) = harness(StoreConfig::default());
    registrations
        .add(&registration("R1", "dev-A", "10.0.0.1:5683", Duration::from_secs(60)))
        .await
        .unwrap();

    let dereg = registrations
        .add(&registration("R2", "dev-A", "10.0.0.1:5683", Duration::from_secs(60)))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(dereg.registration.id, "R1");
    assert!(dereg.observations.is_empty());
    assert_eq!(registrations.get("R1").await.unwrap(), None);
    assert_eq!(registrations.get("R2").await.unwrap().unwrap().id, "R2");
}

#[tokio::test]
async fn test_non_ascii_endpoint_and_scoped_ipv6_address() {
    let (_, registrations, _) = harness(StoreConfig::default());
    let address = SocketAddr::from(SocketAddrV6::new(
        "fe80::1".parse::<Ipv6Addr>().unwrap(),
        5683,
        0,
        3,
    ));
    let r = Registration::new(
        "R1",
        "capteur-température-éß",
        address,
        Duration::from_secs(60),
        Bytes::new(),
    );

    registrations.add(&r).await.unwrap();

    assert_eq!(registrations.get("R1").await.unwrap(), Some(r.clone()));
    assert_eq!(
        registrations
            .get_by_endpoint("capteur-température-éß")
            .await
            .unwrap(),
        Some(r.clone())
    );
    assert_eq!(
        registrations.get_by_address(&address).await.unwrap(),
        Some(r.clone())
    );

    // the same host without a scope id is a different peer
    let unscoped = SocketAddr::from(SocketAddrV6::new(
        "fe80::1".parse::<Ipv6Addr>().unwrap(),
        5683,
        0,
        0,
    ));
    assert_eq!(registrations.get_by_address(&unscoped).await.unwrap(), None);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_adds_on_one_endpoint_leave_one_survivor() {
    let (_, registrations, _) = harness(StoreConfig::default());

    let mut workers = Vec::new();
    for i in 0..8 {
        let registrations = registrations.clone();
        workers.push(tokio::spawn(async move {
            let r = registration(
                &format!("R{}", i),
                "dev-A",
                "10.0.0.1:5683",
                Duration::from_secs(60),
            );
            (format!("R{}", i), registrations.add(&r).await.unwrap())
        }));
    }

    let mut added = HashSet::new();
    let mut evicted = HashSet::new();
    let mut fresh = 0;
    for worker in workers {
        let (id, dereg) = worker.await.unwrap();
        added.insert(id);
        match dereg {
            None => fresh += 1,
            Some(dereg) => {
                evicted.insert(dereg.registration.id);
            }
        }
    }

    // exactly one add saw an empty endpoint; every other one evicted a
    // distinct prior session
    assert_eq!(fresh, 1);
    assert_eq!(evicted.len(), 7);

    let survivor = registrations.get_by_endpoint("dev-A").await.unwrap().unwrap();
    assert!(added.contains(&survivor.id));
    assert!(!evicted.contains(&survivor.id));

    // losers resolve to nothing through the id index
    for id in evicted {
        assert_eq!(registrations.get(&id).await.unwrap(), None);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_address_updates_keep_one_binding() {
    let (_, registrations, _) = harness(StoreConfig::default());
    registrations
        .add(&registration("R1", "dev", "10.0.0.1:5683", Duration::from_secs(60)))
        .await
        .unwrap();

    let a1: SocketAddr = "10.0.0.101:5683".parse().unwrap();
    let a2: SocketAddr = "10.0.0.102:5683".parse().unwrap();

    let u1 = {
        let registrations = registrations.clone();
        tokio::spawn(async move {
            registrations
                .update(&RegistrationUpdate::new("R1").with_address(a1))
                .await
                .unwrap()
        })
    };
    let u2 = {
        let registrations = registrations.clone();
        tokio::spawn(async move {
            registrations
                .update(&RegistrationUpdate::new("R1").with_address(a2))
                .await
                .unwrap()
        })
    };
    u1.await.unwrap().unwrap();
    u2.await.unwrap().unwrap();

    let via_a1 = registrations.get_by_address(&a1).await.unwrap();
    let via_a2 = registrations.get_by_address(&a2).await.unwrap();

    // exactly one address key remains, naming the endpoint, and it matches
    // the primary record
    let current = registrations.get_by_endpoint("dev").await.unwrap().unwrap();
    match (via_a1, via_a2) {
        (Some(r), None) => {
            assert_eq!(r.endpoint, "dev");
            assert_eq!(current.address, a1);
        }
        (None, Some(r)) => {
            assert_eq!(r.endpoint, "dev");
            assert_eq!(current.address, a2);
        }
        other => panic!("expected exactly one binding, got {:?}", other),
    }
}

// =============================================================================
// Observation scenarios
// =============================================================================

#[tokio::test]
async fn test_new_observation_supersedes_same_path() {
    let (_, registrations, observations) = harness(StoreConfig::default());
    registrations
        .add(&registration("R1", "dev-A", "10.0.0.1:5683", Duration::from_secs(60)))
        .await
        .unwrap();

    let old = record(&[0xab], "R1", "dev-A", ResourcePath::resource(3, 0, 1));
    observations.put(&old).await.unwrap();

    let new = record(&[0xcd], "R1", "dev-A", ResourcePath::resource(3, 0, 1));
    observations.put(&new).await.unwrap();
    let evicted = observations.add_observation("R1", &new).await.unwrap();

    assert_eq!(evicted.len(), 1);
    assert_eq!(evicted[0].token, Token::new(vec![0xab]));
    assert_eq!(observations.get(&old.token).await.unwrap(), None);
    assert!(observations.get(&new.token).await.unwrap().is_some());
}

#[tokio::test]
async fn test_deregistration_carries_observations_away() {
    let (backend, registrations, observations) = harness(StoreConfig::default());
    registrations
        .add(&registration("R1", "dev-A", "10.0.0.1:5683", Duration::from_secs(60)))
        .await
        .unwrap();
    observations
        .put(&record(&[0xab], "R1", "dev-A", ResourcePath::resource(3, 0, 1)))
        .await
        .unwrap();
    observations
        .put(&record(&[0xcd], "R1", "dev-A", ResourcePath::resource(4, 0, 2)))
        .await
        .unwrap();

    let dereg = registrations.remove("R1").await.unwrap().unwrap();

    let tokens: HashSet<Token> = dereg.observations.iter().map(|o| o.token.clone()).collect();
    assert_eq!(
        tokens,
        HashSet::from([Token::new(vec![0xab]), Token::new(vec![0xcd])])
    );
    assert_eq!(observations.get(&Token::new(vec![0xab])).await.unwrap(), None);
    assert!(observations.get_observations("R1").await.unwrap().is_empty());

    // the token list itself is gone too
    let mut conn = backend.acquire().await.unwrap();
    assert!(conn.lrange(b"TKNS:REGID:R1").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_token_collision_across_registrations() {
    let (_, registrations, observations) = harness(StoreConfig::default());
    registrations
        .add(&registration("R1", "dev-A", "10.0.0.1:5683", Duration::from_secs(60)))
        .await
        .unwrap();
    registrations
        .add(&registration("R2", "dev-B", "10.0.0.2:5683", Duration::from_secs(60)))
        .await
        .unwrap();

    let first = record(&[0x77], "R1", "dev-A", ResourcePath::resource(3, 0, 1));
    observations.put(&first).await.unwrap();

    // put_if_absent from the other registration preserves the original
    let clash_kept = record(&[0x77], "R2", "dev-B", ResourcePath::resource(5, 0, 3));
    let existing = observations.put_if_absent(&clash_kept).await.unwrap().unwrap();
    assert_eq!(existing.registration_id, "R1");
    assert_eq!(observations.get(&first.token).await.unwrap(), Some(first.clone()));

    // a plain put returns the older observation and overwrites it
    let prior = observations.put(&clash_kept).await.unwrap().unwrap();
    assert_eq!(prior, first);
    assert_eq!(
        observations.get(&first.token).await.unwrap().unwrap().registration_id,
        "R2"
    );

    // the losing registration no longer lists the token
    assert!(observations.get_observations("R1").await.unwrap().is_empty());
    assert_eq!(observations.get_observations("R2").await.unwrap().len(), 1);
}

// =============================================================================
// Expiration scenarios
// =============================================================================

#[tokio::test]
async fn test_sweeper_evicts_lapsed_registration_and_notifies() {
    let config = StoreConfig::default().with_clean_period(Duration::from_millis(100));
    let (_, registrations, _) = harness(config);
    registrations
        .add(&registration("R1", "dev-B", "10.0.0.1:5683", Duration::from_secs(1)))
        .await
        .unwrap();

    let listener = Arc::new(RecordingListener::default());
    let sweeper = ExpirationSweeper::new(registrations.clone(), listener.clone());
    sweeper.start();

    // still alive within its lifetime
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(registrations.get("R1").await.unwrap().is_some());
    assert!(listener.expired.lock().is_empty());

    // gone once the lifetime lapses and a tick has run
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(registrations.get("R1").await.unwrap(), None);
    {
        let expired = listener.expired.lock();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, "dev-B");
        assert!(expired[0].1.is_empty());
    }

    sweeper.stop().await;
}

#[tokio::test]
async fn test_grace_period_defers_eviction() {
    let config = StoreConfig::default().with_grace_period(Duration::from_secs(60));
    let (_, registrations, _) = harness(config);
    registrations
        .add(&registration("R1", "dev-B", "10.0.0.1:5683", Duration::ZERO))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    let listener = Arc::new(RecordingListener::default());
    let sweeper = ExpirationSweeper::new(registrations.clone(), listener.clone());

    assert_eq!(sweeper.run_once().await.unwrap(), 0);
    assert!(registrations.get("R1").await.unwrap().is_some());
}

// =============================================================================
// Randomized operation sequences
// =============================================================================

const ADDR_POOL: [&str; 4] = [
    "10.0.0.1:5683",
    "10.0.0.2:5683",
    "10.0.0.3:5683",
    "[fe80::1]:5683",
];

const PATH_POOL: [ResourcePath; 3] = [
    ResourcePath {
        object_id: 3,
        instance_id: Some(0),
        resource_id: Some(1),
    },
    ResourcePath {
        object_id: 4,
        instance_id: Some(0),
        resource_id: Some(2),
    },
    ResourcePath {
        object_id: 6,
        instance_id: None,
        resource_id: None,
    },
];

#[tokio::test]
async fn test_random_operation_sequences_preserve_invariants() {
    let mut rng = StdRng::seed_from_u64(0x5EED);
    let (backend, registrations, observations) = harness(StoreConfig::default());

    // model of expected live state
    let mut live: HashMap<String, Registration> = HashMap::new(); // endpoint -> record
    let mut observed: HashMap<String, HashMap<ResourcePath, Token>> = HashMap::new();
    let mut dead_tokens: Vec<Token> = Vec::new();
    let mut next_id = 0u32;
    let mut next_token = 0u32;

    for _ in 0..200 {
        let endpoint = format!("dev-{}", rng.gen_range(0..6));
        match rng.gen_range(0..4) {
            // register (or re-register) the endpoint
            0 => {
                next_id += 1;
                let r = registration(
                    &format!("reg-{}", next_id),
                    &endpoint,
                    ADDR_POOL[rng.gen_range(0..ADDR_POOL.len())],
                    Duration::from_secs(60),
                );
                let dereg = registrations.add(&r).await.unwrap();
                if let Some(dereg) = dereg {
                    assert_eq!(Some(&dereg.registration), live.get(&endpoint));
                    observed.remove(&dereg.registration.id);
                    dead_tokens.extend(dereg.observations.into_iter().map(|o| o.token));
                }
                live.insert(endpoint, r);
            }
            // update address and lifetime
            1 => {
                let Some(current) = live.get(&endpoint).cloned() else {
                    continue;
                };
                let update = RegistrationUpdate::new(&current.id)
                    .with_address(ADDR_POOL[rng.gen_range(0..ADDR_POOL.len())].parse().unwrap())
                    .with_lifetime(Duration::from_secs(rng.gen_range(30..120)));
                let updated = registrations.update(&update).await.unwrap().unwrap();
                assert_eq!(updated.previous, current);
                live.insert(endpoint, updated.updated);
            }
            // deregister
            2 => {
                let Some(current) = live.remove(&endpoint) else {
                    continue;
                };
                let dereg = registrations.remove(&current.id).await.unwrap().unwrap();
                assert_eq!(dereg.registration, current);
                observed.remove(&current.id);
                dead_tokens.extend(dereg.observations.into_iter().map(|o| o.token));
            }
            // observe a resource path (transport put + handler supersession)
            _ => {
                let Some(current) = live.get(&endpoint) else {
                    continue;
                };
                next_token += 1;
                let path = PATH_POOL[rng.gen_range(0..PATH_POOL.len())];
                let rec = ObservationRecord {
                    token: Token::new(next_token.to_be_bytes().to_vec()),
                    registration_id: current.id.clone(),
                    endpoint: endpoint.clone(),
                    path,
                    payload: Bytes::from_static(b"req"),
                    context: BTreeMap::new(),
                };
                observations.put(&rec).await.unwrap();
                let evicted = observations.add_observation(&current.id, &rec).await.unwrap();

                let paths = observed.entry(current.id.clone()).or_default();
                match paths.insert(path, rec.token.clone()) {
                    Some(superseded) => {
                        assert_eq!(evicted.len(), 1);
                        assert_eq!(evicted[0].token, superseded);
                        dead_tokens.push(superseded);
                    }
                    None => assert!(evicted.is_empty()),
                }
            }
        }
    }

    // primary record, id index, and endpoint key agree for every live record
    for (endpoint, expected) in &live {
        assert_eq!(
            registrations.get(&expected.id).await.unwrap().as_ref(),
            Some(expected)
        );
        assert_eq!(
            registrations.get_by_endpoint(endpoint).await.unwrap().as_ref(),
            Some(expected)
        );
    }

    // the primary keyspace holds exactly the live registrations
    let scanned = registrations.all().collect().await.unwrap();
    let scanned_ids: HashSet<String> = scanned.into_iter().map(|r| r.id).collect();
    let live_ids: HashSet<String> = live.values().map(|r| r.id.clone()).collect();
    assert_eq!(scanned_ids, live_ids);

    // the expiration queue holds exactly the live endpoints
    let queued = expiration_queue(&backend).await;
    let live_endpoints: HashSet<String> = live.keys().cloned().collect();
    assert_eq!(queued, live_endpoints);

    // every address binding names a live registration holding that address
    for addr in ADDR_POOL {
        let addr: SocketAddr = addr.parse().unwrap();
        if let Some(bound) = registrations.get_by_address(&addr).await.unwrap() {
            assert_eq!(bound.address, addr);
            assert_eq!(live.get(&bound.endpoint), Some(&bound));
        }
    }

    // observations of removed registrations are gone; at most one
    // observation per (registration, path) remains
    for token in &dead_tokens {
        assert_eq!(observations.get(token).await.unwrap(), None);
    }
    for (registration_id, paths) in &observed {
        let stored = observations.get_observations(registration_id).await.unwrap();
        assert_eq!(stored.len(), paths.len());
        let stored_paths: HashSet<ResourcePath> = stored.iter().map(|o| o.path).collect();
        assert_eq!(stored_paths.len(), stored.len());
        for observation in stored {
            assert_eq!(paths.get(&observation.path), Some(&observation.token));
        }
    }
}
