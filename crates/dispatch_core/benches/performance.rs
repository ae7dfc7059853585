//! Performance benchmarks for dispatch_core using Criterion.rs.

use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use dispatch_core::clock::{Clock, ManualClock};
use dispatch_core::geo_index::{GeoIndex, IndexSettings};
use dispatch_core::lease::{AssignmentLock, InMemoryLeaseStore};
use dispatch_core::surge::SurgeTracker;
use dispatch_core::test_helpers::{east_of, north_of, SF_CENTER, SF_PICKUP, TEST_EPOCH_MS};
use dispatch_core::{DriverId, GeoPoint, TripId, VehicleClass};
use h3o::Resolution;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn random_point(rng: &mut StdRng, spread_km: f64) -> GeoPoint {
    north_of(
        east_of(SF_CENTER, rng.gen_range(-spread_km..spread_km)),
        rng.gen_range(-spread_km..spread_km),
    )
}

fn populated_index(drivers: u64) -> GeoIndex {
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(TEST_EPOCH_MS));
    let surge = Arc::new(SurgeTracker::new(Resolution::Seven, 2.5));
    let index = GeoIndex::new(IndexSettings::default(), clock).with_surge(surge);
    let mut rng = StdRng::seed_from_u64(42);
    for driver in 0..drivers {
        index
            .upsert(
                DriverId(driver),
                VehicleClass::Economy,
                random_point(&mut rng, 10.0),
                TEST_EPOCH_MS,
            )
            .expect("valid point");
    }
    index
}

fn bench_geo_index(c: &mut Criterion) {
    let mut group = c.benchmark_group("geo_index");
    for drivers in [1_000u64, 10_000, 50_000] {
        let index = populated_index(drivers);

        group.bench_with_input(
            BenchmarkId::new("query_nearby_k3", drivers),
            &index,
            |b, index| {
                b.iter(|| {
                    black_box(
                        index
                            .query_nearby(SF_PICKUP, VehicleClass::Economy, 3, 5.0)
                            .expect("query"),
                    )
                });
            },
        );

        let mut rng = StdRng::seed_from_u64(7);
        let mut ts = TEST_EPOCH_MS;
        group.bench_with_input(BenchmarkId::new("upsert_move", drivers), &index, |b, index| {
            b.iter(|| {
                ts += 1;
                let driver = DriverId(rng.gen_range(0..drivers));
                index
                    .upsert(driver, VehicleClass::Economy, random_point(&mut rng, 10.0), ts)
                    .expect("upsert");
            });
        });
    }
    group.finish();
}

fn bench_lease(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("runtime");
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(TEST_EPOCH_MS));
    let lock = AssignmentLock::new(
        Arc::new(InMemoryLeaseStore::new(clock)),
        Duration::from_millis(500),
    );
    let ttl = Duration::from_secs(120);

    let mut trip = 0u64;
    c.bench_function("lease_acquire_release", |b| {
        b.iter(|| {
            trip += 1;
            let driver = DriverId(trip % 1_000);
            runtime.block_on(async {
                let acquired = lock.try_acquire(driver, TripId(trip), ttl).await;
                black_box(acquired.expect("acquire"));
                lock.release(driver, TripId(trip)).await.expect("release");
            });
        });
    });
}

criterion_group!(benches, bench_geo_index, bench_lease);
criterion_main!(benches);
