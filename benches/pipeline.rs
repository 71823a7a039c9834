//! Benchmarks for the aggregation pipeline.
//!
//! Covers payload decoding, ingest with incremental projection, criteria
//! changes over a populated store, and the full application loop with a
//! FakeScanner feeding sightings through run_with_io.

use ble_scanner::advertising::{AdvertisingData, AdvertisingDataBuilder, uuid_from_u16};
use ble_scanner::app::{Options, run_with_io};
use ble_scanner::scanner::ScanFuture;
use ble_scanner::{
    AggregationStore, FilterCriteria, Observation, PeripheralId, PlatformEvent, Projection,
    Scanner, Sighting,
};
use clap::Parser;
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;

/// Typical heart-rate sensor advertisement
fn hrm_payload() -> Vec<u8> {
    AdvertisingDataBuilder::new()
        .flags(0x06)
        .complete_name("Nordic HRM")
        .service_uuids([uuid_from_u16(0x180D), uuid_from_u16(0x180F)])
        .tx_power(-4)
        .manufacturer_data(0x0059, &[0x01, 0x02, 0x03, 0x04])
        .build()
}

fn peripheral_id(index: usize) -> PeripheralId {
    let bytes = (index as u32).to_be_bytes();
    PeripheralId::from([0xAA, 0xBB, bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// `count` sightings spread over `peripherals` distinct devices.
fn sightings(count: usize, peripherals: usize) -> Vec<Sighting> {
    let payload = hrm_payload();
    (0..count)
        .map(|i| Sighting::new(peripheral_id(i % peripherals), -40 - (i % 60) as i16, payload.clone()))
        .collect()
}

/// A fake scanner that replays sightings, similar to the one in app.rs tests.
struct FakeScanner {
    events: Vec<PlatformEvent>,
}

impl Scanner for FakeScanner {
    fn start_scan(&self) -> ScanFuture<'_> {
        let events = self.events.clone();
        Box::pin(async move {
            let (tx, rx) = mpsc::channel::<PlatformEvent>(events.len().max(1));
            tokio::spawn(async move {
                for event in events {
                    let _ = tx.send(event).await;
                }
            });
            Ok(rx)
        })
    }
}

fn bench_decode(c: &mut Criterion) {
    let payload = hrm_payload();
    c.bench_function("decode_advertising_data", |b| {
        b.iter(|| AdvertisingData::decode(black_box(&payload)))
    });
}

fn bench_ingest(c: &mut Criterion) {
    let mut group = c.benchmark_group("ingest");

    for peripherals in [10, 100, 1000] {
        let observations: Vec<Observation> =
            sightings(5000, peripherals).into_iter().map(Observation::from).collect();
        let criteria = FilterCriteria::all().with_name("hrm").with_min_rssi(-70);

        group.throughput(Throughput::Elements(observations.len() as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(peripherals),
            &observations,
            |b, observations| {
                b.iter(|| {
                    let mut store = AggregationStore::new();
                    let mut projection = Projection::new(criteria.clone());
                    for observation in observations {
                        let change = store.ingest(observation.clone());
                        projection.apply(change, &store);
                    }
                    black_box(projection.collect(&store))
                })
            },
        );
    }

    group.finish();
}

fn bench_criteria_change(c: &mut Criterion) {
    let mut store = AggregationStore::new();
    for sighting in sightings(1000, 1000) {
        store.ingest(sighting.into());
    }
    let strict = FilterCriteria::all().nearby_only();
    let loose = FilterCriteria::all().with_service(uuid_from_u16(0x180D));

    c.bench_function("criteria_change_1000", |b| {
        let mut projection = Projection::new(loose.clone());
        projection.rebuild(&store);
        b.iter(|| {
            projection.set_criteria(strict.clone(), &store);
            projection.set_criteria(loose.clone(), &store);
            black_box(projection.len())
        })
    });
}

/// Benchmark the full application pipeline: scanner -> decode -> aggregate -> filter -> format -> write
fn bench_app_pipeline(c: &mut Criterion) {
    let mut group = c.benchmark_group("app_pipeline");
    let rt = Runtime::new().unwrap();

    for count in [1, 100] {
        let events: Vec<PlatformEvent> = sightings(count, 10)
            .into_iter()
            .map(PlatformEvent::Sighting)
            .collect();

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &events, |b, events| {
            b.iter(|| {
                let scanner = Arc::new(FakeScanner {
                    events: events.clone(),
                });
                let options = Options::try_parse_from(["ble-scanner", "--refresh", "0"]).unwrap();
                let mut out = Vec::<u8>::with_capacity(4096);
                let mut err = Vec::<u8>::new();

                rt.block_on(async {
                    run_with_io(options, scanner, &mut out, &mut err)
                        .await
                        .unwrap();
                });

                black_box(out)
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_decode,
    bench_ingest,
    bench_criteria_change,
    bench_app_pipeline
);
criterion_main!(benches);
