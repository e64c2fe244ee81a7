// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Engine integration tests: write/read/ack/nack on the RAM tier.
//!
//! Run with: `cargo test`

use sensorstore::config::{EngineConfig, TimeSource};
use sensorstore::engine::Engine;
use sensorstore::error::StoreError;
use sensorstore::sector::{TsdEvtValue, SECTOR_PAYLOAD_BYTES};
use sensorstore::sensor::{DataKind, SensorConfig};
use sensorstore::source::UploadSource;

/// RAM-only engine with a caller-driven clock, `sectors` sectors wide.
fn ram_engine(sectors: usize) -> Engine {
    Engine::new(EngineConfig {
        pool_bytes: sectors * SECTOR_PAYLOAD_BYTES,
        time_source: TimeSource::Manual,
        spool: None,
    })
    .expect("engine")
}

fn tsd_sensor(engine: &Engine, id: u32, rate_ms: u64) -> std::sync::Arc<sensorstore::sensor::SensorHandle> {
    let handle = engine
        .configure_sensor(
            UploadSource::Gateway,
            SensorConfig { id, kind: DataKind::Tsd { sample_rate_ms: rate_ms } },
        )
        .expect("configure");
    engine.activate_sensor(&handle).expect("activate");
    handle
}

fn evt_sensor(engine: &Engine, id: u32) -> std::sync::Arc<sensorstore::sensor::SensorHandle> {
    let handle = engine
        .configure_sensor(UploadSource::Gateway, SensorConfig { id, kind: DataKind::Evt })
        .expect("configure");
    engine.activate_sensor(&handle).expect("activate");
    handle
}

#[test]
fn tsd_round_trip_with_computed_timestamps() {
    let engine = ram_engine(16);
    let sensor = tsd_sensor(&engine, 1, 1_000);

    // Two sectors' worth: the first stamped at 1 000, the second at 7 000.
    engine.clock().set_reference_utc_ms(1_000);
    for v in 100..106u32 {
        engine.write_tsd(&sensor, v, 0).expect("write");
    }
    engine.clock().set_reference_utc_ms(7_000);
    for v in 106..110u32 {
        engine.write_tsd(&sensor, v, 0).expect("write");
    }

    assert_eq!(engine.new_sample_count(UploadSource::Gateway, &sensor), 10);

    let mut out = Vec::new();
    let n = engine.read_bulk(UploadSource::Gateway, &sensor, &mut out, 10).expect("read");
    assert_eq!(n, 10);
    let expected: Vec<TsdEvtValue> = (0..10)
        .map(|i| TsdEvtValue { value: 100 + i as u32, utc_ms: 1_000 + i * 1_000 })
        .collect();
    assert_eq!(out, expected);
    assert_eq!(engine.new_sample_count(UploadSource::Gateway, &sensor), 0);
}

#[test]
fn nack_replays_and_ack_releases() {
    let engine = ram_engine(16);
    let sensor = tsd_sensor(&engine, 1, 1_000);
    engine.clock().set_reference_utc_ms(1_000);
    for v in 100..110u32 {
        engine.write_tsd(&sensor, v, 0).expect("write");
    }

    let mut first = Vec::new();
    engine.read_bulk(UploadSource::Gateway, &sensor, &mut first, 10).expect("read");

    // Nack twice — idempotent — then the same ten records come back.
    engine.revert_all_pending(UploadSource::Gateway, &sensor).expect("revert");
    engine.revert_all_pending(UploadSource::Gateway, &sensor).expect("revert again");
    let mut second = Vec::new();
    engine.read_bulk(UploadSource::Gateway, &sensor, &mut second, 10).expect("reread");
    assert_eq!(first, second);

    engine.erase_all_pending(UploadSource::Gateway, &sensor, 10).expect("erase");
    assert_eq!(engine.new_sample_count(UploadSource::Gateway, &sensor), 0);
    let snap = engine.sensor_snapshot(&sensor);
    assert_eq!(snap.total_records, 0);
    // Every sector went back to the pool.
    assert_eq!(engine.pool_usage().free, engine.pool_usage().capacity);
}

#[test]
fn erase_then_revert_keeps_post_erase_position() {
    let engine = ram_engine(16);
    let sensor = tsd_sensor(&engine, 1, 1_000);
    engine.clock().set_reference_utc_ms(1_000);
    for v in 0..12u32 {
        engine.write_tsd(&sensor, v, 0).expect("write");
    }

    let mut out = Vec::new();
    engine.read_bulk(UploadSource::Gateway, &sensor, &mut out, 12).expect("read");
    engine.erase_all_pending(UploadSource::Gateway, &sensor, 5).expect("erase 5");
    engine.revert_all_pending(UploadSource::Gateway, &sensor).expect("revert");

    // The cursor sits at the post-erase position: records 5..12 replay.
    let mut replay = Vec::new();
    let n = engine.read_bulk(UploadSource::Gateway, &sensor, &mut replay, 12).expect("reread");
    assert_eq!(n, 7);
    let values: Vec<u32> = replay.iter().map(|r| r.value).collect();
    assert_eq!(values, (5..12).collect::<Vec<u32>>());
}

#[test]
fn evt_timestamps_come_back_bit_exact() {
    let engine = ram_engine(16);
    let sensor = evt_sensor(&engine, 2);
    engine.clock().set_reference_utc_ms(1);

    engine.write_evt(&sensor, 42, 5_000, 0).expect("write");
    engine.write_evt(&sensor, 43, 5_003, 0).expect("write");
    engine.write_evt(&sensor, 44, 9_999, 0).expect("write");

    let mut out = Vec::new();
    let n = engine.read_bulk(UploadSource::Gateway, &sensor, &mut out, 3).expect("read");
    assert_eq!(n, 3);
    assert_eq!(
        out,
        vec![
            TsdEvtValue { value: 42, utc_ms: 5_000 },
            TsdEvtValue { value: 43, utc_ms: 5_003 },
            TsdEvtValue { value: 44, utc_ms: 9_999 },
        ]
    );
}

#[test]
fn ram_only_overflow_discards_oldest() {
    let engine = ram_engine(32);
    let sensor = tsd_sensor(&engine, 1, 1_000);
    engine.clock().set_reference_utc_ms(1_000);

    for v in 0..500u32 {
        engine.write_tsd(&sensor, v, 0).expect("write never fails on discard profile");
    }

    // 32 sectors hold 192 TSD records; the count caps there give or take
    // the sector being refilled.
    let count = engine.new_sample_count(UploadSource::Gateway, &sensor);
    assert!((186..=192).contains(&count), "count was {count}");

    let mut out = Vec::new();
    engine
        .read_bulk(UploadSource::Gateway, &sensor, &mut out, 500)
        .expect("read");
    assert_eq!(out.len() as u64, count);
    // Only the most recent records survive, still in write order.
    let values: Vec<u32> = out.iter().map(|r| r.value).collect();
    assert_eq!(values.last(), Some(&499));
    for pair in values.windows(2) {
        assert_eq!(pair[1], pair[0] + 1);
    }
    let snap = engine.sensor_snapshot(&sensor);
    assert_eq!(snap.dropped_records, 500 - count);
}

#[test]
fn discard_profile_fails_when_everything_is_pending() {
    let engine = ram_engine(2);
    let sensor = tsd_sensor(&engine, 1, 1_000);
    engine.clock().set_reference_utc_ms(1_000);
    for v in 0..12u32 {
        engine.write_tsd(&sensor, v, 0).expect("write");
    }
    let mut out = Vec::new();
    engine.read_bulk(UploadSource::Gateway, &sensor, &mut out, 12).expect("read");

    // Both sectors now sit in the pending window; nothing is discardable.
    let err = engine.write_tsd(&sensor, 99, 0).expect_err("pool is stuck");
    assert!(matches!(err, StoreError::AllPending { id: 1 }));
    assert_eq!(engine.sensor_snapshot(&sensor).dropped_records, 1);
}

#[test]
fn two_lanes_read_independently() {
    let engine = ram_engine(16);
    let sensor = tsd_sensor(&engine, 1, 1_000);
    engine.clock().set_reference_utc_ms(1_000);
    for v in 0..10u32 {
        engine.write_tsd(&sensor, v, 0).expect("write");
    }

    let mut gw = Vec::new();
    engine.read_bulk(UploadSource::Gateway, &sensor, &mut gw, 10).expect("gateway read");
    let mut hosted = Vec::new();
    engine.read_bulk(UploadSource::Hosted, &sensor, &mut hosted, 10).expect("hosted read");
    assert_eq!(gw, hosted);

    // Gateway acks everything; hosted's pending window keeps the sectors
    // addressable for replay.
    engine.erase_all_pending(UploadSource::Gateway, &sensor, 10).expect("gateway erase");
    engine.revert_all_pending(UploadSource::Hosted, &sensor).expect("hosted revert");
    let mut replay = Vec::new();
    let n = engine.read_bulk(UploadSource::Hosted, &sensor, &mut replay, 10).expect("hosted reread");
    assert_eq!(n, 10);
    assert_eq!(replay, hosted);

    engine.erase_all_pending(UploadSource::Hosted, &sensor, 10).expect("hosted erase");
    assert_eq!(engine.pool_usage().free, engine.pool_usage().capacity);
}

#[test]
fn erase_beyond_pending_is_invalid() {
    let engine = ram_engine(16);
    let sensor = tsd_sensor(&engine, 1, 1_000);
    engine.clock().set_reference_utc_ms(1_000);
    for v in 0..5u32 {
        engine.write_tsd(&sensor, v, 0).expect("write");
    }
    let mut out = Vec::new();
    engine.read_bulk(UploadSource::Gateway, &sensor, &mut out, 3).expect("read");

    let err = engine
        .erase_all_pending(UploadSource::Gateway, &sensor, 4)
        .expect_err("only 3 pending");
    assert!(matches!(err, StoreError::InvalidParameter(_)));
    engine.erase_all_pending(UploadSource::Gateway, &sensor, 3).expect("erase 3");
}

#[test]
fn writes_gate_on_utc_until_synced() {
    let engine = ram_engine(4);
    let sensor = tsd_sensor(&engine, 1, 1_000);

    let err = engine.write_tsd(&sensor, 1, 0).expect_err("no UTC yet");
    assert!(matches!(err, StoreError::Timeout { .. }));

    engine.clock().set_reference_utc_ms(50_000);
    engine.write_tsd(&sensor, 1, 0).expect("write after sync");
}

#[test]
fn mismatched_kind_is_rejected() {
    let engine = ram_engine(4);
    let tsd = tsd_sensor(&engine, 1, 1_000);
    let evt = evt_sensor(&engine, 2);
    engine.clock().set_reference_utc_ms(1_000);

    assert!(matches!(
        engine.write_evt(&tsd, 1, 1_000, 0),
        Err(StoreError::InvalidParameter(_))
    ));
    assert!(matches!(
        engine.write_tsd(&evt, 1, 0),
        Err(StoreError::InvalidParameter(_))
    ));
}

#[test]
fn inactive_sensor_is_rejected() {
    let engine = ram_engine(4);
    let handle = engine
        .configure_sensor(
            UploadSource::Gateway,
            SensorConfig { id: 1, kind: DataKind::Tsd { sample_rate_ms: 1_000 } },
        )
        .expect("configure");
    engine.clock().set_reference_utc_ms(1_000);

    // Configured but never activated.
    assert!(matches!(
        engine.write_tsd(&handle, 1, 0),
        Err(StoreError::InactiveSensor { id: 1 })
    ));

    // Duplicate configuration is also rejected.
    assert!(matches!(
        engine.configure_sensor(
            UploadSource::Gateway,
            SensorConfig { id: 1, kind: DataKind::Evt },
        ),
        Err(StoreError::InvalidParameter(_))
    ));
}

#[test]
fn shutdown_rejects_writes() {
    let engine = ram_engine(4);
    let sensor = tsd_sensor(&engine, 1, 1_000);
    engine.clock().set_reference_utc_ms(1_000);
    engine.write_tsd(&sensor, 1, 0).expect("write");

    engine.begin_shutdown();
    assert!(matches!(
        engine.write_tsd(&sensor, 2, 0),
        Err(StoreError::ShuttingDown)
    ));
}

#[test]
fn shutdown_beats_the_utc_gate() {
    let engine = ram_engine(4);
    let tsd = tsd_sensor(&engine, 1, 1_000);
    let evt = evt_sensor(&engine, 2);

    // UTC never synced; shutdown must be reported without sitting out the
    // gate's wait on either path.
    engine.begin_shutdown();
    let started = std::time::Instant::now();
    assert!(matches!(
        engine.write_tsd(&tsd, 1, 5_000),
        Err(StoreError::ShuttingDown)
    ));
    assert!(matches!(
        engine.write_evt(&evt, 1, 1_000, 5_000),
        Err(StoreError::ShuttingDown)
    ));
    assert!(started.elapsed() < std::time::Duration::from_secs(5));
}

#[test]
fn rollover_closes_the_open_tail() {
    let engine = ram_engine(8);
    let sensor = tsd_sensor(&engine, 1, 1_000);
    engine.clock().set_reference_utc_ms(100_000);
    for v in 0..3u32 {
        engine.write_tsd(&sensor, v, 0).expect("write");
    }

    // The clock jumps far backwards: rollover.
    engine.tick(100_000);
    engine.tick(10_000);
    engine.clock().set_reference_utc_ms(50_000);
    engine.write_tsd(&sensor, 3, 0).expect("write after rollover");

    let mut out = Vec::new();
    engine.read_bulk(UploadSource::Gateway, &sensor, &mut out, 4).expect("read");
    let stamps: Vec<u64> = out.iter().map(|r| r.utc_ms).collect();
    // The in-flight tail was re-stamped so the post-rollover value lands
    // at the new clock; the earlier values in the same sector shift with
    // the new base.
    assert_eq!(stamps, vec![47_000, 48_000, 49_000, 50_000]);
}

#[test]
fn partial_reads_resume_in_order() {
    let engine = ram_engine(16);
    let sensor = tsd_sensor(&engine, 1, 1_000);
    engine.clock().set_reference_utc_ms(1_000);
    for v in 0..10u32 {
        engine.write_tsd(&sensor, v, 0).expect("write");
    }

    let mut out = Vec::new();
    assert_eq!(engine.read_bulk(UploadSource::Gateway, &sensor, &mut out, 4).expect("read"), 4);
    assert_eq!(engine.new_sample_count(UploadSource::Gateway, &sensor), 6);
    assert_eq!(engine.read_bulk(UploadSource::Gateway, &sensor, &mut out, 10).expect("read"), 6);
    let values: Vec<u32> = out.iter().map(|r| r.value).collect();
    assert_eq!(values, (0..10).collect::<Vec<u32>>());
}

mod properties {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        /// Random write/read/ack/nack interleavings keep the bookkeeping
        /// consistent: unread + pending always equals the resident total,
        /// the chain stays valid, and a single bulk read is monotonic.
        #[test]
        fn bookkeeping_survives_random_ops(ops in proptest::collection::vec(0u8..5, 1..120)) {
            let engine = ram_engine(8);
            let sensor = tsd_sensor(&engine, 1, 1_000);
            engine.clock().set_reference_utc_ms(1_000);
            let mut next_value = 0u32;

            for op in ops {
                match op {
                    0 | 1 => {
                        let _ = engine.write_tsd(&sensor, next_value, 0);
                        next_value += 1;
                    }
                    2 => {
                        let mut out = Vec::new();
                        let _ = engine.read_bulk(UploadSource::Gateway, &sensor, &mut out, 7);
                        for pair in out.windows(2) {
                            prop_assert!(pair[1].value > pair[0].value);
                        }
                    }
                    3 => {
                        let pending = engine.sensor_snapshot(&sensor).pending
                            [UploadSource::Gateway.index()];
                        if pending > 0 {
                            engine
                                .erase_all_pending(
                                    UploadSource::Gateway,
                                    &sensor,
                                    pending.min(5),
                                )
                                .expect("erase within pending");
                        }
                    }
                    _ => {
                        engine
                            .revert_all_pending(UploadSource::Gateway, &sensor)
                            .expect("revert");
                    }
                }

                let snap = engine.sensor_snapshot(&sensor);
                let unread = engine.new_sample_count(UploadSource::Gateway, &sensor);
                let pending = snap.pending[UploadSource::Gateway.index()] as u64;
                prop_assert_eq!(unread + pending, snap.total_records);
                engine.validate_chain(&sensor).expect("chain stays valid");
            }
        }

        /// With a frozen clock every sector stamps the same base, so each
        /// record's timestamp must equal `base + (i mod 6) · rate`.
        #[test]
        fn tsd_timestamps_follow_the_sample_rate(
            rate in 1u64..10_000,
            values in proptest::collection::vec(proptest::num::u32::ANY, 1..40),
        ) {
            let engine = ram_engine(16);
            let sensor = tsd_sensor(&engine, 1, rate);
            engine.clock().set_reference_utc_ms(1_000);
            for v in &values {
                engine.write_tsd(&sensor, *v, 0).expect("write");
            }

            let mut out = Vec::new();
            engine
                .read_bulk(UploadSource::Gateway, &sensor, &mut out, values.len())
                .expect("read");
            prop_assert_eq!(out.len(), values.len());
            for (i, rec) in out.iter().enumerate() {
                prop_assert_eq!(rec.value, values[i]);
                prop_assert_eq!(rec.utc_ms, 1_000 + (i as u64 % 6) * rate);
            }
        }

        /// EVT pairs come back bit-exact, whatever the caller stamped.
        #[test]
        fn evt_pairs_are_preserved_verbatim(
            pairs in proptest::collection::vec(
                (proptest::num::u32::ANY, proptest::num::u64::ANY),
                1..30,
            ),
        ) {
            let engine = ram_engine(16);
            let sensor = evt_sensor(&engine, 1);
            engine.clock().set_reference_utc_ms(1);
            for (v, ts) in &pairs {
                engine.write_evt(&sensor, *v, *ts, 0).expect("write");
            }

            let mut out = Vec::new();
            engine
                .read_bulk(UploadSource::Gateway, &sensor, &mut out, pairs.len())
                .expect("read");
            prop_assert_eq!(out.len(), pairs.len());
            for (rec, (v, ts)) in out.iter().zip(&pairs) {
                prop_assert_eq!(rec.value, *v);
                prop_assert_eq!(rec.utc_ms, *ts);
            }
        }
    }
}

#[test]
fn validate_chain_on_healthy_sensor() {
    let engine = ram_engine(8);
    let sensor = tsd_sensor(&engine, 1, 1_000);
    engine.clock().set_reference_utc_ms(1_000);
    for v in 0..20u32 {
        engine.write_tsd(&sensor, v, 0).expect("write");
    }
    engine.validate_chain(&sensor).expect("chain is healthy");
    assert!(!engine.sensor_snapshot(&sensor).quarantined);
}

#[test]
fn zero_sized_requests_are_no_ops() {
    let engine = ram_engine(8);
    let sensor = tsd_sensor(&engine, 1, 1_000);
    engine.clock().set_reference_utc_ms(1_000);
    engine.write_tsd(&sensor, 1, 0).expect("write");

    let mut out = Vec::new();
    assert_eq!(engine.read_bulk(UploadSource::Gateway, &sensor, &mut out, 0).expect("read"), 0);
    assert!(out.is_empty());
    engine.erase_all_pending(UploadSource::Gateway, &sensor, 0).expect("erase nothing");
    assert_eq!(engine.new_sample_count(UploadSource::Gateway, &sensor), 1);
}

#[test]
fn diagnostics_serialize_to_json() {
    let engine = ram_engine(8);
    let sensor = tsd_sensor(&engine, 1, 1_000);
    engine.clock().set_reference_utc_ms(1_000);
    engine.write_tsd(&sensor, 1, 0).expect("write");

    let stats = serde_json::to_value(engine.stats()).expect("stats json");
    assert_eq!(stats["pool_capacity"], 8);
    assert_eq!(stats["sensors"], 1);
    let snap = serde_json::to_value(engine.sensor_snapshot(&sensor)).expect("snapshot json");
    assert_eq!(snap["id"], 1);
    assert_eq!(snap["total_records"], 1);
    assert_eq!(snap["source"], "gateway");
}

#[test]
fn deactivate_releases_everything_on_the_ram_profile() {
    let engine = ram_engine(8);
    let sensor = tsd_sensor(&engine, 1, 1_000);
    engine.clock().set_reference_utc_ms(1_000);
    for v in 0..20u32 {
        engine.write_tsd(&sensor, v, 0).expect("write");
    }

    engine.deactivate_sensor(&sensor).expect("deactivate");
    assert_eq!(engine.pool_usage().free, engine.pool_usage().capacity);
    assert!(matches!(
        engine.write_tsd(&sensor, 99, 0),
        Err(StoreError::InactiveSensor { id: 1 })
    ));

    // The identity is free again; a fresh configure starts from zero.
    let again = tsd_sensor(&engine, 1, 1_000);
    assert_eq!(engine.new_sample_count(UploadSource::Gateway, &again), 0);
    engine.write_tsd(&again, 0, 0).expect("write after reconfigure");
}
