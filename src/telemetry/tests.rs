use super::decoder::{decode_sample, decode_update_report, DeviceId, TelemetrySample};
use super::series::{SeriesBuffer, SeriesStore};
use super::update_board::UpdateBoard;
use crate::error::DecodeError;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::BTreeMap;

fn at(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(secs)
}

fn sample(name: &str, secs: i64, temperature: f64) -> TelemetrySample {
    let mut metrics = BTreeMap::new();
    metrics.insert("temperature".to_string(), temperature);
    TelemetrySample::new(
        DeviceId {
            id: Some(1),
            name: name.to_string(),
        },
        metrics,
        at(secs),
    )
}

#[test]
fn test_decode_full_monitoring_frame() {
    let payload = br#"{"nodeId":1,"nodeName":"depok-node1-DHT11","temperature":26.4,"humidity":65.2,"timestamp":"2024-01-01T00:00:00Z"}"#;
    let decoded = decode_sample(payload, at(500)).unwrap();

    assert_eq!(decoded.device().id, Some(1));
    assert_eq!(decoded.device_name(), "depok-node1-DHT11");
    assert_eq!(decoded.metric("temperature"), Some(26.4));
    assert_eq!(decoded.metric("humidity"), Some(65.2));
    assert_eq!(decoded.metrics().len(), 2);
    assert_eq!(decoded.timestamp(), at(0));
}

#[test]
fn test_decode_single_metric_is_valid() {
    let payload = br#"{"nodeId":2,"nodeName":"jakarta-node2-TDS","tds":128.5}"#;
    let decoded = decode_sample(payload, at(42)).unwrap();

    assert_eq!(decoded.metric("tds"), Some(128.5));
    assert_eq!(decoded.metric("temperature"), None);
    assert_eq!(decoded.timestamp(), at(42));
}

#[test]
fn test_decode_snake_case_with_nested_data() {
    let payload = br#"{
        "node_name": "depok-node2",
        "node_location": "Depok Greenhouse",
        "timestamp": "2025-05-12T13:12:30",
        "data": {"temperature": 26.5, "tds value": 60.2}
    }"#;
    let decoded = decode_sample(payload, at(0)).unwrap();

    assert_eq!(decoded.device().id, None);
    assert_eq!(decoded.location(), Some("Depok Greenhouse"));
    assert_eq!(decoded.metric("tds value"), Some(60.2));
    assert_eq!(
        decoded.timestamp(),
        Utc.with_ymd_and_hms(2025, 5, 12, 13, 12, 30).unwrap()
    );
}

#[test]
fn test_decode_id_only_derives_name() {
    let decoded = decode_sample(br#"{"nodeId":7,"humidity":40}"#, at(0)).unwrap();
    assert_eq!(decoded.device_name(), "node-7");
    assert_eq!(decoded.metric("humidity"), Some(40.0));
}

#[test]
fn test_decode_integral_float_id() {
    let decoded = decode_sample(br#"{"nodeId":3.0,"humidity":40}"#, at(0)).unwrap();
    assert_eq!(decoded.device().id, Some(3));
    assert_eq!(decoded.device_name(), "node-3");

    let fractional = decode_sample(br#"{"nodeId":3.5,"nodeName":"n"}"#, at(0)).unwrap();
    assert_eq!(fractional.device().id, None);
}

#[test]
fn test_decode_empty_timestamp_uses_receive_time() {
    let payload = br#"{"nodeId":1,"nodeName":"n","temperature":1.0,"timestamp":""}"#;
    let decoded = decode_sample(payload, at(7)).unwrap();
    assert_eq!(decoded.timestamp(), at(7));
    assert_eq!(decoded.metric("temperature"), Some(1.0));
}

#[test]
fn test_decode_rejects_missing_device() {
    assert_eq!(
        decode_sample(br#"{"temperature":21.0}"#, at(0)),
        Err(DecodeError::MissingDevice)
    );
}

#[test]
fn test_decode_rejects_non_json_and_non_object() {
    assert!(matches!(
        decode_sample(b"\x00\xffnot json", at(0)),
        Err(DecodeError::InvalidJson(_))
    ));
    assert_eq!(decode_sample(b"[1,2,3]", at(0)), Err(DecodeError::NotAnObject));
}

#[test]
fn test_decode_rejects_bad_timestamp() {
    let payload = br#"{"nodeName":"n","timestamp":"yesterday"}"#;
    assert!(matches!(
        decode_sample(payload, at(0)),
        Err(DecodeError::InvalidTimestamp(_))
    ));
}

#[test]
fn test_decode_ignores_non_numeric_fields() {
    let payload = br#"{"nodeName":"n","sensorType":"DHT11","ok":true,"temperature":"hot","humidity":50}"#;
    let decoded = decode_sample(payload, at(0)).unwrap();
    assert_eq!(decoded.metrics().keys().collect::<Vec<_>>(), vec!["humidity"]);
}

#[test]
fn test_decode_update_report() {
    let payload = br#"{"node_name":"depok-node1","node_location":"Depok Greenhouse","node_status":"active","first_version":"1.0.0","latest_version":"1.0.3"}"#;
    let report = decode_update_report(payload, at(9)).unwrap();

    assert!(report.active);
    assert_eq!(report.latest_version, "1.0.3");
    assert_eq!(report.received_at, at(9));
}

#[test]
fn test_decode_update_report_requires_all_keys() {
    let payload = br#"{"node_name":"depok-node1","node_status":"active"}"#;
    assert_eq!(
        decode_update_report(payload, at(0)),
        Err(DecodeError::MissingField("node_location"))
    );
}

#[test]
fn test_buffer_evicts_oldest_when_full() {
    let mut buffer = SeriesBuffer::new(100);
    for i in 0..100 {
        assert!(buffer.push(sample("n", i, i as f64)).is_none());
    }
    let before = buffer.snapshot();

    let evicted = buffer.push(sample("n", 100, 100.0)).unwrap();
    let after = buffer.snapshot();

    assert_eq!(evicted.timestamp(), at(0));
    assert_eq!(after.len(), 100);
    assert_eq!(&after[..99], &before[1..]);
    assert_eq!(after[99].timestamp(), at(100));
}

#[test]
fn test_snapshot_is_time_ordered() {
    let mut buffer = SeriesBuffer::new(10);
    buffer.push(sample("n", 30, 3.0));
    buffer.push(sample("n", 10, 1.0));
    buffer.push(sample("n", 20, 2.0));

    let stamps: Vec<_> = buffer.snapshot().iter().map(|s| s.timestamp()).collect();
    assert_eq!(stamps, vec![at(10), at(20), at(30)]);
    assert_eq!(buffer.latest().unwrap().timestamp(), at(20));
}

#[test]
fn test_identical_timestamps_are_both_kept() {
    let store = SeriesStore::new(10);
    store.append(sample("n", 5, 1.0));
    store.append(sample("n", 5, 2.0));

    let snapshot = store.snapshot("n");
    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot[0].metric("temperature"), Some(1.0));
    assert_eq!(snapshot[1].metric("temperature"), Some(2.0));
}

#[test]
fn test_store_never_exceeds_capacity() {
    let store = SeriesStore::default();
    for i in 0..250 {
        store.append(sample("a", i, 0.0));
        assert!(store.len("a") <= 100);
    }
    assert_eq!(store.snapshot("a").len(), 100);
    assert_eq!(store.snapshot("a")[0].timestamp(), at(150));
}

#[test]
fn test_store_keeps_devices_apart() {
    let store = SeriesStore::new(3);
    store.append(sample("a", 0, 1.0));
    store.append(sample("b", 0, 2.0));
    store.append(sample("a", 1, 3.0));

    assert_eq!(store.len("a"), 2);
    assert_eq!(store.len("b"), 1);
    assert_eq!(store.latest("a").unwrap().metric("temperature"), Some(3.0));

    let devices = store.known_devices();
    assert_eq!(devices.len(), 2);
    assert!(devices.contains("a") && devices.contains("b"));
}

#[test]
fn test_unknown_device_snapshot_is_empty() {
    let store = SeriesStore::default();
    assert!(store.snapshot("ghost").is_empty());
    assert!(store.latest("ghost").is_none());
}

#[test]
fn test_update_board_keeps_latest_per_node() {
    let board = UpdateBoard::new();
    let first = decode_update_report(
        br#"{"node_name":"a","node_location":"x","node_status":"active","first_version":"1","latest_version":"2"}"#,
        at(0),
    )
    .unwrap();
    let second = decode_update_report(
        br#"{"node_name":"a","node_location":"x","node_status":"inactive","first_version":"2","latest_version":"3"}"#,
        at(1),
    )
    .unwrap();

    board.record(first);
    board.record(second);

    let latest = board.latest("a").unwrap();
    assert!(!latest.active);
    assert_eq!(latest.latest_version, "3");
    assert_eq!(board.all().len(), 1);
}
