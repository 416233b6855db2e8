//! Exercises the cache mirror against a real Redis instance via
//! testcontainers, the same way the root workspace's own integration
//! suites spin up Postgres for the server/receiver tests.

use gateway::cache::{CacheConfig, CacheMirror};
use gw_core::object::{BinaryMeta, MultiStateMeta, ObjectId, ObjectRecord, ObjectType, PresentValue, StatusFlags, ValueKind};
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::redis::Redis;

fn sample_record(instance: u32) -> ObjectRecord {
    ObjectRecord {
        id: ObjectId::new(ObjectType::AnalogInput, instance),
        object_name: "Zone Temp".to_owned(),
        description: String::new(),
        value_kind: ValueKind::Real,
        present_value: PresentValue::Real(21.5),
        units: 62,
        units_text: "degrees-celsius".to_owned(),
        cov_increment: Some(0.5),
        min_value: None,
        max_value: None,
        multi_state: MultiStateMeta::default(),
        binary: BinaryMeta::default(),
        status_flags: StatusFlags::default(),
        reliability: 0,
        event_state: 0,
        source_id: "device-1".to_owned(),
        last_update: 100,
        stream_position: 5,
        last_notified_value: PresentValue::Real(21.5),
    }
}

#[tokio::test]
async fn put_get_and_delete_round_trip_through_redis() {
    let container = Redis::default().start().await.unwrap();
    let port = container.get_host_port_ipv4(6379).await.unwrap();
    let cfg = CacheConfig {
        host: "127.0.0.1".to_owned(),
        port,
        ..CacheConfig::default()
    };
    let mut cache = CacheMirror::connect(&cfg).await.unwrap();

    let record = sample_record(1);
    cache.put_object(&record).await.unwrap();

    let fetched = cache.get_object(record.id).await.unwrap().unwrap();
    assert_eq!(fetched, record);

    cache.delete_object(record.id).await.unwrap();
    assert!(cache.get_object(record.id).await.unwrap().is_none());
}

#[tokio::test]
async fn iterate_objects_recovers_everything_in_the_index() {
    let container = Redis::default().start().await.unwrap();
    let port = container.get_host_port_ipv4(6379).await.unwrap();
    let cfg = CacheConfig {
        host: "127.0.0.1".to_owned(),
        port,
        ..CacheConfig::default()
    };
    let mut cache = CacheMirror::connect(&cfg).await.unwrap();

    for i in 1..=5 {
        cache.put_object(&sample_record(i)).await.unwrap();
    }

    let mut recovered = cache.iterate_objects().await.unwrap();
    recovered.sort_by_key(|r| r.id.object_instance);
    assert_eq!(recovered.len(), 5);
    assert_eq!(recovered[0].id.object_instance, 1);
    assert_eq!(recovered[4].id.object_instance, 5);
}

#[tokio::test]
async fn cursor_persists_across_a_reconnect() {
    let container = Redis::default().start().await.unwrap();
    let port = container.get_host_port_ipv4(6379).await.unwrap();
    let cfg = CacheConfig {
        host: "127.0.0.1".to_owned(),
        port,
        ..CacheConfig::default()
    };
    let mut cache = CacheMirror::connect(&cfg).await.unwrap();

    assert_eq!(cache.get_cursor("sub-1").await.unwrap(), None);
    cache.put_cursor("sub-1", 42).await.unwrap();
    assert_eq!(cache.get_cursor("sub-1").await.unwrap(), Some(42));

    let mut reconnected = CacheMirror::connect(&cfg).await.unwrap();
    assert_eq!(reconnected.get_cursor("sub-1").await.unwrap(), Some(42));
}
