use gw_core::bacnet::NullBacnetLayer;
use gw_core::cov::CovManager;
use gw_core::object::{ObjectType, PresentValue};
use gw_core::registry::Registry;
use gw_protocol::{decode, Message};

#[test]
fn full_event_sequence_creates_updates_and_deletes_an_object() {
    let mut registry = Registry::new();
    let mut cov = CovManager::new(10);
    let bacnet = NullBacnetLayer;

    let definition = br#"{
        "messageType": "ObjectDefinition",
        "sourceId": "device-42",
        "streamPosition": 1,
        "payload": {
            "objectType": "analog-input",
            "objectInstance": 7,
            "objectName": "Zone Temp",
            "presentValueType": "real",
            "covIncrement": 0.5,
            "initialValue": 68.0
        }
    }"#;
    let msg = decode(definition).unwrap();
    let id = match msg {
        Message::ObjectDefinition(_, def) => registry.apply_definition(&def, 0, &bacnet).unwrap(),
        _ => panic!("expected object definition"),
    };
    assert_eq!(id.object_type, ObjectType::AnalogInput);
    assert_eq!(id.object_instance, 7);

    let update = br#"{
        "messageType": "ValueUpdate",
        "sourceId": "device-42",
        "streamPosition": 2,
        "payload": {
            "objectType": "analog-input",
            "objectInstance": 7,
            "presentValue": 69.2
        }
    }"#;
    let msg = decode(update).unwrap();
    let outcome = match msg {
        Message::ValueUpdate(_, update) => registry.apply_value(&update, 0, &bacnet).unwrap(),
        _ => panic!("expected value update"),
    };
    assert!(outcome.should_notify);
    assert_eq!(outcome.record.present_value, PresentValue::Real(69.2));

    let delete = br#"{
        "messageType": "ObjectDelete",
        "sourceId": "device-42",
        "streamPosition": 3,
        "payload": {
            "objectType": "analog-input",
            "objectInstance": 7
        }
    }"#;
    let msg = decode(delete).unwrap();
    match msg {
        Message::ObjectDelete(_, del) => {
            registry
                .apply_delete(&del.delete, 0, &bacnet, &mut cov)
                .unwrap();
        }
        _ => panic!("expected object delete"),
    }
    assert!(registry.get(id).is_none());
}

#[test]
fn device_config_update_decodes_only_present_fields() {
    let payload = br#"{
        "messageType": "DeviceConfig",
        "sourceId": "device-42",
        "payload": {
            "deviceName": "Building A Gateway",
            "covLifetime": 3600
        }
    }"#;
    let msg = decode(payload).unwrap();
    match msg {
        Message::DeviceConfig(_, cfg) => {
            assert_eq!(cfg.device_name.as_deref(), Some("Building A Gateway"));
            assert_eq!(cfg.cov_lifetime, Some(3600));
            assert_eq!(cfg.vendor_name, None);
        }
        _ => panic!("expected device config"),
    }
}
