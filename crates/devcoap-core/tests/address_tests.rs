//! End-device address resolution tests

use devcoap_core::{EndDeviceAddress, Error, ProtocolProperties, Protocols, SecurityMode};

fn protocols(pairs: &[(&str, &str)]) -> Protocols {
    let props: ProtocolProperties = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let mut protocols = Protocols::new();
    protocols.insert("COAP".to_string(), props);
    protocols
}

#[test]
fn test_nosec_address() {
    let p = protocols(&[("ED_ADDR", "192.0.2.10"), ("ED_SecurityMode", "NoSec")]);
    let addr = EndDeviceAddress::from_protocols(&p, "COAP").unwrap();
    assert_eq!(addr.host(), "192.0.2.10");
    assert_eq!(addr.security_mode(), SecurityMode::None);
    assert!(addr.psk_key().is_none());
}

#[test]
fn test_psk_address() {
    let p = protocols(&[
        ("ED_ADDR", "fd00::10"),
        ("ED_SecurityMode", "PSK"),
        ("ED_PskKey", "secretkey"),
    ]);
    let addr = EndDeviceAddress::from_protocols(&p, "COAP").unwrap();
    assert_eq!(addr.host(), "fd00::10");
    assert_eq!(addr.security_mode(), SecurityMode::PreSharedKey);
    assert_eq!(addr.psk_key(), Some(&b"secretkey"[..]));
}

#[test]
fn test_missing_protocol_block() {
    let p = protocols(&[("ED_ADDR", "192.0.2.10")]);
    assert_eq!(
        EndDeviceAddress::from_protocols(&p, "HTTP").unwrap_err(),
        Error::MissingProtocol("HTTP".to_string())
    );
}

#[test]
fn test_missing_address_property() {
    let p = protocols(&[("ED_SecurityMode", "NoSec")]);
    assert_eq!(
        EndDeviceAddress::from_protocols(&p, "COAP").unwrap_err(),
        Error::MissingProperty("ED_ADDR".to_string())
    );
}

#[test]
fn test_missing_security_mode_property() {
    let p = protocols(&[("ED_ADDR", "192.0.2.10")]);
    assert_eq!(
        EndDeviceAddress::from_protocols(&p, "COAP").unwrap_err(),
        Error::MissingProperty("ED_SecurityMode".to_string())
    );
}

#[test]
fn test_unknown_security_mode() {
    let p = protocols(&[("ED_ADDR", "192.0.2.10"), ("ED_SecurityMode", "psk")]);
    assert_eq!(
        EndDeviceAddress::from_protocols(&p, "COAP").unwrap_err(),
        Error::UnknownSecurityMode("psk".to_string())
    );
}

#[test]
fn test_psk_without_key_property() {
    let p = protocols(&[("ED_ADDR", "192.0.2.10"), ("ED_SecurityMode", "PSK")]);
    assert_eq!(
        EndDeviceAddress::from_protocols(&p, "COAP").unwrap_err(),
        Error::MissingProperty("ED_PskKey".to_string())
    );
}

#[test]
fn test_psk_with_empty_key_never_falls_back() {
    let p = protocols(&[
        ("ED_ADDR", "192.0.2.10"),
        ("ED_SecurityMode", "PSK"),
        ("ED_PskKey", ""),
    ]);
    assert_eq!(
        EndDeviceAddress::from_protocols(&p, "COAP").unwrap_err(),
        Error::MissingPskKey
    );
}

#[test]
fn test_nosec_ignores_key() {
    let p = protocols(&[
        ("ED_ADDR", "192.0.2.10"),
        ("ED_SecurityMode", "NoSec"),
        ("ED_PskKey", "unused"),
    ]);
    let addr = EndDeviceAddress::from_protocols(&p, "COAP").unwrap();
    assert!(addr.psk_key().is_none());
}
