use crate::base::neterror::NetError;

#[test]
fn test_net_error_roundtrip() {
    // Standard Chromium error
    let original = NetError::ConnectionRefused;
    let code = original.as_i32();
    assert_eq!(code, -102);
    let converted = NetError::from(code);
    assert!(matches!(converted, NetError::ConnectionRefused));

    // Custom error
    let custom = NetError::ShuttingDown;
    let custom_code = custom.as_i32();
    assert_eq!(custom_code, -10000);
    assert_eq!(NetError::from(custom_code), NetError::ShuttingDown);
}

#[test]
fn test_unknown_error() {
    let err = NetError::from(-9999);
    assert!(matches!(err, NetError::Unknown(-9999)));
    assert_eq!(err.as_i32(), -9999);
}

#[test]
fn test_abort_codes_distinct() {
    // Shutdown closes transactions with Aborted, transports with ConnectionAborted.
    assert_ne!(NetError::Aborted.as_i32(), NetError::ConnectionAborted.as_i32());
    assert_eq!(NetError::from(-3), NetError::Aborted);
}

#[test]
fn test_connect_failure_classification() {
    assert!(NetError::ConnectionRefused.is_connect_failure());
    assert!(NetError::ConnectionTimedOut.is_connect_failure());
    assert!(!NetError::Aborted.is_connect_failure());
    assert!(!NetError::ShuttingDown.is_connect_failure());
}

#[test]
fn test_display_messages() {
    assert_eq!(NetError::Aborted.to_string(), "Operation aborted");
    assert_eq!(NetError::Unknown(-42).to_string(), "Unknown error: -42");
}
