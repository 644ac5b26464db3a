use bolt_auth::{decode_hmac_at, encode_hmac};

const KEY: &str = "N9d*22UuzdA443Nur2eL23:a2fvTqe";
const NOW: i64 = 1_700_000_000;

#[test]
fn round_trip_within_verify_window() {
    let messages = [
        "",
        "{\"testinput\":\"x\"}",
        "plain text body",
        "{\"nested\":{\"a\":[1,2,3]}}",
    ];
    for message in messages {
        for offset in [-30, -1, 0, 1, 30] {
            let timestamp = (NOW + offset).to_string();
            let envelope = encode_hmac(KEY, message, &timestamp).expect("encode should succeed");
            let decoded = decode_hmac_at(KEY, envelope.as_bytes(), 30, NOW)
                .expect("decode should succeed inside the window");
            assert_eq!(decoded, message);
        }
    }
}

#[test]
fn stale_timestamp_is_rejected() {
    let timestamp = (NOW - 31).to_string();
    let envelope = encode_hmac(KEY, "late", &timestamp).unwrap();
    let err = decode_hmac_at(KEY, envelope.as_bytes(), 30, NOW).unwrap_err();
    assert_eq!(err.code, "ERR_INVALID_TIMESTAMP");
}

#[test]
fn future_timestamp_is_rejected() {
    let timestamp = (NOW + 31).to_string();
    let envelope = encode_hmac(KEY, "early", &timestamp).unwrap();
    let err = decode_hmac_at(KEY, envelope.as_bytes(), 30, NOW).unwrap_err();
    assert_eq!(err.code, "ERR_INVALID_TIMESTAMP");
}

#[test]
fn tampered_data_fails_signature_check() {
    let envelope = encode_hmac(KEY, "original", &NOW.to_string()).unwrap();
    let mut parsed: serde_json::Value = serde_json::from_str(&envelope).unwrap();

    let forged_inner = serde_json::json!({
        "timestamp": NOW.to_string(),
        "message": "forged",
    });
    use base64::Engine as _;
    parsed["data"] = serde_json::Value::String(
        base64::engine::general_purpose::URL_SAFE
            .encode(serde_json::to_vec(&forged_inner).unwrap()),
    );

    let err = decode_hmac_at(KEY, parsed.to_string().as_bytes(), 30, NOW).unwrap_err();
    assert_eq!(err.code, "ERR_INVALID_SIGNATURE");
}

#[test]
fn wrong_key_fails_signature_check() {
    let envelope = encode_hmac(KEY, "hello", &NOW.to_string()).unwrap();
    let err = decode_hmac_at("another-key", envelope.as_bytes(), 30, NOW).unwrap_err();
    assert_eq!(err.code, "ERR_INVALID_SIGNATURE");
}

#[test]
fn non_json_body_is_malformed() {
    let err = decode_hmac_at(KEY, b"not json at all", 30, NOW).unwrap_err();
    assert_eq!(err.code, "ERR_ENVELOPE_MALFORMED");
}

#[test]
fn unsigned_json_body_fails_signature_check() {
    let err = decode_hmac_at(KEY, b"{\"testinput\":\"x\"}", 30, NOW).unwrap_err();
    assert_eq!(err.code, "ERR_INVALID_SIGNATURE");
}
