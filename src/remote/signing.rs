//! AWS Signature Version 4
//!
//! Hand-rolled signing for the S3-compatible object store. The canonical
//! request, string-to-sign and key derivation follow the published
//! algorithm; the service is always `s3`.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Signing service name.
pub const SERVICE: &str = "s3";

/// Payload hash of an empty body.
pub fn empty_payload_hash() -> String {
    hex::encode(Sha256::digest(b""))
}

/// SHA-256 of a payload, hex encoded.
pub fn payload_hash(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}

/// Access credentials, immutable per transport instance.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
}

/// One request to sign.
pub struct SigningRequest<'a> {
    pub method: &'a str,
    /// Unencoded request path; slashes are preserved by the encoder
    pub path: &'a str,
    /// Canonical query string, already encoded ("" for none)
    pub query: &'a str,
    /// Header name/value pairs; must include `host`
    pub headers: &'a [(String, String)],
    /// Hex SHA-256 of the payload
    pub payload_hash: &'a str,
}

/// A computed signature, split for tracing.
#[derive(Debug, Clone)]
pub struct Signature {
    pub canonical_request: String,
    pub string_to_sign: String,
    pub signed_headers: String,
    pub authorization: String,
    pub amz_date: String,
}

/// Format a timestamp as `YYYYMMDDTHHMMSSZ`.
pub fn amz_date(at: DateTime<Utc>) -> String {
    at.format("%Y%m%dT%H%M%SZ").to_string()
}

/// Percent-encode a URI path, preserving `/`.
pub fn encode_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for byte in path.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' | b'/' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

/// Sign a request at the given instant.
pub fn sign(
    request: &SigningRequest<'_>,
    credentials: &Credentials,
    region: &str,
    at: DateTime<Utc>,
) -> Signature {
    let amz_date = self::amz_date(at);
    let date8 = at.format("%Y%m%d").to_string();

    // Canonical headers: lowercased names, trimmed values, sorted by
    // name, each terminated by a newline.
    let mut headers: Vec<(String, String)> = request
        .headers
        .iter()
        .map(|(name, value)| (name.to_lowercase(), value.trim().to_string()))
        .collect();
    headers.sort();

    let canonical_headers: String = headers
        .iter()
        .map(|(name, value)| format!("{name}:{value}\n"))
        .collect();
    let signed_headers = headers
        .iter()
        .map(|(name, _)| name.as_str())
        .collect::<Vec<_>>()
        .join(";");

    let canonical_request = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        request.method,
        encode_path(request.path),
        request.query,
        canonical_headers,
        signed_headers,
        request.payload_hash
    );

    let scope = format!("{date8}/{region}/{SERVICE}/aws4_request");
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        amz_date,
        scope,
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    );

    let signing_key = derive_key(&credentials.secret_key, &date8, region);
    let signature = hex::encode(hmac(&signing_key, string_to_sign.as_bytes()));

    let authorization = format!(
        "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
        credentials.access_key, scope, signed_headers, signature
    );

    Signature {
        canonical_request,
        string_to_sign,
        signed_headers,
        authorization,
        amz_date,
    }
}

/// Four-level HMAC key derivation.
fn derive_key(secret: &str, date8: &str, region: &str) -> Vec<u8> {
    let k_date = hmac(format!("AWS4{secret}").as_bytes(), date8.as_bytes());
    let k_region = hmac(&k_date, region.as_bytes());
    let k_service = hmac(&k_region, SERVICE.as_bytes());
    hmac(&k_service, b"aws4_request")
}

fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn test_credentials() -> Credentials {
        Credentials {
            access_key: "AKIDEXAMPLE".to_string(),
            secret_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".to_string(),
        }
    }

    fn test_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 21, 19, 4, 30).unwrap()
    }

    fn test_headers(host: &str, date: &str, payload: &str) -> Vec<(String, String)> {
        vec![
            ("Host".to_string(), host.to_string()),
            ("x-amz-date".to_string(), date.to_string()),
            ("x-amz-content-sha256".to_string(), payload.to_string()),
        ]
    }

    #[test]
    fn test_amz_date_format() {
        assert_eq!(amz_date(test_time()), "20240521T190430Z");
    }

    #[test]
    fn test_encode_path_preserves_slashes() {
        assert_eq!(
            encode_path("/bucket/P/Debug-sim-arm64/aa11.zip"),
            "/bucket/P/Debug-sim-arm64/aa11.zip"
        );
        assert_eq!(encode_path("/a b/c+d"), "/a%20b/c%2Bd");
    }

    #[test]
    fn test_canonical_request_shape() {
        let payload = empty_payload_hash();
        let headers = test_headers("cache.s3.amazonaws.com", "20240521T190430Z", &payload);
        let request = SigningRequest {
            method: "HEAD",
            path: "/",
            query: "",
            headers: &headers,
            payload_hash: &payload,
        };
        let signature = sign(&request, &test_credentials(), "us-east-1", test_time());

        let expected_canonical = format!(
            "HEAD\n/\n\nhost:cache.s3.amazonaws.com\nx-amz-content-sha256:{payload}\nx-amz-date:20240521T190430Z\n\nhost;x-amz-content-sha256;x-amz-date\n{payload}"
        );
        assert_eq!(signature.canonical_request, expected_canonical);
    }

    #[test]
    fn test_string_to_sign_scope() {
        let payload = empty_payload_hash();
        let headers = test_headers("h", "20240521T190430Z", &payload);
        let request = SigningRequest {
            method: "GET",
            path: "/k",
            query: "",
            headers: &headers,
            payload_hash: &payload,
        };
        let signature = sign(&request, &test_credentials(), "eu-west-1", test_time());
        let lines: Vec<&str> = signature.string_to_sign.lines().collect();
        assert_eq!(lines[0], "AWS4-HMAC-SHA256");
        assert_eq!(lines[1], "20240521T190430Z");
        assert_eq!(lines[2], "20240521/eu-west-1/s3/aws4_request");
        assert_eq!(lines[3].len(), 64);
    }

    #[test]
    fn test_signature_is_deterministic() {
        let payload = payload_hash(b"content");
        let headers = test_headers("h", "20240521T190430Z", &payload);
        let request = SigningRequest {
            method: "PUT",
            path: "/k.zip",
            query: "",
            headers: &headers,
            payload_hash: &payload,
        };
        let a = sign(&request, &test_credentials(), "us-east-1", test_time());
        let b = sign(&request, &test_credentials(), "us-east-1", test_time());
        assert_eq!(a.authorization, b.authorization);
    }

    #[test]
    fn test_signature_sensitive_to_secret() {
        let payload = empty_payload_hash();
        let headers = test_headers("h", "20240521T190430Z", &payload);
        let request = SigningRequest {
            method: "GET",
            path: "/k",
            query: "",
            headers: &headers,
            payload_hash: &payload,
        };
        let a = sign(&request, &test_credentials(), "us-east-1", test_time());
        let other = Credentials {
            access_key: "AKIDEXAMPLE".to_string(),
            secret_key: "different".to_string(),
        };
        let b = sign(&request, &other, "us-east-1", test_time());
        assert_ne!(a.authorization, b.authorization);
    }

    #[test]
    fn test_authorization_header_shape() {
        let payload = empty_payload_hash();
        let headers = test_headers("h", "20240521T190430Z", &payload);
        let request = SigningRequest {
            method: "GET",
            path: "/k",
            query: "",
            headers: &headers,
            payload_hash: &payload,
        };
        let signature = sign(&request, &test_credentials(), "us-east-1", test_time());
        assert!(signature.authorization.starts_with(
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20240521/us-east-1/s3/aws4_request, "
        ));
        assert!(signature
            .authorization
            .contains("SignedHeaders=host;x-amz-content-sha256;x-amz-date, "));
        let hex_sig = signature.authorization.rsplit("Signature=").next().unwrap();
        assert_eq!(hex_sig.len(), 64);
        assert!(hex_sig.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_header_names_lowercased_and_sorted() {
        let payload = empty_payload_hash();
        let headers = vec![
            ("X-Amz-Date".to_string(), "20240521T190430Z".to_string()),
            ("Host".to_string(), "h".to_string()),
            ("Content-Type".to_string(), " application/zip ".to_string()),
            ("x-amz-content-sha256".to_string(), payload.clone()),
        ];
        let request = SigningRequest {
            method: "PUT",
            path: "/k.zip",
            query: "",
            headers: &headers,
            payload_hash: &payload,
        };
        let signature = sign(&request, &test_credentials(), "us-east-1", test_time());
        assert_eq!(
            signature.signed_headers,
            "content-type;host;x-amz-content-sha256;x-amz-date"
        );
        // Values are trimmed in canonical form.
        assert!(signature
            .canonical_request
            .contains("content-type:application/zip\n"));
    }
}
