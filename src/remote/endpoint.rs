//! Endpoint shapes and region detection
//!
//! Two addressing styles are supported, chosen by endpoint shape with an
//! explicit override:
//! - virtual-hosted: host `<bucket>.<endpoint-host>`, path `/<key>`
//! - path-style: host `<endpoint-host>`, path `/<bucket>/<key>`
//!
//! An endpoint that already carries the bucket as a host prefix is used
//! as-is. Region detection recognizes the `s3.<region>.amazonaws.com` and
//! `<region>.s3.amazonaws.com` shapes and falls back to `us-east-1`.

/// Default signing region.
pub const DEFAULT_REGION: &str = "us-east-1";

/// Object addressing style.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointStyle {
    VirtualHosted,
    PathStyle,
}

/// A resolved endpoint: scheme, effective host and addressing style.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    scheme: String,
    /// Host requests are sent to (bucket prefix included for
    /// virtual-hosted addressing)
    host: String,
    bucket: String,
    style: EndpointStyle,
}

impl Endpoint {
    /// Resolve a configured endpoint and bucket into an addressable form.
    pub fn resolve(endpoint: &str, bucket: &str, style: Option<EndpointStyle>) -> Self {
        let (scheme, host) = split_scheme(endpoint);
        let host = host.trim_end_matches('/').to_string();

        // Bucket already present as a host prefix: virtual-hosted with no
        // synthesis.
        if host.starts_with(&format!("{bucket}.")) {
            return Self {
                scheme,
                host,
                bucket: bucket.to_string(),
                style: EndpointStyle::VirtualHosted,
            };
        }

        let style = style.unwrap_or_else(|| {
            if host.ends_with(".amazonaws.com") {
                EndpointStyle::VirtualHosted
            } else {
                EndpointStyle::PathStyle
            }
        });

        let host = match style {
            EndpointStyle::VirtualHosted => format!("{bucket}.{host}"),
            EndpointStyle::PathStyle => host,
        };

        Self {
            scheme,
            host,
            bucket: bucket.to_string(),
            style,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn style(&self) -> EndpointStyle {
        self.style
    }

    /// Unencoded request path for an object key.
    pub fn object_path(&self, key: &str) -> String {
        match self.style {
            EndpointStyle::VirtualHosted => format!("/{key}"),
            EndpointStyle::PathStyle => format!("/{}/{key}", self.bucket),
        }
    }

    /// Unencoded request path for the bucket root (preflight HEAD).
    pub fn bucket_path(&self) -> String {
        match self.style {
            EndpointStyle::VirtualHosted => "/".to_string(),
            EndpointStyle::PathStyle => format!("/{}", self.bucket),
        }
    }

    /// Full URL for an already-encoded path.
    pub fn url(&self, encoded_path: &str) -> String {
        format!("{}://{}{}", self.scheme, self.host, encoded_path)
    }

    /// Signing region detected from the host shape.
    pub fn region(&self) -> String {
        detect_region(&self.host).unwrap_or_else(|| DEFAULT_REGION.to_string())
    }
}

fn split_scheme(endpoint: &str) -> (String, &str) {
    if let Some(rest) = endpoint.strip_prefix("https://") {
        ("https".to_string(), rest)
    } else if let Some(rest) = endpoint.strip_prefix("http://") {
        ("http".to_string(), rest)
    } else {
        ("https".to_string(), endpoint)
    }
}

fn looks_like_region(label: &str) -> bool {
    // e.g. us-east-1, eu-central-1, ap-southeast-2
    let mut parts = label.split('-');
    matches!(
        (parts.next(), parts.next(), parts.next(), parts.next()),
        (Some(a), Some(b), Some(c), None)
            if a.chars().all(|ch| ch.is_ascii_lowercase())
                && b.chars().all(|ch| ch.is_ascii_lowercase())
                && c.chars().all(|ch| ch.is_ascii_digit())
    )
}

fn detect_region(host: &str) -> Option<String> {
    if !host.ends_with(".amazonaws.com") {
        return None;
    }
    let labels: Vec<&str> = host.split('.').collect();
    let s3_index = labels.iter().position(|l| *l == "s3")?;

    // s3.<region>.amazonaws.com
    if let Some(next) = labels.get(s3_index + 1) {
        if *next != "amazonaws" && looks_like_region(next) {
            return Some((*next).to_string());
        }
    }
    // <region>.s3.amazonaws.com
    if s3_index > 0 && looks_like_region(labels[s3_index - 1]) {
        return Some(labels[s3_index - 1].to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_virtual_hosted_for_aws() {
        let ep = Endpoint::resolve("https://s3.us-west-2.amazonaws.com", "my-cache", None);
        assert_eq!(ep.style(), EndpointStyle::VirtualHosted);
        assert_eq!(ep.host(), "my-cache.s3.us-west-2.amazonaws.com");
        assert_eq!(ep.object_path("P/Debug-sim-arm64/aa11.zip"), "/P/Debug-sim-arm64/aa11.zip");
        assert_eq!(ep.region(), "us-west-2");
    }

    #[test]
    fn test_path_style_for_custom_endpoint() {
        let ep = Endpoint::resolve("https://minio.internal:9000", "cache", None);
        assert_eq!(ep.style(), EndpointStyle::PathStyle);
        assert_eq!(ep.host(), "minio.internal:9000");
        assert_eq!(ep.object_path("a/b/c.zip"), "/cache/a/b/c.zip");
        assert_eq!(ep.bucket_path(), "/cache");
        assert_eq!(ep.region(), DEFAULT_REGION);
    }

    #[test]
    fn test_bucket_prefix_used_as_is() {
        let ep = Endpoint::resolve("https://cache.s3.eu-central-1.amazonaws.com", "cache", None);
        assert_eq!(ep.style(), EndpointStyle::VirtualHosted);
        assert_eq!(ep.host(), "cache.s3.eu-central-1.amazonaws.com");
        assert_eq!(ep.region(), "eu-central-1");
    }

    #[test]
    fn test_region_before_s3_label() {
        let ep = Endpoint::resolve("https://ap-southeast-2.s3.amazonaws.com", "cache", Some(EndpointStyle::PathStyle));
        assert_eq!(ep.region(), "ap-southeast-2");
    }

    #[test]
    fn test_region_default_for_bare_s3() {
        let ep = Endpoint::resolve("https://s3.amazonaws.com", "cache", None);
        assert_eq!(ep.region(), DEFAULT_REGION);
    }

    #[test]
    fn test_style_override_wins() {
        let ep = Endpoint::resolve(
            "https://s3.us-east-2.amazonaws.com",
            "cache",
            Some(EndpointStyle::PathStyle),
        );
        assert_eq!(ep.style(), EndpointStyle::PathStyle);
        assert_eq!(ep.host(), "s3.us-east-2.amazonaws.com");
        assert_eq!(ep.object_path("k.zip"), "/cache/k.zip");
    }

    #[test]
    fn test_http_scheme_preserved() {
        let ep = Endpoint::resolve("http://localhost:9000", "cache", None);
        assert_eq!(ep.url("/cache/k.zip"), "http://localhost:9000/cache/k.zip");
    }

    #[test]
    fn test_bucket_host_not_mistaken_for_region() {
        // bucket.s3.amazonaws.com: "bucket" is not region-shaped
        let ep = Endpoint::resolve("https://bucket.s3.amazonaws.com", "bucket", None);
        assert_eq!(ep.region(), DEFAULT_REGION);
    }
}
