//! Typed, `serde`-deserializable shape of an image's configuration. A
//! control plane (CLI, JSON document, whatever) builds one of these and
//! hands it to [`crate::Image::open`]; this crate has no opinion on where
//! it came from.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct OriginConfig {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default)]
    pub cookies: Vec<String>,
    pub etag: Option<String>,
    pub last_modified: Option<i64>,
    /// Added to every chunk's offset before it is turned into a byte
    /// range against the origin, e.g. a disk image living inside a
    /// larger archive at a fixed byte offset.
    #[serde(default)]
    pub fetch_offset: u64,
    pub segment_size: Option<u64>,
    /// `"basic"` or `"digest"`; ignored if no `username` is set. Defaults
    /// to `"basic"` when a username is present, since the control plane's
    /// wire format doesn't carry a negotiated auth scheme (the reference
    /// engine lets libcurl negotiate any scheme the server offers; this
    /// crate asks the caller to pick one up front instead).
    #[serde(default)]
    pub auth_scheme: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageConfig {
    pub name: String,
    pub origin: OriginConfig,
    pub cache_root: String,
    pub chunk_size: u64,
    pub initial_size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_minimal_document() {
        let json = r#"{
            "name": "disk",
            "origin": { "url": "http://example.com/disk.img" },
            "cache_root": "/var/cache/vmnetfs/disk",
            "chunk_size": 131072,
            "initial_size": 10485760
        }"#;
        let config: ImageConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.name, "disk");
        assert_eq!(config.origin.url, "http://example.com/disk.img");
        assert!(config.origin.cookies.is_empty());
        assert_eq!(config.chunk_size, 131072);
    }

    #[test]
    fn deserializes_full_document() {
        let json = r#"{
            "name": "disk",
            "origin": {
                "url": "http://example.com/disk.img",
                "username": "alice",
                "password": "s3cret",
                "cookies": ["session=abc"],
                "etag": "\"abc\"",
                "last_modified": 1700000000,
                "segment_size": 1048576
            },
            "cache_root": "/var/cache/vmnetfs/disk",
            "chunk_size": 131072,
            "initial_size": 10485760
        }"#;
        let config: ImageConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.origin.username.as_deref(), Some("alice"));
        assert_eq!(config.origin.cookies, vec!["session=abc".to_string()]);
        assert_eq!(config.origin.segment_size, Some(1048576));
    }
}
