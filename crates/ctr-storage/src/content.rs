//! Flat, key-addressed document storage on local disk or S3.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use chrono::{DateTime, Utc};
use ctr_core::StoredDocument;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::atomic::write_atomic;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key {key} not found in {store}")]
    NotFound { key: String, store: String },
    #[error("i/o failure on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("object storage failure on {key}: {message}")]
    Remote { key: String, message: String },
    #[error("content of {key} is not valid UTF-8")]
    Decode { key: String },
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// Capability set shared by every raw-document backend.
///
/// Keys are flat, relative names (`<id>.html`); backends never leak their own prefixes.
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn write(&self, key: &str, content: &str) -> Result<(), StoreError>;

    async fn read(&self, key: &str) -> Result<String, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Non-recursive glob (`*`, `?`) over the flat namespace.
    async fn list_matching(&self, pattern: &str) -> Result<Vec<StoredDocument>, StoreError>;

    fn describe(&self) -> String;
}

/// Shell-style wildcard match: `*` spans any run of characters, `?` exactly one.
pub fn glob_match(pattern: &str, name: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();
    let (mut pi, mut ni) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while ni < n.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == n[ni]) {
            pi += 1;
            ni += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ni));
            pi += 1;
        } else if let Some((star_pi, star_ni)) = star {
            pi = star_pi + 1;
            ni = star_ni + 1;
            star = Some((star_pi, star_ni + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|c| *c == '*')
}

#[derive(Debug, Clone)]
pub struct LocalContentStore {
    root: PathBuf,
}

impl LocalContentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    fn io_error(path: &Path, source: io::Error) -> StoreError {
        StoreError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

#[async_trait]
impl ContentStore for LocalContentStore {
    async fn write(&self, key: &str, content: &str) -> Result<(), StoreError> {
        let path = self.path_for(key);
        write_atomic(&path, content.as_bytes())
            .await
            .map_err(|e| Self::io_error(&path, e))
    }

    async fn read(&self, key: &str) -> Result<String, StoreError> {
        let path = self.path_for(key);
        match fs::read(&path).await {
            Ok(bytes) => String::from_utf8(bytes).map_err(|_| StoreError::Decode {
                key: key.to_string(),
            }),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(StoreError::NotFound {
                key: key.to_string(),
                store: self.describe(),
            }),
            Err(err) => Err(Self::io_error(&path, err)),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let path = self.path_for(key);
        fs::try_exists(&path)
            .await
            .map_err(|e| Self::io_error(&path, e))
    }

    async fn list_matching(&self, pattern: &str) -> Result<Vec<StoredDocument>, StoreError> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(Self::io_error(&self.root, err)),
        };

        let mut docs = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Self::io_error(&self.root, e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !glob_match(pattern, &name) {
                continue;
            }
            let metadata = entry
                .metadata()
                .await
                .map_err(|e| Self::io_error(&entry.path(), e))?;
            if !metadata.is_file() {
                continue;
            }
            let modified = metadata
                .modified()
                .map_err(|e| Self::io_error(&entry.path(), e))?;
            docs.push(StoredDocument {
                key: name,
                modified_at: DateTime::<Utc>::from(modified),
            });
        }
        docs.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(docs)
    }

    fn describe(&self) -> String {
        format!("file://{}", self.root.display())
    }
}

/// Bucket, key prefix and client options for [`S3ContentStore`].
#[derive(Debug, Clone, Default)]
pub struct S3Location {
    pub bucket: String,
    pub prefix: String,
    pub region: Option<String>,
    pub endpoint: Option<String>,
}

impl S3Location {
    /// `prefix/key` without doubled slashes; an empty prefix yields the bare key.
    pub fn full_key(&self, key: &str) -> String {
        let prefix = self.prefix.trim_end_matches('/');
        let key = key.trim_start_matches('/');
        if prefix.is_empty() {
            key.to_string()
        } else {
            format!("{prefix}/{key}")
        }
    }

    /// Listing prefix, always slash-terminated when non-empty.
    pub fn list_prefix(&self) -> String {
        let prefix = self.prefix.trim_end_matches('/');
        if prefix.is_empty() {
            String::new()
        } else {
            format!("{prefix}/")
        }
    }

    /// Strip the listing prefix; `None` for the placeholder object or nested keys.
    pub fn relative_key<'a>(&self, full_key: &'a str) -> Option<&'a str> {
        let prefix = self.list_prefix();
        let relative = full_key.strip_prefix(prefix.as_str()).unwrap_or(full_key);
        if relative.is_empty() || relative.contains('/') {
            None
        } else {
            Some(relative)
        }
    }
}

pub async fn build_s3_client(location: &S3Location) -> Client {
    let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
    if let Some(region) = &location.region {
        loader = loader.region(aws_sdk_s3::config::Region::new(region.clone()));
    }
    let shared = loader.load().await;

    let mut builder = aws_sdk_s3::config::Builder::from(&shared);
    if let Some(endpoint) = &location.endpoint {
        builder = builder.endpoint_url(endpoint).force_path_style(true);
    }
    Client::from_conf(builder.build())
}

#[derive(Debug, Clone)]
pub struct S3ContentStore {
    client: Client,
    location: S3Location,
}

impl S3ContentStore {
    pub fn new(client: Client, location: S3Location) -> Self {
        Self { client, location }
    }

    pub async fn connect(location: S3Location) -> Self {
        let client = build_s3_client(&location).await;
        info!(bucket = %location.bucket, prefix = %location.prefix, "using S3 content store");
        Self::new(client, location)
    }

    pub fn location(&self) -> &S3Location {
        &self.location
    }

    fn remote_error(key: &str, err: impl std::fmt::Display) -> StoreError {
        StoreError::Remote {
            key: key.to_string(),
            message: err.to_string(),
        }
    }
}

#[async_trait]
impl ContentStore for S3ContentStore {
    async fn write(&self, key: &str, content: &str) -> Result<(), StoreError> {
        let full_key = self.location.full_key(key);
        let content_type = if key.ends_with(".html") {
            "text/html"
        } else {
            "text/plain"
        };
        debug!(bucket = %self.location.bucket, key = %full_key, bytes = content.len(), "putting object");
        self.client
            .put_object()
            .bucket(&self.location.bucket)
            .key(&full_key)
            .content_type(content_type)
            .body(ByteStream::from(content.as_bytes().to_vec()))
            .send()
            .await
            .map_err(|e| Self::remote_error(&full_key, aws_sdk_s3::error::DisplayErrorContext(e)))?;
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<String, StoreError> {
        let full_key = self.location.full_key(key);
        let response = match self
            .client
            .get_object()
            .bucket(&self.location.bucket)
            .key(&full_key)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                let service = err.into_service_error();
                if service.is_no_such_key() {
                    return Err(StoreError::NotFound {
                        key: key.to_string(),
                        store: self.describe(),
                    });
                }
                return Err(Self::remote_error(
                    &full_key,
                    aws_sdk_s3::error::DisplayErrorContext(service),
                ));
            }
        };

        let bytes = response
            .body
            .collect()
            .await
            .map_err(|e| Self::remote_error(&full_key, e))?
            .into_bytes();
        String::from_utf8(bytes.to_vec()).map_err(|_| StoreError::Decode {
            key: key.to_string(),
        })
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let full_key = self.location.full_key(key);
        match self
            .client
            .head_object()
            .bucket(&self.location.bucket)
            .key(&full_key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) => {
                let service = err.into_service_error();
                if service.is_not_found() {
                    Ok(false)
                } else {
                    Err(Self::remote_error(
                        &full_key,
                        aws_sdk_s3::error::DisplayErrorContext(service),
                    ))
                }
            }
        }
    }

    async fn list_matching(&self, pattern: &str) -> Result<Vec<StoredDocument>, StoreError> {
        let prefix = self.location.list_prefix();
        let mut docs = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.location.bucket)
                .prefix(&prefix);
            if let Some(token) = &continuation {
                request = request.continuation_token(token);
            }
            let page = request.send().await.map_err(|e| {
                Self::remote_error(&prefix, aws_sdk_s3::error::DisplayErrorContext(e))
            })?;

            for object in page.contents() {
                let Some(full_key) = object.key() else {
                    continue;
                };
                let Some(relative) = self.location.relative_key(full_key) else {
                    continue;
                };
                if !glob_match(pattern, relative) {
                    continue;
                }
                let Some(modified_at) = object
                    .last_modified()
                    .and_then(|ts| DateTime::<Utc>::from_timestamp(ts.secs(), ts.subsec_nanos()))
                else {
                    warn!(key = %full_key, "object has no modification time; skipped");
                    continue;
                };
                docs.push(StoredDocument {
                    key: relative.to_string(),
                    modified_at,
                });
            }

            match page.next_continuation_token() {
                Some(token) if page.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        docs.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(docs)
    }

    fn describe(&self) -> String {
        format!("s3://{}/{}", self.location.bucket, self.location.list_prefix())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn glob_handles_stars_and_single_characters() {
        assert!(glob_match("*.html", "2004-000001-11.html"));
        assert!(!glob_match("*.html", "2004-000001-11.meta"));
        assert!(glob_match("200?-*.meta", "2004-000001-11.meta"));
        assert!(glob_match("*", "anything"));
        assert!(!glob_match("a*b", "acbd"));
        assert!(glob_match("a*b*", "acbd"));
    }

    #[test]
    fn s3_keys_are_prefix_scoped_and_relative() {
        let location = S3Location {
            bucket: "bronze".into(),
            prefix: "euctr/raw/".into(),
            ..Default::default()
        };
        assert_eq!(location.full_key("A.html"), "euctr/raw/A.html");
        assert_eq!(location.full_key("/A.html"), "euctr/raw/A.html");
        assert_eq!(location.list_prefix(), "euctr/raw/");
        assert_eq!(location.relative_key("euctr/raw/A.html"), Some("A.html"));
        assert_eq!(location.relative_key("euctr/raw/"), None);
        assert_eq!(location.relative_key("euctr/raw/nested/B.html"), None);

        let bare = S3Location {
            bucket: "bronze".into(),
            ..Default::default()
        };
        assert_eq!(bare.full_key("A.html"), "A.html");
        assert_eq!(bare.list_prefix(), "");
        assert_eq!(bare.relative_key("A.html"), Some("A.html"));
    }

    #[tokio::test]
    async fn local_store_round_trips_and_lists_flat_keys() {
        let dir = tempdir().expect("tempdir");
        let store = LocalContentStore::new(dir.path().join("bronze"));

        assert!(!store.exists("A.html").await.expect("exists"));
        store.write("A.html", "<html>a</html>").await.expect("write");
        store.write("A.meta", "hash=x").await.expect("write meta");
        store.write("B.html", "<html>b</html>").await.expect("write");
        std::fs::create_dir_all(store.root().join("sub.html")).expect("dir");

        assert!(store.exists("A.html").await.expect("exists"));
        assert_eq!(store.read("A.html").await.expect("read"), "<html>a</html>");

        let keys: Vec<_> = store
            .list_matching("*.html")
            .await
            .expect("list")
            .into_iter()
            .map(|d| d.key)
            .collect();
        assert_eq!(keys, vec!["A.html", "B.html"]);
    }

    #[tokio::test]
    async fn local_read_of_missing_key_is_not_found() {
        let dir = tempdir().expect("tempdir");
        let store = LocalContentStore::new(dir.path());
        let err = store.read("missing.html").await.expect_err("missing");
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn listing_a_missing_root_is_empty() {
        let dir = tempdir().expect("tempdir");
        let store = LocalContentStore::new(dir.path().join("never-created"));
        assert!(store.list_matching("*.html").await.expect("list").is_empty());
    }

    mod s3 {
        use super::*;
        use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
        use wiremock::matchers::{method, path, path_regex, query_param};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        fn store(server: &MockServer) -> S3ContentStore {
            let config = aws_sdk_s3::Config::builder()
                .behavior_version(BehaviorVersion::latest())
                .region(Region::new("us-east-1"))
                .credentials_provider(Credentials::new("test", "test", None, None, "static"))
                .endpoint_url(server.uri())
                .force_path_style(true)
                .build();
            S3ContentStore::new(
                Client::from_conf(config),
                S3Location {
                    bucket: "bronze".into(),
                    prefix: "euctr/raw".into(),
                    ..Default::default()
                },
            )
        }

        fn xml(body: &str) -> ResponseTemplate {
            ResponseTemplate::new(200).set_body_raw(body.to_string(), "application/xml")
        }

        const FIRST_PAGE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Name>bronze</Name>
  <Prefix>euctr/raw/</Prefix>
  <KeyCount>3</KeyCount>
  <MaxKeys>3</MaxKeys>
  <IsTruncated>true</IsTruncated>
  <NextContinuationToken>page-2</NextContinuationToken>
  <Contents><Key>euctr/raw/</Key><LastModified>2024-03-01T09:00:00.000Z</LastModified><Size>0</Size></Contents>
  <Contents><Key>euctr/raw/B.html</Key><LastModified>2024-03-01T10:00:00.000Z</LastModified><Size>10</Size></Contents>
  <Contents><Key>euctr/raw/B.meta</Key><LastModified>2024-03-01T10:00:00.000Z</LastModified><Size>10</Size></Contents>
</ListBucketResult>"#;

        const SECOND_PAGE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Name>bronze</Name>
  <Prefix>euctr/raw/</Prefix>
  <KeyCount>3</KeyCount>
  <MaxKeys>3</MaxKeys>
  <IsTruncated>false</IsTruncated>
  <Contents><Key>euctr/raw/A.html</Key><LastModified>2024-03-02T08:30:00.000Z</LastModified><Size>10</Size></Contents>
  <Contents><Key>euctr/raw/_staging/x.html</Key><LastModified>2024-03-02T08:30:00.000Z</LastModified><Size>10</Size></Contents>
  <Contents><Key>euctr/raw/C.html</Key><Size>10</Size></Contents>
</ListBucketResult>"#;

        #[tokio::test]
        async fn listing_follows_continuation_tokens_and_strips_prefix() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path_regex(r"^/bronze/?$"))
                .and(query_param("list-type", "2"))
                .and(query_param("continuation-token", "page-2"))
                .respond_with(xml(SECOND_PAGE))
                .with_priority(1)
                .expect(1)
                .mount(&server)
                .await;
            Mock::given(method("GET"))
                .and(path_regex(r"^/bronze/?$"))
                .and(query_param("list-type", "2"))
                .and(query_param("prefix", "euctr/raw/"))
                .respond_with(xml(FIRST_PAGE))
                .expect(1)
                .mount(&server)
                .await;

            let docs = store(&server).list_matching("*.html").await.expect("list");

            let keys: Vec<_> = docs.iter().map(|d| d.key.as_str()).collect();
            assert_eq!(keys, vec!["A.html", "B.html"]);
            assert_eq!(docs[0].modified_at.to_rfc3339(), "2024-03-02T08:30:00+00:00");
        }

        #[tokio::test]
        async fn missing_objects_map_to_not_found() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/bronze/euctr/raw/missing.html"))
                .respond_with(
                    ResponseTemplate::new(404).set_body_raw(
                        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
                         <Error><Code>NoSuchKey</Code><Message>The specified key does not exist.</Message>\
                         <Key>euctr/raw/missing.html</Key></Error>",
                        "application/xml",
                    ),
                )
                .mount(&server)
                .await;
            Mock::given(method("HEAD"))
                .and(path("/bronze/euctr/raw/missing.html"))
                .respond_with(ResponseTemplate::new(404))
                .mount(&server)
                .await;
            Mock::given(method("GET"))
                .and(path("/bronze/euctr/raw/A.html"))
                .respond_with(ResponseTemplate::new(200).set_body_string("<html>a</html>"))
                .mount(&server)
                .await;

            let store = store(&server);
            let err = store.read("missing.html").await.expect_err("missing");
            assert!(err.is_not_found(), "unexpected error: {err}");
            assert!(!store.exists("missing.html").await.expect("head"));
            assert_eq!(store.read("A.html").await.expect("read"), "<html>a</html>");
        }
    }
}
