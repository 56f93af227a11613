//! Resolves where the results and the report of a test run are stored.
//!
//! Each provider only knows how to name a location and build a public URL for it.
//! Uploading is done by the workloads themselves.
use async_trait::async_trait;
use kube::ResourceExt;

use crate::{
    error::{Error, Result},
    testrun::{CloudStorageSpec, TestRun},
};

/// Environment key holding the azure storage account name.
pub const AZURE_ACCOUNT_ENV: &str = "AZUREBLOB_ACCOUNT";

/// Location of the results of a test run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StorageInfo {
    /// Bucket reference the workloads read and write, `<scheme>:<bucket>/<path>`.
    pub bucket: String,
    /// Public URL of the rendered report.
    pub report_url: String,
}

impl StorageInfo {
    /// No cloud storage configured.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Report whether cloud storage is configured.
    pub fn is_disabled(&self) -> bool {
        self.bucket.is_empty()
    }
}

/// Returns the configured provider verbatim, the empty string included.
pub fn cloud_storage_provider(run: &TestRun) -> &str {
    &run.spec.cloud_storage.provider
}

/// Resolves the storage location of a test run.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CloudStorageResolver: Send + Sync {
    /// Resolve the location. A disabled provider is not an error.
    async fn resolve(&self, run: &TestRun) -> Result<StorageInfo>;
}

/// Resolver selecting a provider by the `cloudStorage.provider` tag.
pub struct ProviderResolver;

#[async_trait]
impl CloudStorageResolver for ProviderResolver {
    async fn resolve(&self, run: &TestRun) -> Result<StorageInfo> {
        resolve_storage(run)
    }
}

/// Resolve the storage location of a test run without any I/O.
pub fn resolve_storage(run: &TestRun) -> Result<StorageInfo> {
    let spec = &run.spec.cloud_storage;
    let Some(provider) = provider_for(cloud_storage_provider(run))? else {
        return Ok(StorageInfo::disabled());
    };
    let bucket = spec
        .bucket
        .as_deref()
        .filter(|bucket| !bucket.is_empty())
        .ok_or_else(|| {
            Error::Config(format!(
                "cloud storage provider {} requires a bucket",
                spec.provider
            ))
        })?;
    let path = report_path(run);
    Ok(StorageInfo {
        bucket: format!("{}:{bucket}/{path}", provider.scheme()),
        report_url: provider.report_url(spec, bucket, &path)?,
    })
}

// Path of the run inside the bucket. Stable across reconciles of the same object.
fn report_path(run: &TestRun) -> String {
    let mut segments = Vec::new();
    if let Some(prefix) = run
        .spec
        .cloud_storage
        .prefix
        .as_deref()
        .map(|prefix| prefix.trim_matches('/'))
        .filter(|prefix| !prefix.is_empty())
    {
        segments.push(prefix.to_owned());
    }
    segments.push(run.name_any());
    if let Some(created) = &run.metadata.creation_timestamp {
        segments.push(created.0.timestamp().to_string());
    }
    segments.join("/")
}

trait StorageProvider: Sync {
    fn scheme(&self) -> &'static str;
    fn report_url(&self, spec: &CloudStorageSpec, bucket: &str, path: &str) -> Result<String>;
}

struct S3;
struct Gcs;
struct AzureBlob;

static S3_PROVIDER: S3 = S3;
static GCS_PROVIDER: Gcs = Gcs;
static AZURE_PROVIDER: AzureBlob = AzureBlob;

fn provider_for(tag: &str) -> Result<Option<&'static dyn StorageProvider>> {
    match tag {
        "" => Ok(None),
        "aws" => Ok(Some(&S3_PROVIDER)),
        "gcp" => Ok(Some(&GCS_PROVIDER)),
        "azure" => Ok(Some(&AZURE_PROVIDER)),
        other => Err(Error::Config(format!(
            "unknown cloud storage provider {other:?}"
        ))),
    }
}

impl StorageProvider for S3 {
    fn scheme(&self) -> &'static str {
        "s3"
    }
    fn report_url(&self, spec: &CloudStorageSpec, bucket: &str, path: &str) -> Result<String> {
        Ok(match spec.region.as_deref().filter(|r| !r.is_empty()) {
            Some(region) => format!("https://{bucket}.s3.{region}.amazonaws.com/{path}/index.html"),
            None => format!("https://{bucket}.s3.amazonaws.com/{path}/index.html"),
        })
    }
}

impl StorageProvider for Gcs {
    fn scheme(&self) -> &'static str {
        "gcs"
    }
    fn report_url(&self, _spec: &CloudStorageSpec, bucket: &str, path: &str) -> Result<String> {
        Ok(format!(
            "https://storage.googleapis.com/{bucket}/{path}/index.html"
        ))
    }
}

impl StorageProvider for AzureBlob {
    fn scheme(&self) -> &'static str {
        "az"
    }
    fn report_url(&self, spec: &CloudStorageSpec, bucket: &str, path: &str) -> Result<String> {
        let account = spec
            .env
            .as_ref()
            .and_then(|env| env.get(AZURE_ACCOUNT_ENV))
            .filter(|account| !account.is_empty())
            .ok_or_else(|| {
                Error::Config(format!(
                    "azure cloud storage requires {AZURE_ACCOUNT_ENV} in cloudStorage.env"
                ))
            })?;
        Ok(format!(
            "https://{account}.blob.core.windows.net/{bucket}/{path}/index.html"
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::{cloud_storage_provider, resolve_storage, StorageInfo};
    use crate::testrun::{CloudStorageSpec, TestRun};

    fn run_with(storage: CloudStorageSpec) -> TestRun {
        let mut run = TestRun::test();
        run.spec.cloud_storage = storage;
        run
    }

    fn aws(region: Option<&str>) -> CloudStorageSpec {
        CloudStorageSpec {
            provider: "aws".to_owned(),
            bucket: Some("results".to_owned()),
            region: region.map(str::to_owned),
            ..Default::default()
        }
    }

    #[test]
    fn provider_accessor_is_verbatim() {
        let mut run = TestRun::test();
        assert_eq!(cloud_storage_provider(&run), "");
        run.spec.cloud_storage.provider = "aws".to_owned();
        assert_eq!(cloud_storage_provider(&run), "aws");
    }

    #[test]
    fn empty_provider_is_disabled_not_an_error() {
        let info = resolve_storage(&TestRun::test()).unwrap();
        assert_eq!(info, StorageInfo::disabled());
        assert!(info.is_disabled());
    }

    #[test]
    fn aws_without_region() {
        let info = resolve_storage(&run_with(aws(None))).unwrap();
        assert_eq!(info.bucket, "s3:results/test/1700000000");
        assert_eq!(
            info.report_url,
            "https://results.s3.amazonaws.com/test/1700000000/index.html"
        );
    }

    #[test]
    fn aws_with_region_and_prefix() {
        let mut storage = aws(Some("ap-northeast-1"));
        storage.prefix = Some("/load/nightly/".to_owned());
        let info = resolve_storage(&run_with(storage)).unwrap();
        assert_eq!(info.bucket, "s3:results/load/nightly/test/1700000000");
        assert_eq!(
            info.report_url,
            "https://results.s3.ap-northeast-1.amazonaws.com/load/nightly/test/1700000000/index.html"
        );
    }

    #[test]
    fn gcp() {
        let info = resolve_storage(&run_with(CloudStorageSpec {
            provider: "gcp".to_owned(),
            bucket: Some("results".to_owned()),
            ..Default::default()
        }))
        .unwrap();
        assert_eq!(info.bucket, "gcs:results/test/1700000000");
        assert_eq!(
            info.report_url,
            "https://storage.googleapis.com/results/test/1700000000/index.html"
        );
    }

    #[test]
    fn azure_needs_account() {
        let mut storage = CloudStorageSpec {
            provider: "azure".to_owned(),
            bucket: Some("reports".to_owned()),
            ..Default::default()
        };
        let err = resolve_storage(&run_with(storage.clone())).unwrap_err();
        assert!(err.is_config(), "{err}");

        storage.env = Some(BTreeMap::from_iter([(
            "AZUREBLOB_ACCOUNT".to_owned(),
            "acct".to_owned(),
        )]));
        let info = resolve_storage(&run_with(storage)).unwrap();
        assert_eq!(info.bucket, "az:reports/test/1700000000");
        assert_eq!(
            info.report_url,
            "https://acct.blob.core.windows.net/reports/test/1700000000/index.html"
        );
    }

    #[test]
    fn unknown_provider_is_config_error() {
        let err = resolve_storage(&run_with(CloudStorageSpec {
            provider: "dropbox".to_owned(),
            bucket: Some("results".to_owned()),
            ..Default::default()
        }))
        .unwrap_err();
        assert!(err.is_config());
        assert_eq!(
            err.to_string(),
            "invalid configuration: unknown cloud storage provider \"dropbox\""
        );
    }

    #[test]
    fn missing_bucket_is_config_error() {
        let mut storage = aws(None);
        storage.bucket = None;
        assert!(resolve_storage(&run_with(storage)).unwrap_err().is_config());
    }
}
