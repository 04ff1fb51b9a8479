//! The `meta.json` document describing a backup.

use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::upload_stats::{UploadStats, UploadSummary};
use crate::config::SiteConfig;
use crate::utils::Result;

/// Slack added to the serialized size when reserving archive space.
pub const METADATA_SIZE_SLACK: u64 = 1024;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PluginLists {
    pub enabled: Vec<String>,
    pub disabled: Vec<String>,
}

/// Facts about the site, captured when the backup is taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SiteInfo {
    pub version: String,
    pub db_version: Option<u64>,
    pub git_version: Option<String>,
    pub git_branch: Option<String>,
    pub base_url: String,
    pub cdn_url: Option<String>,
    pub s3_base_url: Option<String>,
    pub s3_cdn_url: Option<String>,
    pub db_name: String,
    pub multisite: bool,
    pub plugins: PluginLists,
}

impl From<&SiteConfig> for SiteInfo {
    fn from(site: &SiteConfig) -> Self {
        let mut plugins = PluginLists::default();
        for plugin in &site.plugins {
            let list = if plugin.enabled {
                &mut plugins.enabled
            } else {
                &mut plugins.disabled
            };
            list.push(plugin.name.clone());
        }

        Self {
            version: site.version.clone(),
            db_version: site.db_version,
            git_version: site.git_version.clone(),
            git_branch: site.git_branch.clone(),
            base_url: site.base_url.clone(),
            cdn_url: site.cdn_url.clone(),
            s3_base_url: site.s3_base_url.clone(),
            s3_cdn_url: site.s3_cdn_url.clone(),
            db_name: site.name.clone(),
            multisite: site.multisite,
            plugins,
        }
    }
}

#[derive(Serialize)]
struct Document<'a> {
    version: &'a str,
    db_version: Option<u64>,
    git_version: Option<&'a str>,
    git_branch: Option<&'a str>,
    base_url: &'a str,
    cdn_url: Option<&'a str>,
    s3_base_url: Option<&'a str>,
    s3_cdn_url: Option<&'a str>,
    db_name: &'a str,
    multisite: bool,
    uploads: UploadSummary,
    optimized_images: UploadSummary,
    plugins: &'a PluginLists,
}

pub struct MetadataWriter {
    site: SiteInfo,
    uploads: UploadSummary,
    optimized_images: UploadSummary,
}

impl MetadataWriter {
    pub fn new(
        site: SiteInfo,
        uploads: Option<&UploadStats>,
        optimized_images: Option<&UploadStats>,
    ) -> Self {
        Self {
            site,
            uploads: uploads.into(),
            optimized_images: optimized_images.into(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        let site = &self.site;
        let document = Document {
            version: &site.version,
            db_version: site.db_version,
            git_version: site.git_version.as_deref(),
            git_branch: site.git_branch.as_deref(),
            base_url: &site.base_url,
            cdn_url: site.cdn_url.as_deref(),
            s3_base_url: site.s3_base_url.as_deref(),
            s3_cdn_url: site.s3_cdn_url.as_deref(),
            db_name: &site.db_name,
            multisite: site.multisite,
            uploads: self.uploads,
            optimized_images: self.optimized_images,
            plugins: &site.plugins,
        };
        Ok(serde_json::to_string_pretty(&document)?)
    }

    /// Upper bound for the body, known before anything is written.
    pub fn estimated_file_size(&self) -> Result<u64> {
        Ok(self.to_json()?.len() as u64 + METADATA_SIZE_SLACK)
    }

    pub async fn write_into<W>(&self, out: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        out.write_all(self.to_json()?.as_bytes()).await?;
        Ok(())
    }
}
