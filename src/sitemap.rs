//! `sitemap.xml` generation for the public marketing routes.

use std::{
    fmt::Write as _,
    fs, io,
    path::{Path, PathBuf},
};

use serde::Deserialize;
use thiserror::Error;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use validator::{Validate, ValidationErrors};

/// Default location of the sitemap route list.
pub const DEFAULT_CONFIG_PATH: &str = "config/sitemap.json";
/// Default output of the generator.
pub const DEFAULT_OUTPUT_PATH: &str = "public/sitemap.xml";

/// Failures of sitemap generation.
#[derive(Debug, Error)]
pub enum SitemapError {
    /// The route list could not be read.
    #[error("failed to read sitemap config `{path}`")]
    Read {
        /// Config location.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: io::Error,
    },
    /// The route list is not valid JSON.
    #[error("failed to parse sitemap config `{path}`")]
    Parse {
        /// Config location.
        path: PathBuf,
        /// Underlying JSON failure.
        #[source]
        source: serde_json::Error,
    },
    /// The route list failed validation.
    #[error("invalid sitemap config")]
    Invalid(#[from] ValidationErrors),
    /// The `lastmod` timestamp could not be formatted.
    #[error("failed to format lastmod timestamp")]
    Timestamp(#[from] time::error::Format),
    /// The sitemap could not be written.
    #[error("failed to write sitemap `{path}`")]
    Write {
        /// Output location.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: io::Error,
    },
}

/// How often a page is expected to change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeFrequency {
    /// Changes on every visit.
    Always,
    /// Changes hourly.
    Hourly,
    /// Changes daily.
    Daily,
    /// Changes weekly.
    Weekly,
    /// Changes monthly.
    Monthly,
    /// Changes yearly.
    Yearly,
    /// Archived content.
    Never,
}

impl ChangeFrequency {
    fn as_str(self) -> &'static str {
        match self {
            ChangeFrequency::Always => "always",
            ChangeFrequency::Hourly => "hourly",
            ChangeFrequency::Daily => "daily",
            ChangeFrequency::Weekly => "weekly",
            ChangeFrequency::Monthly => "monthly",
            ChangeFrequency::Yearly => "yearly",
            ChangeFrequency::Never => "never",
        }
    }
}

/// One public page.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SitemapRoute {
    /// Path relative to the site base URL.
    pub path: String,
    /// Hint for crawlers, omitted when unset.
    #[serde(default)]
    pub change_frequency: Option<ChangeFrequency>,
    /// Relative priority between 0 and 1.
    #[serde(default)]
    #[validate(range(min = 0.0, max = 1.0))]
    pub priority: Option<f32>,
}

/// Site base URL and the routes to list.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SitemapConfig {
    /// Absolute origin every route is resolved against.
    #[validate(url)]
    pub base_url: String,
    /// Routes in output order.
    #[validate(nested)]
    pub routes: Vec<SitemapRoute>,
}

impl SitemapConfig {
    /// Read and validate the route list at `path`.
    pub fn load(path: &Path) -> Result<Self, SitemapError> {
        let contents = fs::read_to_string(path).map_err(|source| SitemapError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: SitemapConfig =
            serde_json::from_str(&contents).map_err(|source| SitemapError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }
}

/// Render the urlset, stamping every entry with `lastmod`.
pub fn render(config: &SitemapConfig, lastmod: OffsetDateTime) -> Result<String, SitemapError> {
    let lastmod = lastmod.format(&Rfc3339)?;
    let base = config.base_url.trim_end_matches('/');

    let mut xml = String::from(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <urlset xmlns=\"http://www.sitemaps.org/schemas/sitemap/0.9\">\n",
    );
    for route in &config.routes {
        let loc = format!("{base}{}", normalize_path(&route.path));
        xml.push_str("  <url>\n");
        let _ = writeln!(xml, "    <loc>{}</loc>", escape_xml(&loc));
        let _ = writeln!(xml, "    <lastmod>{lastmod}</lastmod>");
        if let Some(frequency) = route.change_frequency {
            let _ = writeln!(xml, "    <changefreq>{}</changefreq>", frequency.as_str());
        }
        if let Some(priority) = route.priority {
            let _ = writeln!(xml, "    <priority>{priority:.1}</priority>");
        }
        xml.push_str("  </url>\n");
    }
    xml.push_str("</urlset>\n");
    Ok(xml)
}

/// Write the rendered sitemap, creating parent directories as needed.
pub fn write(path: &Path, contents: &str) -> Result<(), SitemapError> {
    let write_error = |source| SitemapError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(write_error)?;
    }
    fs::write(path, contents).map_err(write_error)
}

/// Collapse leading slashes to exactly one.
fn normalize_path(path: &str) -> String {
    format!("/{}", path.trim().trim_start_matches('/'))
}

fn escape_xml(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            c => escaped.push(c),
        }
    }
    escaped
}
