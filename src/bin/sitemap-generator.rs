//! Renders `sitemap.xml` from the route list.

use std::path::PathBuf;

use anyhow::Context;
use time::OffsetDateTime;
use timer_rooms_client::sitemap::{self, DEFAULT_CONFIG_PATH, DEFAULT_OUTPUT_PATH, SitemapConfig};

fn main() -> anyhow::Result<()> {
    let mut args = std::env::args_os().skip(1);
    let output = args
        .next()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_PATH));
    let config_path = args
        .next()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let config = SitemapConfig::load(&config_path).context("loading sitemap routes")?;
    let xml = sitemap::render(&config, OffsetDateTime::now_utc()).context("rendering sitemap")?;
    sitemap::write(&output, &xml).context("writing sitemap")?;

    println!("wrote {} routes to {}", config.routes.len(), output.display());
    Ok(())
}
