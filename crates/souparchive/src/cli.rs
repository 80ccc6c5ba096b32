use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use souparchive_core::DEFAULT_ARCHIVE_FILE_NAME;
use souparchive_core::feed::{self, DEFAULT_FEED_URL_TEMPLATE};

/// Mirror the media attachments of a soup.io feed into a local archive
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Opts {
    /// soup.io user name whose feed to archive
    #[arg(long, env = "SOUPARCHIVE_USER")]
    pub user: Option<String>,

    /// Serve the archive on this port instead of fetching
    #[arg(long, value_name = "PORT", env = "SOUPARCHIVE_HOST")]
    pub host: Option<u16>,

    /// Address to bind to when serving
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST), env = "SOUPARCHIVE_LISTEN_IP")]
    pub listen_ip: IpAddr,

    /// Directory payloads are saved to
    #[arg(long, default_value = "archive", env = "SOUPARCHIVE_ARCHIVE_DIR")]
    pub archive_dir: PathBuf,

    /// Archive file tracking what was saved [default: <ARCHIVE_DIR>/archive.json]
    #[arg(long, env = "SOUPARCHIVE_ARCHIVE_FILE")]
    pub archive_file: Option<PathBuf>,

    /// Feed url template, `{user}` is replaced with the user name
    #[arg(long, default_value = DEFAULT_FEED_URL_TEMPLATE, env = "SOUPARCHIVE_FEED_URL")]
    pub feed_url: String,

    /// Give up on a single download after this many seconds, 0 to never
    #[arg(long, default_value_t = 60, env = "SOUPARCHIVE_FETCH_TIMEOUT_SECS")]
    pub fetch_timeout_secs: u64,

    /// Limit the number of downloads running at the same time
    #[arg(long, env = "SOUPARCHIVE_MAX_CONCURRENT_DOWNLOADS")]
    pub max_concurrent_downloads: Option<usize>,
}

impl Opts {
    pub fn archive_dir(&self) -> &Path {
        &self.archive_dir
    }

    pub fn archive_file(&self) -> PathBuf {
        self.archive_file
            .clone()
            .unwrap_or_else(|| self.archive_dir.join(DEFAULT_ARCHIVE_FILE_NAME))
    }

    pub fn feed_url(&self, user: &str) -> String {
        feed::feed_url(&self.feed_url, user)
    }

    pub fn fetch_timeout(&self) -> Option<Duration> {
        (0 < self.fetch_timeout_secs).then(|| Duration::from_secs(self.fetch_timeout_secs))
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory as _;

    use super::*;

    fn parse(args: &[&str]) -> Opts {
        Opts::try_parse_from(std::iter::once("souparchive").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn verify_cli() {
        Opts::command().debug_assert();
    }

    #[test]
    fn defaults() {
        let opts = parse(&["--user", "someone"]);

        assert_eq!(opts.user.as_deref(), Some("someone"));
        assert_eq!(opts.host, None);
        assert_eq!(opts.archive_file(), Path::new("archive").join("archive.json"));
        assert_eq!(opts.feed_url("someone"), "http://someone.soup.io/rss");
        assert_eq!(opts.fetch_timeout(), Some(Duration::from_secs(60)));
        assert_eq!(opts.max_concurrent_downloads, None);
    }

    #[test]
    fn overrides() {
        let opts = parse(&[
            "--host",
            "8080",
            "--archive-dir",
            "/srv/soup",
            "--feed-url",
            "https://mirror.example.com/{user}.xml",
            "--fetch-timeout-secs",
            "0",
        ]);

        assert_eq!(opts.host, Some(8080));
        assert_eq!(opts.archive_file(), Path::new("/srv/soup/archive.json"));
        assert_eq!(
            opts.feed_url("me"),
            "https://mirror.example.com/me.xml"
        );
        assert_eq!(opts.fetch_timeout(), None);
    }
}
