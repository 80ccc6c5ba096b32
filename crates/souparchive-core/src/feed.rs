use reqwest::StatusCode;
use rss::extension::Extension;
use serde::Deserialize;
use snafu::{ResultExt as _, Snafu};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc2822;
use tracing::{debug, info, warn};

pub const LOG_TARGET: &str = "souparchive::feed";

/// Namespace prefix of the soup.io feed extensions
const SOUP_EXTENSION_PREFIX: &str = "soup";

/// Feed url of a soup.io user, `{user}` is replaced with the user name
pub const DEFAULT_FEED_URL_TEMPLATE: &str = "http://{user}.soup.io/rss";

/// Produce the feed url of `user` from a url template
pub fn feed_url(template: &str, user: &str) -> String {
    template.replace("{user}", user)
}

#[derive(Debug, Snafu)]
pub enum FeedError {
    #[snafu(display("Error fetching feed {url}"))]
    Http { url: String, source: reqwest::Error },
    #[snafu(display("Error fetching feed {url}: status {status}"))]
    Status { url: String, status: StatusCode },
    #[snafu(display("Error parsing feed"))]
    Parse { source: rss::Error },
}

pub type FeedResult<T> = std::result::Result<T, FeedError>;

/// Metadata soup.io attaches to every post
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Attributes {
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub url: String,
}

impl Attributes {
    /// Decode the `soup:attributes` element
    ///
    /// Older feeds carry a JSON object as element text, newer ones put the
    /// same keys in XML attributes.
    fn from_extension(ext: &Extension) -> Option<Self> {
        if let Some(text) = ext.value().map(str::trim).filter(|t| !t.is_empty()) {
            return match serde_json::from_str(text) {
                Ok(attrs) => Some(attrs),
                Err(err) => {
                    debug!(target: LOG_TARGET, %err, "Ignoring undecodable soup attributes");
                    None
                }
            };
        }

        let attrs = ext.attrs();
        if attrs.is_empty() {
            return None;
        }
        Some(Self {
            kind: attrs.get("type").cloned().unwrap_or_default(),
            url: attrs.get("url").cloned().unwrap_or_default(),
        })
    }
}

/// A single post in the feed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedItem {
    pub identifier: String,
    /// Payload to download, if the post has one
    pub resource_url: Option<String>,
    /// Unix timestamp, `0` when the feed did not carry a usable date
    pub published_at: i64,
    pub link: Option<String>,
    pub content_type: Option<String>,
    pub attributes: Option<Attributes>,
}

impl FeedItem {
    pub fn new(
        identifier: impl Into<String>,
        resource_url: Option<String>,
        published_at: i64,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            resource_url,
            published_at,
            ..Default::default()
        }
    }

    fn from_rss(item: &rss::Item) -> Self {
        let attributes = item
            .extensions()
            .get(SOUP_EXTENSION_PREFIX)
            .and_then(|ext| ext.get("attributes"))
            .and_then(|values| values.first())
            .and_then(Attributes::from_extension);

        let enclosure = item.enclosure();
        let resource_url = enclosure
            .map(|e| e.url().trim())
            .filter(|url| !url.is_empty())
            .or_else(|| {
                attributes
                    .as_ref()
                    .map(|a| a.url.trim())
                    .filter(|url| !url.is_empty())
            })
            .map(ToOwned::to_owned);

        let published_at = item.pub_date().map_or(0, |raw| {
            parse_pub_date(raw).unwrap_or_else(|| {
                warn!(target: LOG_TARGET, pub_date = %raw, "Unparseable publish date");
                0
            })
        });

        // Items without a guid are told apart by their link or payload
        let identifier = [
            item.guid().map(|g| g.value()),
            item.link(),
            resource_url.as_deref(),
        ]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|id| !id.is_empty())
        .unwrap_or_default()
        .to_owned();

        Self {
            identifier,
            resource_url,
            published_at,
            link: item.link().map(ToOwned::to_owned),
            content_type: enclosure
                .map(|e| e.mime_type().to_owned())
                .filter(|t| !t.is_empty()),
            attributes,
        }
    }
}

/// Parse an RFC 2822 date, also accepting the `GMT`/`UTC` zone names
fn parse_pub_date(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if let Ok(dt) = OffsetDateTime::parse(raw, &Rfc2822) {
        return Some(dt.unix_timestamp());
    }

    let numeric = raw
        .strip_suffix("GMT")
        .or_else(|| raw.strip_suffix("UTC"))
        .or_else(|| raw.strip_suffix("UT"))
        .map(|prefix| format!("{prefix}+0000"))?;
    OffsetDateTime::parse(&numeric, &Rfc2822)
        .ok()
        .map(|dt| dt.unix_timestamp())
}

#[derive(Debug, Clone, Default)]
pub struct Feed {
    pub title: String,
    pub link: String,
    pub description: String,
    pub items: Vec<FeedItem>,
}

impl Feed {
    /// Parse an rss document
    ///
    /// Individual items are decoded best-effort: missing fields are left
    /// empty instead of failing the whole feed.
    pub fn from_xml(input: &[u8]) -> FeedResult<Self> {
        let channel = rss::Channel::read_from(input).context(ParseSnafu)?;

        Ok(Self {
            title: channel.title().to_owned(),
            link: channel.link().to_owned(),
            description: channel.description().to_owned(),
            items: channel.items().iter().map(FeedItem::from_rss).collect(),
        })
    }
}

/// Retrieves and parses feeds over http
#[derive(Debug, Clone)]
pub struct FeedClient {
    client: reqwest::Client,
}

impl FeedClient {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    pub async fn fetch(&self, url: &str) -> FeedResult<Feed> {
        info!(target: LOG_TARGET, %url, "Fetching feed");
        let response = self.client.get(url).send().await.context(HttpSnafu { url })?;

        let status = response.status();
        if status != StatusCode::OK {
            return StatusSnafu { url, status }.fail();
        }

        let body = response.bytes().await.context(HttpSnafu { url })?;
        let feed = Feed::from_xml(&body)?;

        info!(target: LOG_TARGET, %url, count = feed.items.len(), "Fetched feed");
        Ok(feed)
    }
}
