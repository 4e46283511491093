use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::cache::{KeyDescriptor, Scope};
use crate::error::ApiError;

/// Provider id whose single-media lookups live in the `malData` scope.
pub const MAL_PROVIDER: &str = "mal";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MediaType {
    #[default]
    Anime,
    Manga,
}

impl MediaType {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaType::Anime => "ANIME",
            MediaType::Manga => "MANGA",
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaType {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ANIME" => Ok(MediaType::Anime),
            "MANGA" => Ok(MediaType::Manga),
            other => Err(ApiError::invalid_config(format!("unknown mediaType '{other}'"))),
        }
    }
}

/// Loose, host-facing request shape (what a code block or command produces).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DescriptorFields {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub provider: Option<String>,
    pub media_type: Option<String>,
    pub username: Option<String>,
    pub media_id: Option<u64>,
    pub list_type: Option<String>,
    pub search: Option<String>,
    pub page: Option<u32>,
    pub per_page: Option<u32>,
    pub layout: Option<String>,
    pub nocache: bool,
}

/// Fields every request variant carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub provider: String,
    pub media_type: MediaType,
    pub username: Option<String>,
    pub layout: Option<String>,
    pub nocache: bool,
}

/// Validated request; one variant per request type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RequestDescriptor {
    Stats {
        target: Target,
    },
    Single {
        target: Target,
        media_id: u64,
    },
    Search {
        target: Target,
        term: String,
        page: u32,
        per_page: u32,
    },
    List {
        target: Target,
        list_type: Option<String>,
    },
}

impl RequestDescriptor {
    /// Validates `fields`; `default_provider` fills a missing provider.
    pub fn parse(fields: DescriptorFields, default_provider: &str) -> Result<Self, ApiError> {
        let kind = fields
            .kind
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| ApiError::invalid_config("missing request type"))?
            .to_ascii_lowercase();
        let media_type = match fields.media_type.as_deref() {
            Some(raw) => raw.parse()?,
            None => MediaType::default(),
        };
        let target = Target {
            provider: fields
                .provider
                .filter(|p| !p.trim().is_empty())
                .unwrap_or_else(|| default_provider.to_string()),
            media_type,
            username: fields.username.filter(|u| !u.trim().is_empty()),
            layout: fields.layout,
            nocache: fields.nocache,
        };

        match kind.as_str() {
            "stats" => Ok(RequestDescriptor::Stats { target }),
            "single" => {
                let media_id = fields
                    .media_id
                    .ok_or_else(|| ApiError::invalid_config("single requests need a mediaId"))?;
                Ok(RequestDescriptor::Single { target, media_id })
            }
            "search" => {
                let term = fields
                    .search
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| ApiError::invalid_config("search requests need a search term"))?;
                Ok(RequestDescriptor::Search {
                    target,
                    term,
                    page: fields.page.unwrap_or(1).max(1),
                    per_page: fields.per_page.unwrap_or(20).clamp(1, 50),
                })
            }
            "list" => Ok(RequestDescriptor::List {
                target,
                list_type: fields.list_type,
            }),
            other => Err(ApiError::invalid_config(format!("unknown request type '{other}'"))),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RequestDescriptor::Stats { .. } => "stats",
            RequestDescriptor::Single { .. } => "single",
            RequestDescriptor::Search { .. } => "search",
            RequestDescriptor::List { .. } => "list",
        }
    }

    pub fn target(&self) -> &Target {
        match self {
            RequestDescriptor::Stats { target }
            | RequestDescriptor::Single { target, .. }
            | RequestDescriptor::Search { target, .. }
            | RequestDescriptor::List { target, .. } => target,
        }
    }

    fn target_mut(&mut self) -> &mut Target {
        match self {
            RequestDescriptor::Stats { target }
            | RequestDescriptor::Single { target, .. }
            | RequestDescriptor::Search { target, .. }
            | RequestDescriptor::List { target, .. } => target,
        }
    }

    pub fn provider(&self) -> &str {
        &self.target().provider
    }

    pub fn username(&self) -> Option<&str> {
        self.target().username.as_deref()
    }

    /// Fills the username when the request did not name one.
    pub fn with_default_user(mut self, user: Option<String>) -> Self {
        let target = self.target_mut();
        if target.username.is_none() {
            target.username = user;
        }
        self
    }

    pub fn media_id(&self) -> Option<u64> {
        match self {
            RequestDescriptor::Single { media_id, .. } => Some(*media_id),
            _ => None,
        }
    }

    pub fn nocache(&self) -> bool {
        self.target().nocache
    }

    /// Cache scope the response is stored under.
    pub fn scope(&self) -> Scope {
        match self {
            RequestDescriptor::Stats { .. } | RequestDescriptor::List { .. } => Scope::UserData,
            RequestDescriptor::Single { target, .. } if target.provider == MAL_PROVIDER => Scope::MalData,
            RequestDescriptor::Single { .. } => Scope::MediaData,
            RequestDescriptor::Search { .. } => Scope::SearchResults,
        }
    }

    /// Cache key fields. `layout` and `nocache` only affect presentation
    /// and lookup, so they stay out of the key.
    pub fn cache_key(&self) -> KeyDescriptor {
        let target = self.target();
        let key = KeyDescriptor::new()
            .field("type", self.kind())
            .field("provider", target.provider.as_str())
            .field("mediaType", target.media_type.as_str())
            .maybe("username", target.username.as_deref());
        match self {
            RequestDescriptor::Stats { .. } => key,
            RequestDescriptor::Single { media_id, .. } => key.field("mediaId", *media_id),
            RequestDescriptor::Search {
                term, page, per_page, ..
            } => key
                .field("search", term.as_str())
                .field("page", *page)
                .field("perPage", *per_page),
            RequestDescriptor::List { list_type, .. } => key.maybe("listType", list_type.as_deref()),
        }
    }
}
