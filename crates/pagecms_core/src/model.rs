use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::PageSettings;

pub const SLUG_CONTENT: &str = "slug";
pub const TITLE_CONTENT: &str = "title";
pub const BODY_CONTENT: &str = "body";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PageStatus {
    Draft,
    #[default]
    Published,
    Hidden,
    Expired,
}

impl PageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Published => "published",
            Self::Hidden => "hidden",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for PageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PageStatus {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> anyhow::Result<Self> {
        match value {
            "draft" => Ok(Self::Draft),
            "published" => Ok(Self::Published),
            "hidden" => Ok(Self::Hidden),
            "expired" => Ok(Self::Expired),
            other => bail!("unknown page status {other:?}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Page {
    pub id: i64,
    pub parent_id: Option<i64>,
    pub tree_id: i64,
    pub position: i64,
    pub status: PageStatus,
    pub template: Option<String>,
    pub delegate_to: Option<String>,
    pub redirect_to_url: Option<String>,
    pub redirect_to_id: Option<i64>,
    pub publication_date: Option<DateTime<Utc>>,
    pub publication_end_date: Option<DateTime<Utc>>,
    pub creation_date: DateTime<Utc>,
}

impl Page {
    /// Stored status adjusted by the publication window when the settings ask for it.
    pub fn calculated_status(&self, settings: &PageSettings, now: DateTime<Utc>) -> PageStatus {
        if settings.show_start_date
            && self.status == PageStatus::Published
            && self.publication_date.is_some_and(|start| start > now)
        {
            return PageStatus::Draft;
        }
        if settings.show_end_date && self.publication_end_date.is_some_and(|end| end < now) {
            return PageStatus::Expired;
        }
        self.status
    }

    pub fn is_visible(&self, settings: &PageSettings, now: DateTime<Utc>) -> bool {
        matches!(
            self.calculated_status(settings, now),
            PageStatus::Published | PageStatus::Hidden
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageAlias {
    pub id: i64,
    pub page_id: i64,
    pub url: String,
    pub language: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Content {
    pub page_id: i64,
    pub language: String,
    pub content_type: String,
    pub body: String,
    pub creation_date: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;

    fn page(status: PageStatus) -> Page {
        Page {
            id: 1,
            parent_id: None,
            tree_id: 1,
            position: 0,
            status,
            template: None,
            delegate_to: None,
            redirect_to_url: None,
            redirect_to_id: None,
            publication_date: None,
            publication_end_date: None,
            creation_date: Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            PageStatus::Draft,
            PageStatus::Published,
            PageStatus::Hidden,
            PageStatus::Expired,
        ] {
            assert_eq!(status.as_str().parse::<PageStatus>().unwrap(), status);
        }
        assert!("archived".parse::<PageStatus>().is_err());
    }

    #[test]
    fn visibility_follows_stored_status() {
        let settings = PageSettings::default();
        let now = Utc::now();
        assert!(page(PageStatus::Published).is_visible(&settings, now));
        assert!(page(PageStatus::Hidden).is_visible(&settings, now));
        assert!(!page(PageStatus::Draft).is_visible(&settings, now));
        assert!(!page(PageStatus::Expired).is_visible(&settings, now));
    }

    #[test]
    fn future_publication_counts_as_draft_when_start_date_enforced() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let mut future = page(PageStatus::Published);
        future.publication_date = Some(now + Duration::days(3));

        let lenient = PageSettings::default();
        assert_eq!(future.calculated_status(&lenient, now), PageStatus::Published);

        let strict = PageSettings {
            show_start_date: true,
            ..PageSettings::default()
        };
        assert_eq!(future.calculated_status(&strict, now), PageStatus::Draft);
        assert!(!future.is_visible(&strict, now));
    }

    #[test]
    fn passed_end_date_counts_as_expired_when_end_date_enforced() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let mut stale = page(PageStatus::Published);
        stale.publication_end_date = Some(now - Duration::hours(1));

        let strict = PageSettings {
            show_end_date: true,
            ..PageSettings::default()
        };
        assert_eq!(stale.calculated_status(&strict, now), PageStatus::Expired);
        assert!(stale.is_visible(&PageSettings::default(), now));
    }
}
