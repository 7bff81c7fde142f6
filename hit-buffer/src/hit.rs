use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::{form_urlencoded, Url};

use crate::site::Site;

pub type SiteId = i64;
pub type SessionId = i64;

const MAX_TITLE_LEN: usize = 1024;
const MAX_PATH_LEN: usize = 2048;
const MAX_REF_LEN: usize = 2048;
const MAX_BROWSER_LEN: usize = 512;
const MAX_LOCATION_LEN: usize = 5;
const MAX_SIZE_ENTRIES: usize = 3;

// Query parameters that become the referrer of a hit which arrived without one.
const GENERATED_REF_PARAMS: [&str; 4] = ["ref", "src", "source", "utm_source"];

/// How the referrer of a hit was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefScheme {
    /// Regular http(s) referrer header.
    #[serde(rename = "h")]
    Http,
    /// Taken from a `?ref=`-style query parameter on the path.
    #[serde(rename = "g")]
    Generated,
    /// Anything that isn't an http(s) URL, e.g. `android-app://`.
    #[serde(rename = "o")]
    Other,
    /// Referrer URL tagged with a `utm_campaign`.
    #[serde(rename = "c")]
    Campaign,
}

impl RefScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefScheme::Http => "h",
            RefScheme::Generated => "g",
            RefScheme::Other => "o",
            RefScheme::Campaign => "c",
        }
    }
}

/// A single page view or custom event, as received from a client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Hit {
    pub site: SiteId,
    pub path: String,
    pub title: String,
    #[serde(rename = "ref")]
    pub referrer: String,
    #[serde(skip)]
    pub ref_url: Option<Url>,
    pub ref_scheme: Option<RefScheme>,
    pub browser: String,
    /// Screen width, height and device pixel ratio.
    pub size: Vec<f64>,
    pub location: String,
    pub remote_addr: String,
    pub created_at: DateTime<Utc>,
    pub bot: bool,
    pub event: bool,
    pub session: Option<SessionId>,
    pub first_visit: Option<bool>,
}

impl Hit {
    /// Parses the raw referrer. Referrers that aren't absolute URLs leave
    /// `ref_url` unset, which is not an error.
    pub fn parse_referrer(&mut self) {
        self.ref_url = match self.referrer.trim() {
            "" => None,
            referrer => Url::parse(referrer).ok(),
        };
    }

    pub fn referrer_host(&self) -> Option<&str> {
        self.ref_url.as_ref().and_then(Url::host_str)
    }

    /// Zero is what older clients send for "no session yet".
    pub fn has_session(&self) -> bool {
        matches!(self.session, Some(id) if id != 0)
    }

    pub fn is_first_visit(&self) -> bool {
        self.first_visit.unwrap_or(false)
    }

    pub fn size_string(&self) -> String {
        self.size
            .iter()
            .map(f64::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }

    fn clear_referrer(&mut self) {
        self.referrer.clear();
        self.ref_url = None;
        self.ref_scheme = None;
    }
}

/// All the problems found with a hit, keyed by field name.
#[derive(Error, Debug, Clone, Default, PartialEq, Eq)]
#[error("{}", join_errors(.errors))]
pub struct ValidationError {
    errors: Vec<(&'static str, String)>,
}

impl ValidationError {
    pub fn append(&mut self, field: &'static str, message: impl Into<String>) {
        self.errors.push((field, message.into()));
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.errors.iter().map(|(field, _)| *field)
    }

    pub fn into_result(self) -> Result<(), ValidationError> {
        if self.has_errors() {
            Err(self)
        } else {
            Ok(())
        }
    }
}

fn join_errors(errors: &[(&'static str, String)]) -> String {
    errors
        .iter()
        .map(|(field, message)| format!("{}: {}", field, message))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Defaulting and validation applied to every hit before it is stored.
pub trait HitRules: Send + Sync {
    fn apply_defaults(&self, site: &Site, hit: &mut Hit);
    fn validate(&self, site: &Site, hit: &Hit) -> Result<(), ValidationError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StandardRules;

impl HitRules for StandardRules {
    fn apply_defaults(&self, site: &Site, hit: &mut Hit) {
        if hit.created_at == DateTime::<Utc>::default() {
            hit.created_at = Utc::now();
        }

        hit.path = hit.path.trim().to_string();
        if hit.referrer.trim().is_empty() {
            hit.clear_referrer();
            if let Some(generated) = take_generated_ref(&mut hit.path) {
                hit.referrer = generated;
                hit.ref_scheme = Some(RefScheme::Generated);
            }
        } else if hit.ref_scheme != Some(RefScheme::Generated) {
            normalize_referrer(hit);
        }

        if hit.event {
            hit.path = hit.path.trim_start_matches('/').to_string();
        } else if !hit.path.is_empty() && !hit.path.starts_with('/') {
            hit.path.insert(0, '/');
        }

        if !site.settings.collect_referrer {
            hit.clear_referrer();
        }
        if !site.settings.collect_screen_size {
            hit.size.clear();
        }
        if !site.settings.collect_location {
            hit.location.clear();
        }

        hit.title = hit.title.trim().to_string();
        hit.browser = hit.browser.trim().to_string();
        truncate_chars(&mut hit.title, MAX_TITLE_LEN);
        truncate_chars(&mut hit.path, MAX_PATH_LEN);
        truncate_chars(&mut hit.referrer, MAX_REF_LEN);
        truncate_chars(&mut hit.browser, MAX_BROWSER_LEN);
    }

    fn validate(&self, site: &Site, hit: &Hit) -> Result<(), ValidationError> {
        let mut v = ValidationError::default();

        if hit.site <= 0 {
            v.append("site", "must be set");
        } else if hit.site != site.id {
            v.append("site", format!("does not match resolved site {}", site.id));
        }
        if !site.is_active() {
            v.append("site", "is not active");
        }
        if hit.path.is_empty() {
            v.append("path", "must be set");
        }
        if !hit.has_session() {
            v.append("session", "must be set");
        }
        if hit.size.len() > MAX_SIZE_ENTRIES {
            v.append(
                "size",
                format!("must have at most {} entries", MAX_SIZE_ENTRIES),
            );
        }
        if hit.size.iter().any(|s| !s.is_finite() || *s < 0.0) {
            v.append("size", "must only hold finite, non-negative numbers");
        }
        if hit.location.chars().count() > MAX_LOCATION_LEN {
            v.append(
                "location",
                format!("must be at most {} characters", MAX_LOCATION_LEN),
            );
        }
        if hit.created_at > Utc::now() + Duration::hours(24) {
            v.append("created_at", "is in the future");
        }

        v.into_result()
    }
}

/// Strips the scheme, fragment and tracking parameters from http(s)
/// referrers; everything else is kept as-is and marked as "other".
fn normalize_referrer(hit: &mut Hit) {
    let parsed = hit
        .ref_url
        .clone()
        .or_else(|| Url::parse(hit.referrer.trim()).ok());

    match parsed {
        Some(mut url) if matches!(url.scheme(), "http" | "https") => {
            let campaign = url.query_pairs().any(|(k, _)| k == "utm_campaign");
            let kept: Vec<(String, String)> = url
                .query_pairs()
                .filter(|(k, _)| !k.starts_with("utm_"))
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();

            url.set_fragment(None);
            if kept.is_empty() {
                url.set_query(None);
            } else {
                url.query_pairs_mut().clear().extend_pairs(kept);
            }

            let mut referrer = format!("{}{}", url.host_str().unwrap_or_default(), url.path());
            if let Some(query) = url.query() {
                referrer.push('?');
                referrer.push_str(query);
            }

            hit.referrer = referrer.trim_end_matches('/').to_string();
            hit.ref_scheme = Some(if campaign {
                RefScheme::Campaign
            } else {
                RefScheme::Http
            });
            hit.ref_url = Some(url);
        }
        _ => {
            hit.referrer = hit.referrer.trim().to_string();
            hit.ref_scheme = Some(RefScheme::Other);
        }
    }
}

/// Pulls a `?ref=`-style parameter out of the path, returning its value and
/// leaving the remaining query in place.
fn take_generated_ref(path: &mut String) -> Option<String> {
    let (base, query) = path.split_once('?')?;

    let mut generated = None;
    let mut kept = Vec::new();
    for (key, value) in form_urlencoded::parse(query.as_bytes()) {
        if GENERATED_REF_PARAMS.iter().any(|param| *param == key) {
            if generated.is_none() && !value.is_empty() {
                generated = Some(value.into_owned());
            }
        } else {
            kept.push((key.into_owned(), value.into_owned()));
        }
    }
    let generated = generated?;

    let mut rebuilt = base.to_string();
    if !kept.is_empty() {
        rebuilt.push('?');
        rebuilt.push_str(
            &form_urlencoded::Serializer::new(String::new())
                .extend_pairs(kept)
                .finish(),
        );
    }
    *path = rebuilt;

    Some(generated)
}

fn truncate_chars(s: &mut String, max: usize) {
    if let Some((idx, _)) = s.char_indices().nth(max) {
        s.truncate(idx);
    }
}
