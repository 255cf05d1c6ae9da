use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use time::OffsetDateTime;
use url::Url;

use crate::error::{HookError, Result};
use crate::event::validate_event_type;
use crate::id::SubscriptionId;
use crate::retry::RetryPolicy;

/// Event type filter of a subscription.
///
/// `appointment.created` matches only that type. `billing.*` matches every
/// type below `billing.` (but not `billing` itself). `*` matches everything.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventTypeFilter {
    Exact(String),
    Prefix(String),
    Any,
}

impl EventTypeFilter {
    pub fn parse(filter: &str) -> Result<Self> {
        let filter = filter.trim();
        if filter == "*" {
            return Ok(Self::Any);
        }
        if let Some(prefix) = filter.strip_suffix(".*") {
            validate_event_type(prefix)
                .map_err(|e| HookError::validation(format!("invalid event_type_filter: {e}")))?;
            return Ok(Self::Prefix(prefix.to_string()));
        }
        validate_event_type(filter)
            .map_err(|e| HookError::validation(format!("invalid event_type_filter: {e}")))?;
        Ok(Self::Exact(filter.to_string()))
    }

    pub fn matches(&self, event_type: &str) -> bool {
        match self {
            Self::Exact(t) => t == event_type,
            Self::Prefix(prefix) => event_type
                .strip_prefix(prefix.as_str())
                .is_some_and(|rest| rest.len() > 1 && rest.starts_with('.')),
            Self::Any => true,
        }
    }
}

impl fmt::Display for EventTypeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(t) => f.write_str(t),
            Self::Prefix(p) => write!(f, "{p}.*"),
            Self::Any => f.write_str("*"),
        }
    }
}

impl FromStr for EventTypeFilter {
    type Err = HookError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for EventTypeFilter {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EventTypeFilter {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// An endpoint's registration to receive events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub event_type_filter: EventTypeFilter,
    pub target_url: Url,
    pub signing_secret: String,
    pub retry_policy: RetryPolicy,
    pub active: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,

    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Subscription {
    pub fn matches(&self, event_type: &str) -> bool {
        self.event_type_filter.matches(event_type)
    }

    /// Copy with the signing secret masked, for administrative responses.
    pub fn masked(&self) -> Self {
        Self {
            signing_secret: mask_secret(&self.signing_secret),
            ..self.clone()
        }
    }
}

/// Administrative request to create a subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSubscription {
    pub event_type_filter: String,
    pub target_url: String,
    pub signing_secret: String,

    /// Falls back to the deployment default when absent.
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,

    #[serde(default)]
    pub description: Option<String>,
}

impl NewSubscription {
    pub fn new(
        event_type_filter: impl Into<String>,
        target_url: impl Into<String>,
        signing_secret: impl Into<String>,
    ) -> Self {
        Self {
            event_type_filter: event_type_filter.into(),
            target_url: target_url.into(),
            signing_secret: signing_secret.into(),
            retry_policy: None,
            description: None,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Validate and build an active subscription.
    pub fn into_subscription(self, default_policy: RetryPolicy) -> Result<Subscription> {
        let event_type_filter = EventTypeFilter::parse(&self.event_type_filter)?;
        let target_url = parse_target_url(&self.target_url)?;
        validate_secret(&self.signing_secret)?;
        let retry_policy = self.retry_policy.unwrap_or(default_policy);
        retry_policy.validate()?;

        let now = OffsetDateTime::now_utc();
        Ok(Subscription {
            id: SubscriptionId::new(),
            event_type_filter,
            target_url,
            signing_secret: self.signing_secret,
            retry_policy,
            active: true,
            description: self.description,
            created_at: now,
            updated_at: now,
        })
    }
}

/// Administrative partial update. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriptionPatch {
    #[serde(default)]
    pub event_type_filter: Option<String>,
    #[serde(default)]
    pub target_url: Option<String>,
    #[serde(default)]
    pub signing_secret: Option<String>,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub description: Option<String>,
}

impl SubscriptionPatch {
    pub fn deactivate() -> Self {
        Self {
            active: Some(false),
            ..Default::default()
        }
    }

    pub fn activate() -> Self {
        Self {
            active: Some(true),
            ..Default::default()
        }
    }

    /// Apply onto `current`, validating every changed field.
    pub fn apply(self, current: &Subscription) -> Result<Subscription> {
        let mut next = current.clone();
        if let Some(filter) = self.event_type_filter {
            next.event_type_filter = EventTypeFilter::parse(&filter)?;
        }
        if let Some(url) = self.target_url {
            next.target_url = parse_target_url(&url)?;
        }
        if let Some(secret) = self.signing_secret {
            validate_secret(&secret)?;
            next.signing_secret = secret;
        }
        if let Some(policy) = self.retry_policy {
            policy.validate()?;
            next.retry_policy = policy;
        }
        if let Some(active) = self.active {
            next.active = active;
        }
        if let Some(description) = self.description {
            next.description = Some(description);
        }
        next.updated_at = OffsetDateTime::now_utc();
        Ok(next)
    }
}

fn parse_target_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim())?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(HookError::validation(format!(
            "target_url must use http or https, got '{}'",
            url.scheme()
        )));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(HookError::validation("target_url must have a host"));
    }
    Ok(url)
}

fn validate_secret(secret: &str) -> Result<()> {
    if secret.trim().is_empty() {
        return Err(HookError::validation("signing_secret must not be empty"));
    }
    Ok(())
}

/// Mask a secret for display.
pub fn mask_secret(secret: &str) -> String {
    if secret.is_empty() {
        String::new()
    } else {
        "***".to_string()
    }
}
