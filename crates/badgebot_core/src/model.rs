use std::fmt;

use serde::{Deserialize, Serialize};

/// Prefix the query service puts in front of every entity identifier.
pub const ENTITY_URI_PREFIX: &str = "http://www.wikidata.org/entity/";

pub const DEFAULT_SITELINK_TO_REDIRECT: &str = "Q70893996";
pub const DEFAULT_INTENTIONAL_SITELINK_TO_REDIRECT: &str = "Q70894304";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BadgeKind {
    SitelinkToRedirect,
    IntentionalSitelinkToRedirect,
}

impl BadgeKind {
    pub const ALL: [BadgeKind; 2] = [
        BadgeKind::SitelinkToRedirect,
        BadgeKind::IntentionalSitelinkToRedirect,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SitelinkToRedirect => "s2r",
            Self::IntentionalSitelinkToRedirect => "i2r",
        }
    }

    /// The badge that must not sit next to this one on the same sitelink.
    pub fn incompatible(self) -> Self {
        match self {
            Self::SitelinkToRedirect => Self::IntentionalSitelinkToRedirect,
            Self::IntentionalSitelinkToRedirect => Self::SitelinkToRedirect,
        }
    }
}

impl fmt::Display for BadgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Item identifiers of the two redirect badges.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct BadgeIds {
    #[serde(default = "default_sitelink_to_redirect")]
    pub sitelink_to_redirect: String,
    #[serde(default = "default_intentional_sitelink_to_redirect")]
    pub intentional_sitelink_to_redirect: String,
}

impl Default for BadgeIds {
    fn default() -> Self {
        Self {
            sitelink_to_redirect: default_sitelink_to_redirect(),
            intentional_sitelink_to_redirect: default_intentional_sitelink_to_redirect(),
        }
    }
}

impl BadgeIds {
    pub fn id(&self, kind: BadgeKind) -> &str {
        match kind {
            BadgeKind::SitelinkToRedirect => &self.sitelink_to_redirect,
            BadgeKind::IntentionalSitelinkToRedirect => &self.intentional_sitelink_to_redirect,
        }
    }

    pub fn kind_of(&self, badge: &str) -> Option<BadgeKind> {
        BadgeKind::ALL
            .into_iter()
            .find(|kind| self.id(*kind) == badge)
    }
}

fn default_sitelink_to_redirect() -> String {
    DEFAULT_SITELINK_TO_REDIRECT.to_string()
}

fn default_intentional_sitelink_to_redirect() -> String {
    DEFAULT_INTENTIONAL_SITELINK_TO_REDIRECT.to_string()
}

/// A local redirect page connected to an item, with whatever the replica knows about its target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RedirectFact {
    pub redirect_id: i64,
    pub redirect_namespace: i32,
    pub redirect_title: String,
    pub redirect_qid: String,
    pub target_namespace: Option<i32>,
    pub target_title: Option<String>,
    pub target_fragment: Option<String>,
    pub target_interwiki: Option<String>,
    /// `None` when the target page does not exist locally.
    pub target_id: Option<i64>,
    /// `None` when the target page exists but is not connected to an item.
    pub target_qid: Option<String>,
}

/// One badge on one sitelink, as reported by the query service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TagAssignment {
    pub identifier: String,
    pub site_link: String,
    pub display_name: String,
    pub badge: String,
}

/// Outer join row of a redirect fact with both badge relations.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct MasterRecord {
    pub redirect: Option<RedirectFact>,
    pub kind_a: Option<TagAssignment>,
    pub kind_b: Option<TagAssignment>,
}

impl MasterRecord {
    pub fn has_redirect(&self) -> bool {
        self.redirect.is_some()
    }

    pub fn has_target(&self) -> bool {
        self.redirect
            .as_ref()
            .is_some_and(|fact| fact.target_id.is_some())
    }

    pub fn target_connected(&self) -> bool {
        self.redirect
            .as_ref()
            .is_some_and(|fact| fact.target_qid.is_some())
    }

    pub fn has_kind_a(&self) -> bool {
        self.kind_a.is_some()
    }

    pub fn has_kind_b(&self) -> bool {
        self.kind_b.is_some()
    }

    pub fn has_interwiki_target(&self) -> bool {
        self.redirect
            .as_ref()
            .and_then(|fact| fact.target_interwiki.as_deref())
            .is_some_and(|value| !value.is_empty())
    }

    pub fn badge(&self, kind: BadgeKind) -> Option<&TagAssignment> {
        match kind {
            BadgeKind::SitelinkToRedirect => self.kind_a.as_ref(),
            BadgeKind::IntentionalSitelinkToRedirect => self.kind_b.as_ref(),
        }
    }

    /// Item identifier of the row, whichever side of the join supplied it.
    pub fn identifier(&self) -> Option<&str> {
        if let Some(fact) = &self.redirect {
            return Some(&fact.redirect_qid);
        }
        self.kind_a
            .as_ref()
            .or(self.kind_b.as_ref())
            .map(|tag| tag.identifier.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectDescriptor {
    pub db_name: String,
    pub base_url: String,
    pub family: String,
    pub language: String,
}

impl ProjectDescriptor {
    pub fn api_url(&self) -> String {
        format!("{}/w/api.php", self.base_url.trim_end_matches('/'))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SiteIdentity {
    pub family: String,
    pub language: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NamespaceNames {
    pub local: String,
    pub canonical: Option<String>,
}

/// Strips the entity URI prefix from a query-service value; plain identifiers pass through.
pub fn strip_entity_uri(value: &str) -> &str {
    value.strip_prefix(ENTITY_URI_PREFIX).unwrap_or(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fact(qid: &str, target_id: Option<i64>, target_qid: Option<&str>) -> RedirectFact {
        RedirectFact {
            redirect_id: 1,
            redirect_namespace: 0,
            redirect_title: "Foo".to_string(),
            redirect_qid: qid.to_string(),
            target_namespace: Some(0),
            target_title: Some("Bar".to_string()),
            target_fragment: None,
            target_interwiki: None,
            target_id,
            target_qid: target_qid.map(ToString::to_string),
        }
    }

    fn tag(qid: &str, badge: &str) -> TagAssignment {
        TagAssignment {
            identifier: qid.to_string(),
            site_link: "https://en.wikipedia.org/wiki/Foo".to_string(),
            display_name: "Foo".to_string(),
            badge: badge.to_string(),
        }
    }

    #[test]
    fn badge_ids_round_trip_kinds() {
        let ids = BadgeIds::default();
        assert_eq!(ids.id(BadgeKind::SitelinkToRedirect), "Q70893996");
        assert_eq!(
            ids.kind_of("Q70894304"),
            Some(BadgeKind::IntentionalSitelinkToRedirect)
        );
        assert_eq!(ids.kind_of("Q17437796"), None);
    }

    #[test]
    fn incompatible_badge_is_the_other_kind() {
        assert_eq!(
            BadgeKind::SitelinkToRedirect.incompatible(),
            BadgeKind::IntentionalSitelinkToRedirect
        );
        assert_eq!(
            BadgeKind::IntentionalSitelinkToRedirect.incompatible(),
            BadgeKind::SitelinkToRedirect
        );
    }

    #[test]
    fn record_predicates_follow_nullable_fields() {
        let record = MasterRecord {
            redirect: Some(fact("Q1", Some(10), None)),
            kind_a: None,
            kind_b: Some(tag("Q1", DEFAULT_INTENTIONAL_SITELINK_TO_REDIRECT)),
        };
        assert!(record.has_redirect());
        assert!(record.has_target());
        assert!(!record.target_connected());
        assert!(!record.has_kind_a());
        assert!(record.has_kind_b());
        assert_eq!(record.identifier(), Some("Q1"));
    }

    #[test]
    fn identifier_falls_back_to_badge_side() {
        let record = MasterRecord {
            redirect: None,
            kind_a: None,
            kind_b: Some(tag("Q7", DEFAULT_INTENTIONAL_SITELINK_TO_REDIRECT)),
        };
        assert_eq!(record.identifier(), Some("Q7"));
        assert!(!record.has_target());
    }

    #[test]
    fn strip_entity_uri_removes_prefix_only_when_present() {
        assert_eq!(
            strip_entity_uri("http://www.wikidata.org/entity/Q42"),
            "Q42"
        );
        assert_eq!(strip_entity_uri("Q42"), "Q42");
    }

    #[test]
    fn project_api_url_appends_script_path() {
        let project = ProjectDescriptor {
            db_name: "dewiki".to_string(),
            base_url: "https://de.wikipedia.org/".to_string(),
            family: "wikipedia".to_string(),
            language: "de".to_string(),
        };
        assert_eq!(project.api_url(), "https://de.wikipedia.org/w/api.php");
    }
}
