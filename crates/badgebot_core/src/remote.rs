//! Contracts of the remote collaborators the reconciliation core talks to.
//!
//! Every call either returns a value or a classified [`RemoteError`]; callers decide
//! what to do from [`RemoteError::class`], never from the message text.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use thiserror::Error;

use crate::model::{
    NamespaceNames, ProjectDescriptor, RedirectFact, SiteIdentity, TagAssignment,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The remote state no longer matches the snapshot. Skip the record.
    Expected,
    /// The program called the API incorrectly. Stop writing for this bucket.
    Contract,
    /// The remote system refused or failed. Skip and carry on.
    External,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("entity {0} does not exist")]
    NoSuchEntity(String),
    #[error("page {title} does not exist on {site}")]
    PageMissing { site: String, title: String },
    #[error("page {title} on {site} is not a redirect")]
    NotRedirect { site: String, title: String },
    #[error("circular redirect detected for {title} on {site}")]
    CircularRedirect { site: String, title: String },
    #[error("redirect {title} on {site} points to another site ({interwiki})")]
    CrossSiteRedirect {
        site: String,
        title: String,
        interwiki: String,
    },
    #[error("edit conflict on {0}")]
    EditConflict(String),
    #[error("invalid badge {0}")]
    InvalidBadge(String),
    #[error("malformed request [{code}]: {info}")]
    MalformedRequest { code: String, info: String },
    #[error("unknown site {0}")]
    UnknownSite(String),
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("write rejected [{code}]: {info}")]
    Rejected { code: String, info: String },
    #[error("remote call failed: {0}")]
    Transport(String),
}

impl RemoteError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::NoSuchEntity(_)
            | Self::PageMissing { .. }
            | Self::NotRedirect { .. }
            | Self::CircularRedirect { .. }
            | Self::CrossSiteRedirect { .. }
            | Self::EditConflict(_) => ErrorClass::Expected,
            Self::InvalidBadge(_) | Self::MalformedRequest { .. } => ErrorClass::Contract,
            Self::UnknownSite(_)
            | Self::Authentication(_)
            | Self::Rejected { .. }
            | Self::Transport(_) => ErrorClass::External,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sitelink {
    pub site: String,
    pub title: String,
    pub badges: BTreeSet<String>,
}

impl Sitelink {
    pub fn has_badge(&self, badge: &str) -> bool {
        self.badges.contains(badge)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    pub id: String,
    /// Revision the entity was read at; writes use it as their base revision.
    pub revision: Option<u64>,
    pub sitelinks: BTreeMap<String, Sitelink>,
}

impl Entity {
    pub fn sitelink(&self, site: &str) -> Option<&Sitelink> {
        self.sitelinks.get(site)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityLookup {
    Found(Entity),
    Missing,
    Redirect { target: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectTarget {
    pub title: String,
    pub exists: bool,
}

/// Local page whose cached item association should be refreshed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshTarget {
    PageId(i64),
    Title(String),
}

pub trait EntityStore {
    fn resolve(&mut self, identifier: &str) -> Result<EntityLookup, RemoteError>;
    fn grant_badge(
        &mut self,
        entity: &Entity,
        site: &str,
        badge: &str,
        summary: &str,
    ) -> Result<(), RemoteError>;
    fn revoke_badge(
        &mut self,
        entity: &Entity,
        site: &str,
        badge: &str,
        summary: &str,
    ) -> Result<(), RemoteError>;
    fn remove_sitelink(
        &mut self,
        entity: &Entity,
        site: &str,
        summary: &str,
    ) -> Result<(), RemoteError>;
}

pub trait PageInspector {
    fn is_redirect(&mut self, site: &str, title: &str) -> Result<bool, RemoteError>;
    fn redirect_target(&mut self, site: &str, title: &str) -> Result<RedirectTarget, RemoteError>;
    fn content_length(&mut self, site: &str, title: &str) -> Result<u64, RemoteError>;
    fn target_entity(&mut self, site: &str, title: &str) -> Result<Option<String>, RemoteError>;
}

pub trait CacheRefresh {
    fn request_refresh(&mut self, site: &str, target: &RefreshTarget) -> Result<(), RemoteError>;
}

pub trait SiteMetadata {
    fn namespace_names(
        &mut self,
        project: &ProjectDescriptor,
    ) -> Result<BTreeMap<i32, NamespaceNames>, RemoteError>;
    fn site_identity(&mut self, db_name: &str) -> Result<SiteIdentity, RemoteError>;
}

pub trait ReportPublisher {
    fn publish(&mut self, page: &str, content: &str, summary: &str) -> Result<(), RemoteError>;
}

/// Everything the reconciler needs from the remote side, usually one client.
pub trait RemoteApi: EntityStore + PageInspector + CacheRefresh {}

impl<T: EntityStore + PageInspector + CacheRefresh> RemoteApi for T {}

/// Source of the per-project relations that feed the joiner.
pub trait FactSource {
    fn list_projects(&mut self) -> Result<Vec<ProjectDescriptor>>;
    fn fetch_redirect_facts(&mut self, project: &ProjectDescriptor) -> Result<Vec<RedirectFact>>;
    fn fetch_tag_assignments(&mut self, project: &ProjectDescriptor)
    -> Result<Vec<TagAssignment>>;
}

#[cfg(test)]
mod tests {
    use super::{ErrorClass, RemoteError};

    #[test]
    fn error_classes_follow_taxonomy() {
        assert_eq!(
            RemoteError::EditConflict("Q1".to_string()).class(),
            ErrorClass::Expected
        );
        assert_eq!(
            RemoteError::CircularRedirect {
                site: "enwiki".to_string(),
                title: "Loop".to_string(),
            }
            .class(),
            ErrorClass::Expected
        );
        assert_eq!(
            RemoteError::InvalidBadge("Q1".to_string()).class(),
            ErrorClass::Contract
        );
        assert_eq!(
            RemoteError::Rejected {
                code: "protectedpage".to_string(),
                info: "locked".to_string(),
            }
            .class(),
            ErrorClass::External
        );
        assert_eq!(
            RemoteError::UnknownSite("xxwiki".to_string()).class(),
            ErrorClass::External
        );
    }
}
