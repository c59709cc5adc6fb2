//! Verify-then-commit pipeline that turns actionable records into repository writes.
//!
//! The classified snapshot may be minutes old, so every record is re-checked against the
//! live repository and client wiki before exactly one mutation is issued. Each stage
//! returns `Result<_, Halt>`: a [`Halt::Skip`] drops the record and the bucket moves on,
//! a [`Halt::Fatal`] stops the remaining records of the bucket on this project.

use std::fmt;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::classify::ActionBucket;
use crate::config::ReconcilePolicy;
use crate::model::{BadgeKind, MasterRecord};
use crate::remote::{
    Entity, EntityLookup, ErrorClass, RefreshTarget, RemoteApi, RemoteError,
};

/// Why a record was left alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    MissingIdentifier,
    EntityMissing,
    EntityIsRedirect { target: String },
    SitelinkMissing,
    NotRedirect,
    StillRedirect,
    TargetMissing,
    TargetExists,
    TargetUnconnected,
    BadgeAlreadySet(BadgeKind),
    BadgeNotSet(BadgeKind),
    IncompatibleBadge(BadgeKind),
    ReportOnly,
    Remote(RemoteError),
}

impl SkipReason {
    /// Skips that point at a problem on the remote side rather than a stale snapshot.
    pub fn is_warning(&self) -> bool {
        match self {
            Self::Remote(error) => {
                error.class() != ErrorClass::Expected
                    || matches!(
                        error,
                        RemoteError::CircularRedirect { .. } | RemoteError::CrossSiteRedirect { .. }
                    )
            }
            _ => false,
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingIdentifier => f.write_str("record carries no item identifier"),
            Self::EntityMissing => f.write_str("item does not exist"),
            Self::EntityIsRedirect { target } => write!(f, "item is a redirect to {target}"),
            Self::SitelinkMissing => f.write_str("item has no sitelink to this project"),
            Self::NotRedirect => f.write_str("sitelinked page is not a redirect"),
            Self::StillRedirect => f.write_str("sitelinked page is still a redirect"),
            Self::TargetMissing => f.write_str("redirect target does not exist"),
            Self::TargetExists => f.write_str("redirect target exists"),
            Self::TargetUnconnected => f.write_str("redirect target is not connected to an item"),
            Self::BadgeAlreadySet(kind) => write!(f, "{kind} badge already set"),
            Self::BadgeNotSet(kind) => write!(f, "{kind} badge not set"),
            Self::IncompatibleBadge(kind) => write!(f, "incompatible {kind} badge present"),
            Self::ReportOnly => f.write_str("bucket is report-only"),
            Self::Remote(error) => write!(f, "{error}"),
        }
    }
}

/// Early exit from a record pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Halt {
    Skip(SkipReason),
    Fatal(String),
}

impl From<RemoteError> for Halt {
    fn from(error: RemoteError) -> Self {
        match error.class() {
            ErrorClass::Contract => Halt::Fatal(error.to_string()),
            ErrorClass::Expected | ErrorClass::External => Halt::Skip(SkipReason::Remote(error)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mutation {
    GrantBadge(BadgeKind),
    RevokeBadge(BadgeKind),
    RemoveSitelink,
}

impl fmt::Display for Mutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GrantBadge(kind) => write!(f, "grant {kind} badge"),
            Self::RevokeBadge(kind) => write!(f, "revoke {kind} badge"),
            Self::RemoveSitelink => f.write_str("remove sitelink"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Applied(Mutation),
    Simulated(Mutation),
    Skipped(SkipReason),
    Fatal(String),
}

/// Tally of one bucket on one project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BucketReport {
    pub site: String,
    pub bucket: ActionBucket,
    pub considered: usize,
    pub applied: usize,
    pub simulated: usize,
    pub skipped: usize,
    pub aborted: Option<String>,
}

impl BucketReport {
    fn new(site: &str, bucket: ActionBucket) -> Self {
        Self {
            site: site.to_string(),
            bucket,
            considered: 0,
            applied: 0,
            simulated: 0,
            skipped: 0,
            aborted: None,
        }
    }

    pub fn mutations(&self) -> usize {
        self.applied + self.simulated
    }
}

pub struct Reconciler<'a, A: RemoteApi> {
    api: &'a mut A,
    policy: &'a ReconcilePolicy,
}

impl<'a, A: RemoteApi> Reconciler<'a, A> {
    pub fn new(api: &'a mut A, policy: &'a ReconcilePolicy) -> Self {
        Self { api, policy }
    }

    /// Runs one action bucket of one project, record by record, in snapshot order.
    pub fn run_bucket(
        &mut self,
        site: &str,
        bucket: ActionBucket,
        records: &[&MasterRecord],
    ) -> BucketReport {
        let mut report = BucketReport::new(site, bucket);
        if bucket == ActionBucket::UnconnectedTarget {
            debug!(site, bucket = bucket.as_str(), "report-only bucket, nothing to reconcile");
            return report;
        }

        for (record, revoke) in plan_tasks(bucket, records) {
            report.considered += 1;
            let item = record.identifier().unwrap_or("-");
            let outcome = match self.reconcile_record(site, bucket, record, revoke) {
                Ok(outcome) => outcome,
                Err(Halt::Skip(reason)) => RecordOutcome::Skipped(reason),
                Err(Halt::Fatal(message)) => RecordOutcome::Fatal(message),
            };

            match outcome {
                RecordOutcome::Applied(mutation) => {
                    report.applied += 1;
                    info!(item, site, bucket = bucket.as_str(), simulated = false, "{mutation}");
                }
                RecordOutcome::Simulated(mutation) => {
                    report.simulated += 1;
                    info!(item, site, bucket = bucket.as_str(), simulated = true, "{mutation}");
                }
                RecordOutcome::Skipped(reason) => {
                    report.skipped += 1;
                    if reason.is_warning() {
                        warn!(item, site, bucket = bucket.as_str(), reason = %reason, "skipped");
                    } else {
                        info!(item, site, bucket = bucket.as_str(), reason = %reason, "skipped");
                    }
                }
                RecordOutcome::Fatal(message) => {
                    error!(
                        item,
                        site,
                        bucket = bucket.as_str(),
                        reason = %message,
                        "aborting bucket"
                    );
                    report.aborted = Some(message);
                    break;
                }
            }
        }
        report
    }

    fn reconcile_record(
        &mut self,
        site: &str,
        bucket: ActionBucket,
        record: &MasterRecord,
        revoke: Option<BadgeKind>,
    ) -> Result<RecordOutcome, Halt> {
        let identifier = record
            .identifier()
            .ok_or(Halt::Skip(SkipReason::MissingIdentifier))?;
        let entity = self.load_entity(identifier)?;
        let title = self.require_sitelink(site, record, &entity)?;

        match bucket {
            ActionBucket::MissingBadge => {
                self.expect_redirect(site, &title, true)?;
                self.expect_connected_target(site, &title)?;
                guard_grant(&entity, site, self.policy)?;
                self.commit(&entity, site, bucket, Mutation::GrantBadge(BadgeKind::SitelinkToRedirect))
            }
            ActionBucket::BothBadges => {
                self.expect_redirect(site, &title, true)?;
                self.expect_connected_target(site, &title)?;
                require_badge(&entity, site, self.policy, BadgeKind::IntentionalSitelinkToRedirect)?;
                require_badge(&entity, site, self.policy, BadgeKind::SitelinkToRedirect)?;
                self.commit(&entity, site, bucket, Mutation::RevokeBadge(BadgeKind::SitelinkToRedirect))
            }
            ActionBucket::NonRedirect => {
                let kind = revoke.ok_or_else(|| {
                    Halt::Fatal(format!("non-redirect task for {identifier} carries no badge"))
                })?;
                ensure_badge_kind(record, kind, self.policy)?;
                self.expect_redirect(site, &title, false)?;
                require_badge(&entity, site, self.policy, kind)?;
                self.commit(&entity, site, bucket, Mutation::RevokeBadge(kind))
            }
            ActionBucket::InexistentTarget => {
                self.expect_redirect(site, &title, true)?;
                self.expect_missing_target(site, &title)?;
                let length = self.api.content_length(site, &title)?;
                if length <= self.policy.redirect_length_cutoff {
                    self.commit(&entity, site, bucket, Mutation::RemoveSitelink)
                } else {
                    guard_grant(&entity, site, self.policy)?;
                    self.commit(&entity, site, bucket, Mutation::GrantBadge(BadgeKind::SitelinkToRedirect))
                }
            }
            ActionBucket::UnconnectedTarget => Err(Halt::Skip(SkipReason::ReportOnly)),
        }
    }

    fn load_entity(&mut self, identifier: &str) -> Result<Entity, Halt> {
        match self.api.resolve(identifier)? {
            EntityLookup::Found(entity) => Ok(entity),
            EntityLookup::Missing => Err(Halt::Skip(SkipReason::EntityMissing)),
            EntityLookup::Redirect { target } => {
                Err(Halt::Skip(SkipReason::EntityIsRedirect { target }))
            }
        }
    }

    /// Title of the item's sitelink to `site`; a missing sitelink asks the client wiki to
    /// refresh its cached item association for the local page.
    fn require_sitelink(
        &mut self,
        site: &str,
        record: &MasterRecord,
        entity: &Entity,
    ) -> Result<String, Halt> {
        if let Some(sitelink) = entity.sitelink(site) {
            return Ok(sitelink.title.clone());
        }

        if let Some(target) = refresh_target(record)
            && let Err(error) = self.api.request_refresh(site, &target)
        {
            warn!(item = entity.id.as_str(), site, reason = %error, "cache refresh failed");
        }
        Err(Halt::Skip(SkipReason::SitelinkMissing))
    }

    /// A deleted page is not a redirect, so it only satisfies `expected == false`.
    fn expect_redirect(&mut self, site: &str, title: &str, expected: bool) -> Result<(), Halt> {
        let is_redirect = match self.api.is_redirect(site, title) {
            Ok(is_redirect) => is_redirect,
            Err(RemoteError::PageMissing { .. }) if !expected => false,
            Err(error) => return Err(error.into()),
        };
        match (is_redirect, expected) {
            (true, true) | (false, false) => Ok(()),
            (false, true) => Err(Halt::Skip(SkipReason::NotRedirect)),
            (true, false) => Err(Halt::Skip(SkipReason::StillRedirect)),
        }
    }

    fn expect_connected_target(&mut self, site: &str, title: &str) -> Result<(), Halt> {
        let target = self.api.redirect_target(site, title)?;
        if !target.exists {
            return Err(Halt::Skip(SkipReason::TargetMissing));
        }
        match self.api.target_entity(site, &target.title)? {
            Some(_) => Ok(()),
            None => Err(Halt::Skip(SkipReason::TargetUnconnected)),
        }
    }

    fn expect_missing_target(&mut self, site: &str, title: &str) -> Result<(), Halt> {
        let target = self.api.redirect_target(site, title)?;
        if target.exists {
            return Err(Halt::Skip(SkipReason::TargetExists));
        }
        Ok(())
    }

    fn commit(
        &mut self,
        entity: &Entity,
        site: &str,
        bucket: ActionBucket,
        mutation: Mutation,
    ) -> Result<RecordOutcome, Halt> {
        let summary = edit_summary(bucket, mutation, site, self.policy);
        if self.policy.simulate {
            return Ok(RecordOutcome::Simulated(mutation));
        }

        match mutation {
            Mutation::GrantBadge(kind) => {
                let badge = self.policy.badges.id(kind).to_string();
                self.api.grant_badge(entity, site, &badge, &summary)?;
            }
            Mutation::RevokeBadge(kind) => {
                let badge = self.policy.badges.id(kind).to_string();
                self.api.revoke_badge(entity, site, &badge, &summary)?;
            }
            Mutation::RemoveSitelink => {
                self.api.remove_sitelink(entity, site, &summary)?;
            }
        }
        Ok(RecordOutcome::Applied(mutation))
    }
}

/// Records of a bucket paired with the badge a revocation targets. Non-redirect rows
/// are revoked kind by kind: every sitelink-to-redirect badge first, then every
/// intentional one.
fn plan_tasks<'r>(
    bucket: ActionBucket,
    records: &[&'r MasterRecord],
) -> Vec<(&'r MasterRecord, Option<BadgeKind>)> {
    if bucket != ActionBucket::NonRedirect {
        return records.iter().map(|record| (*record, None)).collect();
    }
    BadgeKind::ALL
        .into_iter()
        .flat_map(|kind| {
            records
                .iter()
                .filter(move |record| record.badge(kind).is_some())
                .map(move |record| (*record, Some(kind)))
        })
        .collect()
}

fn refresh_target(record: &MasterRecord) -> Option<RefreshTarget> {
    if let Some(fact) = &record.redirect {
        return Some(RefreshTarget::PageId(fact.redirect_id));
    }
    record
        .kind_a
        .as_ref()
        .or(record.kind_b.as_ref())
        .map(|tag| RefreshTarget::Title(tag.display_name.clone()))
}

fn sitelink_has(entity: &Entity, site: &str, policy: &ReconcilePolicy, kind: BadgeKind) -> bool {
    entity
        .sitelink(site)
        .is_some_and(|sitelink| sitelink.has_badge(policy.badges.id(kind)))
}

/// A sitelink gets the sitelink-to-redirect badge only while neither badge is present.
fn guard_grant(entity: &Entity, site: &str, policy: &ReconcilePolicy) -> Result<(), Halt> {
    let kind = BadgeKind::SitelinkToRedirect;
    if sitelink_has(entity, site, policy, kind) {
        return Err(Halt::Skip(SkipReason::BadgeAlreadySet(kind)));
    }
    if sitelink_has(entity, site, policy, kind.incompatible()) {
        return Err(Halt::Skip(SkipReason::IncompatibleBadge(kind.incompatible())));
    }
    Ok(())
}

fn require_badge(
    entity: &Entity,
    site: &str,
    policy: &ReconcilePolicy,
    kind: BadgeKind,
) -> Result<(), Halt> {
    if sitelink_has(entity, site, policy, kind) {
        Ok(())
    } else {
        Err(Halt::Skip(SkipReason::BadgeNotSet(kind)))
    }
}

/// The badge carried by a revocation task must be the configured badge of that kind.
fn ensure_badge_kind(
    record: &MasterRecord,
    kind: BadgeKind,
    policy: &ReconcilePolicy,
) -> Result<(), Halt> {
    let badge = record.badge(kind).map(|tag| tag.badge.as_str()).unwrap_or_default();
    if policy.badges.kind_of(badge) != Some(kind) {
        return Err(Halt::Fatal(format!(
            "refusing to revoke `{badge}` as a {kind} badge"
        )));
    }
    Ok(())
}

pub fn edit_summary(
    bucket: ActionBucket,
    mutation: Mutation,
    site: &str,
    policy: &ReconcilePolicy,
) -> String {
    let appendix = &policy.edit_summary_appendix;
    match mutation {
        Mutation::GrantBadge(kind) => format!(
            "add badge [[{}]] to {site} sitelink; see [[Wikidata:Sitelinks to redirects]] for details{appendix}",
            policy.badges.id(kind)
        ),
        Mutation::RevokeBadge(kind) if bucket == ActionBucket::BothBadges => format!(
            "remove badge [[{}]] from {site} sitelink; [[Wikidata:Sitelinks to redirects|sitelinks to redirect pages]] should not carry both sitelink badges{appendix}",
            policy.badges.id(kind)
        ),
        Mutation::RevokeBadge(kind) => format!(
            "remove badge [[{}]] from {site} sitelink; sitelink points to a non-redirect page{appendix}",
            policy.badges.id(kind)
        ),
        Mutation::RemoveSitelink => format!(
            "remove sitelink to redirect page with non-existent target page on client wiki{appendix}"
        ),
    }
}
