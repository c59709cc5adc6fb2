use std::fmt;

use serde::Serialize;

use crate::model::MasterRecord;

/// The nine analytical partitions of a project's master records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Bucket {
    AllRedirects,
    InexistentTarget,
    UnconnectedTarget,
    AnyBadge,
    SitelinkToRedirectBadge,
    IntentionalBadge,
    WithoutBadge,
    BothBadges,
    NonRedirectWithBadge,
}

impl Bucket {
    /// Statistics column order.
    pub const ALL: [Bucket; 9] = [
        Bucket::AllRedirects,
        Bucket::InexistentTarget,
        Bucket::UnconnectedTarget,
        Bucket::AnyBadge,
        Bucket::SitelinkToRedirectBadge,
        Bucket::IntentionalBadge,
        Bucket::WithoutBadge,
        Bucket::BothBadges,
        Bucket::NonRedirectWithBadge,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::AllRedirects => "all_redirects",
            Self::InexistentTarget => "inexistent_target",
            Self::UnconnectedTarget => "unconnected_target",
            Self::AnyBadge => "any_badge",
            Self::SitelinkToRedirectBadge => "s2r_badge",
            Self::IntentionalBadge => "i2r_badge",
            Self::WithoutBadge => "without_badge",
            Self::BothBadges => "both_badges",
            Self::NonRedirectWithBadge => "non_redirect_with_badge",
        }
    }

    fn index(self) -> usize {
        match self {
            Self::AllRedirects => 0,
            Self::InexistentTarget => 1,
            Self::UnconnectedTarget => 2,
            Self::AnyBadge => 3,
            Self::SitelinkToRedirectBadge => 4,
            Self::IntentionalBadge => 5,
            Self::WithoutBadge => 6,
            Self::BothBadges => 7,
            Self::NonRedirectWithBadge => 8,
        }
    }

    pub fn contains(self, record: &MasterRecord) -> bool {
        let redirect = record.has_redirect();
        let any_badge = record.has_kind_a() || record.has_kind_b();
        match self {
            Self::AllRedirects => redirect,
            Self::InexistentTarget => redirect && !record.has_target(),
            Self::UnconnectedTarget => {
                redirect && record.has_target() && !record.target_connected()
            }
            Self::AnyBadge => redirect && any_badge,
            Self::SitelinkToRedirectBadge => redirect && record.has_kind_a(),
            Self::IntentionalBadge => redirect && record.has_kind_b(),
            Self::WithoutBadge => redirect && !any_badge,
            Self::BothBadges => redirect && record.has_kind_a() && record.has_kind_b(),
            Self::NonRedirectWithBadge => !redirect && any_badge,
        }
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Buckets that drive a remote mutation or a report entry. Every record belongs to at most one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionBucket {
    MissingBadge,
    BothBadges,
    NonRedirect,
    InexistentTarget,
    UnconnectedTarget,
}

impl ActionBucket {
    /// Processing order within one project.
    pub const ALL: [ActionBucket; 5] = [
        ActionBucket::MissingBadge,
        ActionBucket::BothBadges,
        ActionBucket::NonRedirect,
        ActionBucket::InexistentTarget,
        ActionBucket::UnconnectedTarget,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingBadge => "missing_badge",
            Self::BothBadges => "both_badges",
            Self::NonRedirect => "non_redirects",
            Self::InexistentTarget => "inexistent_targets",
            Self::UnconnectedTarget => "unconnected_targets",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let normalized = value.trim().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|bucket| bucket.as_str() == normalized)
    }

    pub fn of(record: &MasterRecord) -> Option<Self> {
        let any_badge = record.has_kind_a() || record.has_kind_b();
        if !record.has_redirect() {
            return any_badge.then_some(Self::NonRedirect);
        }
        if !record.has_target() {
            return (!record.has_interwiki_target()).then_some(Self::InexistentTarget);
        }
        if !record.target_connected() {
            return Some(Self::UnconnectedTarget);
        }
        match (record.has_kind_a(), record.has_kind_b()) {
            (false, false) => Some(Self::MissingBadge),
            (true, true) => Some(Self::BothBadges),
            _ => None,
        }
    }
}

impl fmt::Display for ActionBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-project counts of the nine buckets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProjectStats {
    pub all_redirects: usize,
    pub inexistent_target: usize,
    pub unconnected_target: usize,
    pub any_badge: usize,
    pub s2r_badge: usize,
    pub i2r_badge: usize,
    pub without_badge: usize,
    pub both_badges: usize,
    pub non_redirect_with_badge: usize,
}

impl ProjectStats {
    pub fn get(&self, bucket: Bucket) -> usize {
        match bucket {
            Bucket::AllRedirects => self.all_redirects,
            Bucket::InexistentTarget => self.inexistent_target,
            Bucket::UnconnectedTarget => self.unconnected_target,
            Bucket::AnyBadge => self.any_badge,
            Bucket::SitelinkToRedirectBadge => self.s2r_badge,
            Bucket::IntentionalBadge => self.i2r_badge,
            Bucket::WithoutBadge => self.without_badge,
            Bucket::BothBadges => self.both_badges,
            Bucket::NonRedirectWithBadge => self.non_redirect_with_badge,
        }
    }

    pub fn summary_line(&self, db_name: &str) -> String {
        format!(
            "{db_name: <20}: {:6} redirects; {:6} w/ any badge; {:6} w/ s2r badge; {:6} w/ i2r badge; {:6} w/o badge; {:6} w/ both badges; {:6} non-redirects w/ any badge; {:6} w/ inexistent target; {:6} w/ unconnected target",
            self.all_redirects,
            self.any_badge,
            self.s2r_badge,
            self.i2r_badge,
            self.without_badge,
            self.both_badges,
            self.non_redirect_with_badge,
            self.inexistent_target,
            self.unconnected_target,
        )
    }
}

/// Bucket membership computed once over one snapshot of master records.
///
/// The set borrows the snapshot, so every bucket of a project is evaluated against
/// exactly the same rows.
#[derive(Debug)]
pub struct BucketSet<'a> {
    records: &'a [MasterRecord],
    members: [Vec<usize>; 9],
}

impl<'a> BucketSet<'a> {
    pub fn classify(records: &'a [MasterRecord]) -> Self {
        let mut members: [Vec<usize>; 9] = Default::default();
        for (index, record) in records.iter().enumerate() {
            for bucket in Bucket::ALL {
                if bucket.contains(record) {
                    members[bucket.index()].push(index);
                }
            }
        }
        Self { records, members }
    }

    pub fn records(&self) -> &'a [MasterRecord] {
        self.records
    }

    pub fn count(&self, bucket: Bucket) -> usize {
        self.members[bucket.index()].len()
    }

    pub fn members(&self, bucket: Bucket) -> Vec<&'a MasterRecord> {
        self.members[bucket.index()]
            .iter()
            .map(|&index| &self.records[index])
            .collect()
    }

    pub fn actionable(&self, action: ActionBucket) -> Vec<&'a MasterRecord> {
        self.records
            .iter()
            .filter(|record| ActionBucket::of(record) == Some(action))
            .collect()
    }

    pub fn stats(&self) -> ProjectStats {
        ProjectStats {
            all_redirects: self.count(Bucket::AllRedirects),
            inexistent_target: self.count(Bucket::InexistentTarget),
            unconnected_target: self.count(Bucket::UnconnectedTarget),
            any_badge: self.count(Bucket::AnyBadge),
            s2r_badge: self.count(Bucket::SitelinkToRedirectBadge),
            i2r_badge: self.count(Bucket::IntentionalBadge),
            without_badge: self.count(Bucket::WithoutBadge),
            both_badges: self.count(Bucket::BothBadges),
            non_redirect_with_badge: self.count(Bucket::NonRedirectWithBadge),
        }
    }
}
