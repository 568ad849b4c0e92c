//! Compliance frameworks and their declarative profiles
//!
//! Every framework-dependent decision (retention, enrichment tags, report
//! sections) is a lookup into `PROFILES`. Call sites never branch on the
//! framework themselves.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Metadata value written when a framework tag was not supplied by the caller
pub const UNSPECIFIED: &str = "unspecified";

/// A named regulatory or control regime
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ComplianceFramework {
    /// Health-data framework
    Hipaa,
    /// Financial security-controls framework
    Sox,
    /// Privacy framework
    Gdpr,
    /// Service-organization security controls
    Soc2,
    /// Development / default
    General,
    /// Anything this build does not know; enrichment runs in core-only mode
    Custom(String),
}

impl ComplianceFramework {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Hipaa => "hipaa",
            Self::Sox => "sox",
            Self::Gdpr => "gdpr",
            Self::Soc2 => "soc2",
            Self::General => "general",
            Self::Custom(name) => name,
        }
    }

    /// Declarative profile for this framework, `None` for custom frameworks
    pub fn profile(&self) -> Option<&'static FrameworkProfile> {
        PROFILES.iter().find(|p| p.name == self.as_str())
    }

    /// Retention policy, falling back to the general policy for custom frameworks
    pub fn retention_policy(&self) -> RetentionPolicy {
        match self.profile() {
            Some(profile) => profile.retention(),
            None => RetentionPolicy {
                framework: self.as_str().to_string(),
                retention_days: GENERAL_RETENTION_DAYS,
            },
        }
    }

    /// The longest retention window of any known framework
    pub fn max_retention_days() -> u32 {
        PROFILES
            .iter()
            .map(|p| p.retention_days)
            .max()
            .unwrap_or(GENERAL_RETENTION_DAYS)
    }

    pub fn known() -> impl Iterator<Item = ComplianceFramework> {
        PROFILES.iter().map(|p| ComplianceFramework::from(p.name))
    }
}

impl From<String> for ComplianceFramework {
    fn from(value: String) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "hipaa" => Self::Hipaa,
            "sox" => Self::Sox,
            "gdpr" => Self::Gdpr,
            "soc2" => Self::Soc2,
            "general" => Self::General,
            _ => Self::Custom(value),
        }
    }
}

impl From<&str> for ComplianceFramework {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<ComplianceFramework> for String {
    fn from(value: ComplianceFramework) -> Self {
        value.as_str().to_string()
    }
}

impl FromStr for ComplianceFramework {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from(s))
    }
}

impl fmt::Display for ComplianceFramework {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How long records governed by a framework must be kept
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionPolicy {
    pub framework: String,
    pub retention_days: u32,
}

impl RetentionPolicy {
    pub fn duration(&self) -> Duration {
        Duration::days(i64::from(self.retention_days))
    }

    /// When a record created at `created` may leave retention
    pub fn expires_at(&self, created: DateTime<Utc>) -> DateTime<Utc> {
        created + self.duration()
    }

    pub fn is_expired(&self, created: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now >= self.expires_at(created)
    }
}

/// Aggregate a compliance report computes for its framework
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportSection {
    /// Per-justification counts of access events
    AccessJustifications,
    /// Change-ticket coverage and actor separation for mutations
    SecurityControls,
    /// Per-lawful-basis counts
    LawfulBasis,
    /// Access reviews by actor
    AccessReview,
}

/// Static description of one framework
#[derive(Debug)]
pub struct FrameworkProfile {
    pub name: &'static str,
    pub retention_days: u32,
    /// Constant tags written on every record
    pub static_fields: &'static [(&'static str, &'static str)],
    /// (record field, event metadata key) pairs copied from caller metadata
    pub metadata_fields: &'static [(&'static str, &'static str)],
    pub report_sections: &'static [ReportSection],
}

impl FrameworkProfile {
    pub fn retention(&self) -> RetentionPolicy {
        RetentionPolicy {
            framework: self.name.to_string(),
            retention_days: self.retention_days,
        }
    }
}

const GENERAL_RETENTION_DAYS: u32 = 90;

static PROFILES: &[FrameworkProfile] = &[
    FrameworkProfile {
        name: "hipaa",
        retention_days: 6 * 365,
        static_fields: &[
            ("retention_policy", "hipaa-6y"),
            ("control_category", "administrative-safeguard"),
            ("phi_audit", "true"),
        ],
        metadata_fields: &[("access_justification", "justification")],
        report_sections: &[ReportSection::AccessJustifications, ReportSection::AccessReview],
    },
    FrameworkProfile {
        name: "sox",
        retention_days: 7 * 365,
        static_fields: &[
            ("retention_policy", "sox-7y"),
            ("control_category", "itgc-change-management"),
        ],
        metadata_fields: &[
            ("change_ticket", "change_ticket"),
            ("approver", "approver"),
        ],
        report_sections: &[ReportSection::SecurityControls],
    },
    FrameworkProfile {
        name: "gdpr",
        retention_days: 3 * 365,
        static_fields: &[
            ("retention_policy", "gdpr-3y"),
            ("control_category", "processing-record"),
        ],
        metadata_fields: &[
            ("legal_basis", "legal_basis"),
            ("processing_purpose", "purpose"),
        ],
        report_sections: &[ReportSection::LawfulBasis, ReportSection::AccessReview],
    },
    FrameworkProfile {
        name: "soc2",
        retention_days: 365,
        static_fields: &[
            ("retention_policy", "soc2-1y"),
            ("control_category", "cc6-logical-access"),
        ],
        metadata_fields: &[("change_ticket", "change_ticket")],
        report_sections: &[ReportSection::SecurityControls, ReportSection::AccessReview],
    },
    FrameworkProfile {
        name: "general",
        retention_days: GENERAL_RETENTION_DAYS,
        static_fields: &[("retention_policy", "general-90d")],
        metadata_fields: &[],
        report_sections: &[],
    },
];
