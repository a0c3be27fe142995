//! Identity mapping: resolve source users to target users via ordered
//! matching rules.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::MatchRule;

/// Maximum unresolved identifiers included in the coverage report.
pub const UNRESOLVED_SAMPLE_LIMIT: usize = 20;

/// A user row observed in the staged source snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceUser {
    pub id: i64,
    pub email: Option<String>,
    pub user_name: Option<String>,
    pub employee_number: Option<String>,
}

/// A user row in the target environment's identity inventory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetUser {
    pub id: i64,
    pub email: Option<String>,
    pub user_name: Option<String>,
    pub employee_number: Option<String>,
}

/// One resolved source identity -> target identity pair, with provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMappingEntry {
    pub source_user_id: i64,
    pub source_email: Option<String>,
    pub source_user_name: Option<String>,
    pub source_employee_number: Option<String>,
    pub target_user_id: i64,
    pub match_reason: String,
}

/// Operator-facing summary of mapping quality.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserMapReport {
    /// Distinct source users considered.
    pub total_source_users: usize,

    /// Match counts grouped by match reason.
    pub matched_by_reason: BTreeMap<String, usize>,

    /// Source users no rule could resolve.
    pub unresolved_count: usize,

    /// Bounded sample of unresolved identifiers (redacted unless PII is
    /// explicitly included).
    pub unresolved_sample: Vec<String>,
}

impl UserMapReport {
    /// Total resolved users across all reasons.
    pub fn resolved_count(&self) -> usize {
        self.matched_by_reason.values().sum()
    }
}

/// One-way redaction for identifiers surfaced in reports and logs.
///
/// Kept out of the rewrite path; only reporting uses it.
pub fn redact(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("sha256:{}", &digest[..16])
}

/// Normalize an email for fuzzy matching: trim, lowercase, strip a
/// `+suffix` from the local part.
fn normalize_email(email: &str) -> String {
    let email = email.trim().to_lowercase();
    match email.split_once('@') {
        Some((local, domain)) => {
            let local = local.split('+').next().unwrap_or(local);
            format!("{}@{}", local, domain)
        }
        None => email,
    }
}

struct TargetIndex {
    by_email: HashMap<String, i64>,
    by_normalized_email: HashMap<String, i64>,
    by_user_name: HashMap<String, i64>,
    by_employee_number: HashMap<String, i64>,
}

impl TargetIndex {
    fn build(targets: &[TargetUser]) -> Self {
        let mut by_email = HashMap::new();
        let mut by_normalized_email = HashMap::new();
        let mut by_user_name = HashMap::new();
        let mut by_employee_number = HashMap::new();

        for user in targets {
            if let Some(email) = user.email.as_deref().filter(|e| !e.trim().is_empty()) {
                by_email
                    .entry(email.trim().to_lowercase())
                    .or_insert(user.id);
                by_normalized_email
                    .entry(normalize_email(email))
                    .or_insert(user.id);
            }
            if let Some(name) = user.user_name.as_deref().filter(|n| !n.trim().is_empty()) {
                by_user_name.entry(name.trim().to_lowercase()).or_insert(user.id);
            }
            if let Some(emp) = user
                .employee_number
                .as_deref()
                .filter(|e| !e.trim().is_empty())
            {
                by_employee_number.entry(emp.trim().to_string()).or_insert(user.id);
            }
        }

        Self {
            by_email,
            by_normalized_email,
            by_user_name,
            by_employee_number,
        }
    }

    fn apply(&self, rule: MatchRule, source: &SourceUser, fallback: Option<i64>) -> Option<i64> {
        match rule {
            MatchRule::Email => source
                .email
                .as_deref()
                .filter(|e| !e.trim().is_empty())
                .and_then(|e| self.by_email.get(&e.trim().to_lowercase()).copied()),
            MatchRule::NormalizeEmail => source
                .email
                .as_deref()
                .filter(|e| !e.trim().is_empty())
                .and_then(|e| self.by_normalized_email.get(&normalize_email(e)).copied()),
            MatchRule::UserName => source
                .user_name
                .as_deref()
                .filter(|n| !n.trim().is_empty())
                .and_then(|n| self.by_user_name.get(&n.trim().to_lowercase()).copied()),
            MatchRule::EmployeeNumber => source
                .employee_number
                .as_deref()
                .filter(|e| !e.trim().is_empty())
                .and_then(|e| self.by_employee_number.get(e.trim()).copied()),
            MatchRule::Fallback => fallback,
        }
    }
}

/// Resolve every source user against the target inventory.
///
/// Rules run in the order given; the first rule yielding a candidate wins
/// and its name becomes the match reason. Unresolved users are counted and
/// sampled (redacted unless `include_pii`), never dropped silently.
pub fn build_user_map(
    sources: &[SourceUser],
    targets: &[TargetUser],
    rules: &[MatchRule],
    fallback_user_id: Option<i64>,
    include_pii: bool,
) -> (Vec<UserMappingEntry>, UserMapReport) {
    let index = TargetIndex::build(targets);
    let mut entries = Vec::with_capacity(sources.len());
    let mut report = UserMapReport {
        total_source_users: sources.len(),
        ..Default::default()
    };

    for source in sources {
        let resolved = rules.iter().find_map(|rule| {
            index
                .apply(*rule, source, fallback_user_id)
                .map(|target_id| (*rule, target_id))
        });

        match resolved {
            Some((rule, target_user_id)) => {
                *report
                    .matched_by_reason
                    .entry(rule.reason().to_string())
                    .or_insert(0) += 1;
                entries.push(UserMappingEntry {
                    source_user_id: source.id,
                    source_email: source.email.clone(),
                    source_user_name: source.user_name.clone(),
                    source_employee_number: source.employee_number.clone(),
                    target_user_id,
                    match_reason: rule.reason().to_string(),
                });
            }
            None => {
                report.unresolved_count += 1;
                if report.unresolved_sample.len() < UNRESOLVED_SAMPLE_LIMIT {
                    let identifier = source
                        .email
                        .clone()
                        .or_else(|| source.user_name.clone())
                        .unwrap_or_else(|| source.id.to_string());
                    let identifier = if include_pii {
                        identifier
                    } else {
                        redact(&identifier)
                    };
                    report.unresolved_sample.push(identifier);
                }
            }
        }
    }

    if report.unresolved_count > 0 {
        warn!(
            unresolved = report.unresolved_count,
            total = report.total_source_users,
            "some source users could not be mapped"
        );
    }
    debug!(
        resolved = report.resolved_count(),
        total = report.total_source_users,
        "built user map"
    );

    (entries, report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(id: i64, email: Option<&str>, name: Option<&str>, emp: Option<&str>) -> SourceUser {
        SourceUser {
            id,
            email: email.map(String::from),
            user_name: name.map(String::from),
            employee_number: emp.map(String::from),
        }
    }

    fn target(id: i64, email: Option<&str>, name: Option<&str>, emp: Option<&str>) -> TargetUser {
        TargetUser {
            id,
            email: email.map(String::from),
            user_name: name.map(String::from),
            employee_number: emp.map(String::from),
        }
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let sources = vec![source(1, Some("amy@corp.com"), Some("amy"), None)];
        let targets = vec![
            target(101, Some("amy@corp.com"), None, None),
            target(102, None, Some("amy"), None),
        ];

        let (map, report) = build_user_map(
            &sources,
            &targets,
            &[MatchRule::Email, MatchRule::UserName],
            None,
            false,
        );

        assert_eq!(map.len(), 1);
        assert_eq!(map[0].target_user_id, 101);
        assert_eq!(map[0].match_reason, "Email");
        assert_eq!(report.matched_by_reason.get("Email"), Some(&1));
    }

    #[test]
    fn test_rule_order_is_respected() {
        let sources = vec![source(1, Some("amy@corp.com"), Some("amy"), None)];
        let targets = vec![
            target(101, Some("amy@corp.com"), None, None),
            target(102, None, Some("amy"), None),
        ];

        let (map, _) = build_user_map(
            &sources,
            &targets,
            &[MatchRule::UserName, MatchRule::Email],
            None,
            false,
        );

        assert_eq!(map[0].target_user_id, 102);
        assert_eq!(map[0].match_reason, "UserName");
    }

    #[test]
    fn test_normalized_email_match() {
        let sources = vec![source(1, Some("Amy+ops@Corp.com "), None, None)];
        let targets = vec![target(101, Some("amy@corp.com"), None, None)];

        let (map, _) = build_user_map(&sources, &targets, &[MatchRule::NormalizeEmail], None, false);
        assert_eq!(map[0].target_user_id, 101);
        assert_eq!(map[0].match_reason, "NormalizeEmail");
    }

    #[test]
    fn test_employee_number_match() {
        let sources = vec![source(1, None, None, Some(" E042 "))];
        let targets = vec![target(77, None, None, Some("E042"))];

        let (map, _) = build_user_map(&sources, &targets, &[MatchRule::EmployeeNumber], None, false);
        assert_eq!(map[0].target_user_id, 77);
    }

    #[test]
    fn test_fallback_catches_everything() {
        let sources = vec![source(1, Some("gone@corp.com"), None, None)];
        let targets: Vec<TargetUser> = vec![];

        let (map, report) = build_user_map(
            &sources,
            &targets,
            &[MatchRule::Email, MatchRule::Fallback],
            Some(999),
            false,
        );

        assert_eq!(map[0].target_user_id, 999);
        assert_eq!(map[0].match_reason, "Fallback");
        assert_eq!(report.unresolved_count, 0);
    }

    #[test]
    fn test_unresolved_sample_is_redacted_by_default() {
        let sources = vec![source(1, Some("gone@corp.com"), None, None)];
        let (map, report) = build_user_map(&sources, &[], &[MatchRule::Email], None, false);

        assert!(map.is_empty());
        assert_eq!(report.unresolved_count, 1);
        assert_eq!(report.unresolved_sample.len(), 1);
        assert!(report.unresolved_sample[0].starts_with("sha256:"));
        assert!(!report.unresolved_sample[0].contains("gone@corp.com"));
    }

    #[test]
    fn test_unresolved_sample_keeps_pii_when_asked() {
        let sources = vec![source(1, Some("gone@corp.com"), None, None)];
        let (_, report) = build_user_map(&sources, &[], &[MatchRule::Email], None, true);
        assert_eq!(report.unresolved_sample[0], "gone@corp.com");
    }

    #[test]
    fn test_unresolved_sample_is_bounded() {
        let sources: Vec<SourceUser> = (0..100)
            .map(|i| source(i, Some(&format!("u{}@gone.com", i)), None, None))
            .collect();
        let (_, report) = build_user_map(&sources, &[], &[MatchRule::Email], None, false);

        assert_eq!(report.unresolved_count, 100);
        assert_eq!(report.unresolved_sample.len(), UNRESOLVED_SAMPLE_LIMIT);
    }

    #[test]
    fn test_redact_is_deterministic_and_one_way() {
        let a = redact("amy@corp.com");
        let b = redact("amy@corp.com");
        assert_eq!(a, b);
        assert_ne!(a, redact("bob@corp.com"));
        assert!(!a.contains("amy"));
    }

    #[test]
    fn test_blank_attributes_never_match() {
        // An empty email on both sides must not pair users up.
        let sources = vec![source(1, Some(""), None, None)];
        let targets = vec![target(101, Some(""), None, None)];

        let (map, report) = build_user_map(&sources, &targets, &[MatchRule::Email], None, false);
        assert!(map.is_empty());
        assert_eq!(report.unresolved_count, 1);
    }
}
