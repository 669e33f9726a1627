//! Error classification and collection.
//!
//! The backend returns free-form error text, so classification walks an
//! ordered rule table over the lower-cased message; the first rule with a
//! matching marker wins. Callers only ever go through [`classify`].

use crate::resource::ResourceKind;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Closed taxonomy of per-resource failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    /// Schema configuration forbids the operation (inherited ownership, protected).
    SchemaConfigConflict,
    /// Record data does not match its schema.
    SchemaMismatch,
    /// A referenced schema or record does not exist (yet).
    Dependency,
    /// Authentication or permission failure.
    Auth,
    /// The backend throttled the request.
    RateLimit,
    /// Connection-level failure or cancellation.
    Network,
    /// The resource already exists.
    Conflict,
    /// Malformed or invalid payload.
    Validation,
    /// The resource itself was not found.
    NotFound,
    /// Anything else.
    Unknown,
}

impl ErrorCategory {
    /// Every category, in match priority order.
    pub const ALL: [ErrorCategory; 10] = [
        ErrorCategory::SchemaConfigConflict,
        ErrorCategory::SchemaMismatch,
        ErrorCategory::Dependency,
        ErrorCategory::Auth,
        ErrorCategory::RateLimit,
        ErrorCategory::Network,
        ErrorCategory::Conflict,
        ErrorCategory::Validation,
        ErrorCategory::NotFound,
        ErrorCategory::Unknown,
    ];

    /// Whether re-running may succeed without changing the input.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCategory::Dependency | ErrorCategory::RateLimit | ErrorCategory::Network
        )
    }

    /// Stable label used in reports.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorCategory::SchemaConfigConflict => "SCHEMA_CONFIG_CONFLICT",
            ErrorCategory::SchemaMismatch => "SCHEMA_MISMATCH",
            ErrorCategory::Dependency => "DEPENDENCY",
            ErrorCategory::Auth => "AUTH",
            ErrorCategory::RateLimit => "RATE_LIMIT",
            ErrorCategory::Network => "NETWORK",
            ErrorCategory::Conflict => "CONFLICT",
            ErrorCategory::Validation => "VALIDATION",
            ErrorCategory::NotFound => "NOT_FOUND",
            ErrorCategory::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Ordered classification rules. Order matters: "404 not found" must land in
/// `Dependency`, and "invalid credentials" in `Auth` rather than `Validation`.
const RULES: &[(ErrorCategory, &[&str])] = &[
    (
        ErrorCategory::SchemaConfigConflict,
        &[
            "inherited_ownership_enabled",
            "inherited ownership",
            "protected_resource",
            "protected resource",
            "protected_entity",
            "protected entity",
        ],
    ),
    (
        ErrorCategory::SchemaMismatch,
        &[
            "blueprint_schema_mismatch",
            "schema mismatch",
            "missing required property",
            "required property",
            "missing_property",
        ],
    ),
    (
        ErrorCategory::Dependency,
        &[
            "was not found",
            "not found",
            "does not exist",
            "missing blueprint",
            "target blueprint",
            "relation target",
            "invalid relation",
            "blueprint with identifier",
            "missing reference",
            "missing dependencies",
        ],
    ),
    (
        ErrorCategory::Auth,
        &[
            "unauthorized",
            "forbidden",
            "authentication failed",
            "invalid credentials",
            "invalid_credentials",
            "access denied",
            "permission denied",
            "401",
            "403",
        ],
    ),
    (
        ErrorCategory::RateLimit,
        &["rate limit", "too many requests", "throttle", "429"],
    ),
    (
        ErrorCategory::Network,
        &[
            "connection refused",
            "connection reset",
            "timeout",
            "timed out",
            "no such host",
            "network unreachable",
            "context canceled",
            "context deadline exceeded",
            "cancelled",
            "canceled",
            "eof",
        ],
    ),
    (
        ErrorCategory::Conflict,
        &["conflict", "already exists", "duplicate", "409"],
    ),
    (
        ErrorCategory::Validation,
        &[
            "validation",
            "invalid",
            "required field",
            "bad request",
            "malformed",
            "400",
        ],
    ),
    (ErrorCategory::NotFound, &["404"]),
];

/// Match error text against the rule table.
pub fn categorize(message: &str) -> ErrorCategory {
    let text = message.to_lowercase();
    RULES
        .iter()
        .find(|(_, markers)| markers.iter().any(|m| text.contains(m)))
        .map(|(category, _)| *category)
        .unwrap_or(ErrorCategory::Unknown)
}

/// Classify a raw failure for a resource.
pub fn classify(
    error: &dyn fmt::Display,
    kind: ResourceKind,
    resource_id: impl Into<String>,
) -> ImportError {
    let message = error.to_string();
    ImportError::new(categorize(&message), kind, resource_id, message)
}

/// A classified failure of one resource operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportError {
    category: ErrorCategory,
    kind: ResourceKind,
    resource_id: String,
    message: String,
    retryable: bool,
}

impl ImportError {
    /// Build an error of a known category.
    pub fn new(
        category: ErrorCategory,
        kind: ResourceKind,
        resource_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            kind,
            resource_id: resource_id.into(),
            message: message.into(),
            retryable: category.is_retryable(),
        }
    }

    /// Error category.
    pub fn category(&self) -> ErrorCategory {
        self.category
    }

    /// Kind of the failed resource.
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// Identity of the failed resource.
    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    /// Original error text.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether re-running may succeed.
    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

impl fmt::Display for ImportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.resource_id.is_empty() {
            write!(f, "[{}] {}: {}", self.category, self.kind, self.message)
        } else {
            write!(
                f,
                "[{}] {} {}: {}",
                self.category, self.kind, self.resource_id, self.message
            )
        }
    }
}

impl std::error::Error for ImportError {}

#[derive(Debug, Default)]
struct CollectorInner {
    errors: Vec<ImportError>,
    by_category: BTreeMap<ErrorCategory, Vec<usize>>,
    by_kind: BTreeMap<ResourceKind, Vec<usize>>,
}

impl CollectorInner {
    fn push(&mut self, error: ImportError) {
        let idx = self.errors.len();
        self.by_category.entry(error.category).or_default().push(idx);
        self.by_kind.entry(error.kind).or_default().push(idx);
        self.errors.push(error);
    }

    fn select(&self, indexes: Option<&Vec<usize>>) -> Vec<ImportError> {
        indexes
            .map(|idx| idx.iter().map(|i| self.errors[*i].clone()).collect())
            .unwrap_or_default()
    }
}

/// Thread-safe accumulator of [`ImportError`]s, indexed by category and kind.
#[derive(Debug, Default)]
pub struct ErrorCollector {
    inner: Mutex<CollectorInner>,
}

impl ErrorCollector {
    /// Create an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify and record a raw failure.
    pub fn record(&self, error: &dyn fmt::Display, kind: ResourceKind, resource_id: &str) {
        self.add(classify(error, kind, resource_id));
    }

    /// Record an already-classified error.
    pub fn add(&self, error: ImportError) {
        self.inner.lock().push(error);
    }

    /// Record many errors under one lock acquisition.
    pub fn extend(&self, errors: impl IntoIterator<Item = ImportError>) {
        let mut inner = self.inner.lock();
        for error in errors {
            inner.push(error);
        }
    }

    /// Whether anything was recorded.
    pub fn has_errors(&self) -> bool {
        !self.inner.lock().errors.is_empty()
    }

    /// Number of recorded errors.
    pub fn len(&self) -> usize {
        self.inner.lock().errors.len()
    }

    /// Whether nothing was recorded.
    pub fn is_empty(&self) -> bool {
        !self.has_errors()
    }

    /// Number of errors in a category.
    pub fn count_by_category(&self, category: ErrorCategory) -> usize {
        self.inner
            .lock()
            .by_category
            .get(&category)
            .map_or(0, Vec::len)
    }

    /// Errors in a category, in recording order.
    pub fn by_category(&self, category: ErrorCategory) -> Vec<ImportError> {
        let inner = self.inner.lock();
        inner.select(inner.by_category.get(&category))
    }

    /// Errors for a resource kind, in recording order.
    pub fn by_kind(&self, kind: ResourceKind) -> Vec<ImportError> {
        let inner = self.inner.lock();
        inner.select(inner.by_kind.get(&kind))
    }

    /// Errors worth retrying.
    pub fn retryable(&self) -> Vec<ImportError> {
        self.inner
            .lock()
            .errors
            .iter()
            .filter(|e| e.retryable)
            .cloned()
            .collect()
    }

    /// All errors, in recording order.
    pub fn all(&self) -> Vec<ImportError> {
        self.inner.lock().errors.clone()
    }

    /// Consume the collector.
    pub fn into_errors(self) -> Vec<ImportError> {
        self.inner.into_inner().errors
    }

    /// Flat `[CATEGORY] kind id: message` lines.
    pub fn to_strings(&self) -> Vec<String> {
        self.inner.lock().errors.iter().map(|e| e.to_string()).collect()
    }

    /// Remove everything.
    pub fn clear(&self) {
        *self.inner.lock() = CollectorInner::default();
    }

    /// Human summary: per category, a count plus up to `max_examples` examples.
    pub fn summary(&self, max_examples: usize) -> String {
        summarize(&self.inner.lock().errors, max_examples)
    }
}

/// Render a bounded summary for a list of errors.
pub fn summarize(errors: &[ImportError], max_examples: usize) -> String {
    use std::fmt::Write;

    if errors.is_empty() {
        return "No errors".to_string();
    }

    let mut out = String::new();
    let _ = writeln!(out, "Total errors: {}\n", errors.len());

    for category in ErrorCategory::ALL {
        let in_category: Vec<&ImportError> =
            errors.iter().filter(|e| e.category == category).collect();
        if in_category.is_empty() {
            continue;
        }

        let hint = if category.is_retryable() { ", retryable" } else { "" };
        let _ = writeln!(out, "{} ({}{}):", category, in_category.len(), hint);

        for e in in_category.iter().take(max_examples) {
            let _ = writeln!(
                out,
                "  - {} {}: {}",
                e.kind,
                e.resource_id,
                truncate(&e.message, 100)
            );
        }
        if in_category.len() > max_examples {
            let _ = writeln!(out, "  ... and {} more", in_category.len() - max_examples);
        }
        out.push('\n');
    }

    out
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let kept: String = s.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{}...", kept)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiError;
    use std::sync::Arc;

    #[test]
    fn test_classification_table() {
        let cases = [
            (
                r#"{"error":"inherited_ownership_enabled"}"#,
                ErrorCategory::SchemaConfigConflict,
                false,
            ),
            ("protected entity violation", ErrorCategory::SchemaConfigConflict, false),
            (
                "entity is missing required property 'owner'",
                ErrorCategory::SchemaMismatch,
                false,
            ),
            ("target blueprint 'service' was not found", ErrorCategory::Dependency, true),
            ("relation target does not exist", ErrorCategory::Dependency, true),
            ("status 401: unauthorized", ErrorCategory::Auth, false),
            ("status 403: forbidden", ErrorCategory::Auth, false),
            ("invalid credentials supplied", ErrorCategory::Auth, false),
            ("status 429: too many requests", ErrorCategory::RateLimit, true),
            ("request was throttled", ErrorCategory::RateLimit, true),
            ("dial tcp: connection refused", ErrorCategory::Network, true),
            ("i/o timeout", ErrorCategory::Network, true),
            ("context canceled", ErrorCategory::Network, true),
            ("status 409: identifier already exists", ErrorCategory::Conflict, false),
            ("status 400: malformed payload", ErrorCategory::Validation, false),
            ("required field 'title'", ErrorCategory::Validation, false),
            ("status 404", ErrorCategory::NotFound, false),
            ("the backend is sad", ErrorCategory::Unknown, false),
        ];

        for (message, category, retryable) in cases {
            let err = classify(&ApiError::message(message), ResourceKind::Blueprint, "x");
            assert_eq!(err.category(), category, "message: {}", message);
            assert_eq!(err.is_retryable(), retryable, "message: {}", message);
            assert_eq!(err.message(), message);
        }
    }

    #[test]
    fn test_priority_not_found_beats_404() {
        assert_eq!(categorize("404 Not Found"), ErrorCategory::Dependency);
    }

    #[test]
    fn test_import_error_display() {
        let err = ImportError::new(ErrorCategory::Conflict, ResourceKind::Team, "core", "exists");
        assert_eq!(err.to_string(), "[CONFLICT] team core: exists");

        let anon = ImportError::new(ErrorCategory::Unknown, ResourceKind::Page, "", "boom");
        assert_eq!(anon.to_string(), "[UNKNOWN] page: boom");
    }

    #[test]
    fn test_collector_indexes() {
        let collector = ErrorCollector::new();
        collector.record(&"status 429", ResourceKind::Entity, "svc:a");
        collector.record(&"status 400: bad", ResourceKind::Entity, "svc:b");
        collector.record(&"status 429", ResourceKind::Blueprint, "svc");

        assert_eq!(collector.len(), 3);
        assert_eq!(collector.count_by_category(ErrorCategory::RateLimit), 2);
        assert_eq!(collector.by_kind(ResourceKind::Entity).len(), 2);
        assert_eq!(collector.retryable().len(), 2);
        assert_eq!(
            collector.to_strings()[1],
            "[VALIDATION] entity svc:b: status 400: bad"
        );

        collector.clear();
        assert!(!collector.has_errors());
    }

    #[test]
    fn test_summary_is_bounded() {
        let collector = ErrorCollector::new();
        for i in 0..7 {
            collector.record(&"connection reset", ResourceKind::Entity, &format!("e{}", i));
        }
        collector.record(&"x".repeat(150), ResourceKind::Page, "long");

        let summary = collector.summary(2);
        assert!(summary.starts_with("Total errors: 8"));
        assert!(summary.contains("NETWORK (7, retryable):"));
        assert!(summary.contains("  ... and 5 more"));
        assert!(summary.contains(&format!("{}...", "x".repeat(97))));
        assert_eq!(ErrorCollector::new().summary(3), "No errors");
    }

    #[test]
    fn test_concurrent_writers() {
        let collector = Arc::new(ErrorCollector::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let collector = Arc::clone(&collector);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        collector.record(&"timeout", ResourceKind::Entity, &format!("{}-{}", t, i));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(collector.len(), 400);
        assert_eq!(collector.count_by_category(ErrorCategory::Network), 400);
    }
}
