//! Status conditions computed during a DAG build.
//!
//! Every root object gets exactly one `Valid=True` condition or at least
//! one `Valid=False` condition with a reason from the closed set below.
//! Include-only HTTPProxies never reached from a valid root get
//! `Orphaned=True`.

use std::collections::BTreeMap;

use crate::cache::{Kind, ObjectKey};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TcpProxyErrorReason {
    NoServicesAndInclude,
    NothingDefined,
    TlsMustBeConfigured,
    UnresolvedServiceRef,
}

impl TcpProxyErrorReason {
    fn as_str(&self) -> &'static str {
        match self {
            TcpProxyErrorReason::NoServicesAndInclude => "NoServicesAndInclude",
            TcpProxyErrorReason::NothingDefined => "NothingDefined",
            TcpProxyErrorReason::TlsMustBeConfigured => "TLSMustBeConfigured",
            TcpProxyErrorReason::UnresolvedServiceRef => "UnresolvedServiceRef",
        }
    }
}

/// The closed set of reasons a root can be invalid.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Reason {
    Valid,
    Orphaned,
    FqdnNotSpecified,
    WildcardNotAllowed,
    DuplicateVhost,
    IncludeNotFound,
    IncludeCreatesCycle,
    RootIncludesRoot,
    DuplicateMatchConditions,
    PathMatchConditionsNotValid,
    HeaderMatchConditionsNotValid,
    ServiceUnresolvedReference,
    ServicePortInvalid,
    OnlyOneMirror,
    TlsConfigNotValid,
    TlsIncompatibleFeatures,
    DelegationNotPermitted,
    FallbackNotValid,
    FallbackNotPresent,
    TcpProxyError(TcpProxyErrorReason),
    TimeoutPolicyNotValid,
    RequestHeadersPolicyInvalid,
    ResponseHeadersPolicyInvalid,
    RootProxyNotAllowedInNamespace,
    NothingDefined,
}

impl Reason {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Reason::Valid => "Valid",
            Reason::Orphaned => "Orphaned",
            Reason::FqdnNotSpecified => "FQDNNotSpecified",
            Reason::WildcardNotAllowed => "WildcardNotAllowed",
            Reason::DuplicateVhost => "DuplicateVhost",
            Reason::IncludeNotFound => "IncludeNotFound",
            Reason::IncludeCreatesCycle => "IncludeCreatesCycle",
            Reason::RootIncludesRoot => "RootIncludesRoot",
            Reason::DuplicateMatchConditions => "DuplicateMatchConditions",
            Reason::PathMatchConditionsNotValid => "PathMatchConditionsNotValid",
            Reason::HeaderMatchConditionsNotValid => "HeaderMatchConditionsNotValid",
            Reason::ServiceUnresolvedReference => "ServiceUnresolvedReference",
            Reason::ServicePortInvalid => "ServicePortInvalid",
            Reason::OnlyOneMirror => "OnlyOneMirror",
            Reason::TlsConfigNotValid => "TLSConfigNotValid",
            Reason::TlsIncompatibleFeatures => "TLSIncompatibleFeatures",
            Reason::DelegationNotPermitted => "DelegationNotPermitted",
            Reason::FallbackNotValid => "FallbackNotValid",
            Reason::FallbackNotPresent => "FallbackNotPresent",
            Reason::TcpProxyError(_) => "TCPProxyError",
            Reason::TimeoutPolicyNotValid => "TimeoutPolicyNotValid",
            Reason::RequestHeadersPolicyInvalid => "RequestHeadersPolicyInvalid",
            Reason::ResponseHeadersPolicyInvalid => "ResponseHeadersPolicyInvalid",
            Reason::RootProxyNotAllowedInNamespace => "RootProxyNotAllowedInNamespace",
            Reason::NothingDefined => "NothingDefined",
        }
    }
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reason::TcpProxyError(sub) => write!(f, "TCPProxyError({})", sub.as_str()),
            _ => f.write_str(self.as_str()),
        }
    }
}

/// One condition as it will be written to the object's status.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Condition {
    /// "Valid" or "Orphaned".
    pub condition_type: &'static str,
    pub status: bool,
    pub reason: Reason,
    pub message: String,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct ObjectStatus {
    pub generation: i64,
    errors: Vec<(Reason, String)>,
    orphaned: bool,
}

impl ObjectStatus {
    pub(crate) fn is_valid(&self) -> bool {
        self.errors.is_empty() && !self.orphaned
    }

    pub(crate) fn errors(&self) -> &[(Reason, String)] {
        &self.errors
    }

    /// The conditions to write: one `Valid=True`, or a `Valid=False` per
    /// recorded error, or a single `Orphaned=True`.
    pub(crate) fn conditions(&self) -> Vec<Condition> {
        if self.orphaned {
            return vec![Condition {
                condition_type: "Orphaned",
                status: true,
                reason: Reason::Orphaned,
                message: "this object is not part of any root's include tree".to_string(),
            }];
        }
        if self.errors.is_empty() {
            return vec![Condition {
                condition_type: "Valid",
                status: true,
                reason: Reason::Valid,
                message: "valid configuration".to_string(),
            }];
        }
        self.errors
            .iter()
            .map(|(reason, message)| Condition {
                condition_type: "Valid",
                status: false,
                reason: *reason,
                message: message.clone(),
            })
            .collect()
    }
}

/// Per-object condition records for one build, keyed by kind and
/// `namespace/name`.
#[derive(Clone, Debug, Default)]
pub(crate) struct StatusMap {
    entries: BTreeMap<(&'static str, ObjectKey), ObjectStatus>,
}

fn kind_name(kind: Kind) -> &'static str {
    match kind {
        Kind::Service => "Service",
        Kind::Endpoints => "Endpoints",
        Kind::Secret => "Secret",
        Kind::Ingress => "Ingress",
        Kind::HTTPProxy => "HTTPProxy",
        Kind::TLSCertificateDelegation => "TLSCertificateDelegation",
        Kind::Gateway => "Gateway",
        Kind::HTTPRoute => "HTTPRoute",
    }
}

impl StatusMap {
    /// Register an object. Objects with no recorded errors are valid.
    pub(crate) fn register(&mut self, kind: Kind, key: ObjectKey, generation: i64) {
        self.entries
            .entry((kind_name(kind), key))
            .or_insert_with(|| ObjectStatus {
                generation,
                ..Default::default()
            });
    }

    pub(crate) fn record_error(
        &mut self,
        kind: Kind,
        key: ObjectKey,
        generation: i64,
        reason: Reason,
        message: impl Into<String>,
    ) {
        self.register(kind, key.clone(), generation);
        let entry = self
            .entries
            .get_mut(&(kind_name(kind), key))
            .expect("entry registered above");
        entry.orphaned = false;
        entry.errors.push((reason, message.into()));
    }

    /// Mark an object orphaned. An orphan that later turns out to be
    /// reachable (or invalid) keeps the stronger record.
    pub(crate) fn record_orphaned(&mut self, kind: Kind, key: ObjectKey, generation: i64) {
        self.register(kind, key.clone(), generation);
        let entry = self
            .entries
            .get_mut(&(kind_name(kind), key))
            .expect("entry registered above");
        if entry.errors.is_empty() {
            entry.orphaned = true;
        }
    }

    pub(crate) fn get(&self, kind: Kind, key: &ObjectKey) -> Option<&ObjectStatus> {
        // cloning the key for lookups would be wasteful, but the borrow
        // checker can't see through the tuple key. keep it simple.
        self.entries.get(&(kind_name(kind), key.clone()))
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&(&'static str, ObjectKey), &ObjectStatus)> {
        self.entries.iter()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
