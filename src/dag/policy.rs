//! Parsing and validation of the policy blocks attached to routes and
//! virtual hosts.

use std::time::Duration;

use crate::apis;
use crate::dag::Reason;

#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub(crate) struct PolicyError {
    pub reason: Reason,
    pub message: String,
}

fn policy_error(reason: Reason, message: impl Into<String>) -> PolicyError {
    PolicyError {
        reason,
        message: message.into(),
    }
}

/// A timeout setting. `Default` defers to the proxy's own default,
/// `Disabled` turns the timeout off explicitly.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) enum Timeout {
    #[default]
    Default,
    Disabled,
    Duration(Duration),
}

impl Timeout {
    /// Parse an operator-facing timeout string. Empty means "use the
    /// default", the literal "infinity" disables the timeout.
    pub(crate) fn parse(s: &str) -> Result<Timeout, PolicyError> {
        match s {
            "" => Ok(Timeout::Default),
            "infinity" => Ok(Timeout::Disabled),
            s => humantime::parse_duration(s)
                .map(Timeout::Duration)
                .map_err(|err| {
                    policy_error(
                        Reason::TimeoutPolicyNotValid,
                        format!("invalid duration {s:?}: {err}"),
                    )
                }),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct TimeoutPolicy {
    pub response: Timeout,
    pub idle: Timeout,
}

impl TimeoutPolicy {
    pub(crate) fn parse(policy: Option<&apis::TimeoutPolicy>) -> Result<Self, PolicyError> {
        let Some(policy) = policy else {
            return Ok(TimeoutPolicy::default());
        };
        Ok(TimeoutPolicy {
            response: Timeout::parse(policy.response.as_deref().unwrap_or(""))?,
            idle: Timeout::parse(policy.idle.as_deref().unwrap_or(""))?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct RetryPolicy {
    pub count: u32,
    pub per_try_timeout: Option<Duration>,
}

impl RetryPolicy {
    pub(crate) fn parse(policy: Option<&apis::RetryPolicy>) -> Result<Option<Self>, PolicyError> {
        let Some(policy) = policy else { return Ok(None) };

        let per_try_timeout = match policy.per_try_timeout.as_deref() {
            None | Some("") => None,
            Some(s) => Some(humantime::parse_duration(s).map_err(|err| {
                policy_error(
                    Reason::TimeoutPolicyNotValid,
                    format!("invalid perTryTimeout {s:?}: {err}"),
                )
            })?),
        };

        Ok(Some(RetryPolicy {
            // a retry policy that retries zero times is a configuration
            // slip, not a request to disable retries.
            count: policy.count.max(1),
            per_try_timeout,
        }))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct HeadersPolicy {
    pub set: Vec<(String, String)>,
    pub remove: Vec<String>,
}

impl HeadersPolicy {
    /// `reason` distinguishes the request and response sides in status
    /// conditions.
    pub(crate) fn parse(
        policy: Option<&apis::HeadersPolicy>,
        reason: Reason,
    ) -> Result<Self, PolicyError> {
        let Some(policy) = policy else {
            return Ok(HeadersPolicy::default());
        };

        let mut set = Vec::with_capacity(policy.set.len());
        for header in &policy.set {
            let name = header.name.to_ascii_lowercase();
            // rewriting Host breaks the vhost match the route was selected
            // by, on either side of the proxy.
            if name == "host" {
                return Err(policy_error(reason, "rewriting the Host header is not supported"));
            }
            if name.is_empty() || !is_valid_header_name(&name) {
                return Err(policy_error(
                    reason,
                    format!("invalid header name {:?}", header.name),
                ));
            }
            set.push((name, header.value.clone()));
        }

        let mut remove = Vec::with_capacity(policy.remove.len());
        for name in &policy.remove {
            let name = name.to_ascii_lowercase();
            if name == "host" {
                return Err(policy_error(reason, "removing the Host header is not supported"));
            }
            remove.push(name);
        }

        Ok(HeadersPolicy { set, remove })
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.set.is_empty() && self.remove.is_empty()
    }
}

fn is_valid_header_name(name: &str) -> bool {
    name.bytes().all(|b| {
        b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.')
    })
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct CorsPolicy {
    pub allow_origin: Vec<String>,
    pub allow_methods: Vec<String>,
    pub allow_headers: Vec<String>,
    pub expose_headers: Vec<String>,
    pub max_age: Option<Duration>,
    pub allow_credentials: bool,
}

impl CorsPolicy {
    pub(crate) fn parse(policy: Option<&apis::CorsPolicy>) -> Result<Option<Self>, PolicyError> {
        let Some(policy) = policy else { return Ok(None) };

        // CORS is expressed through response headers, so its validation
        // failures share that reason code.
        if policy.allow_origin.is_empty() {
            return Err(policy_error(
                Reason::ResponseHeadersPolicyInvalid,
                "corsPolicy.allowOrigin must not be empty",
            ));
        }

        let max_age = match policy.max_age.as_deref() {
            None | Some("") => None,
            Some(s) => Some(humantime::parse_duration(s).map_err(|err| {
                policy_error(
                    Reason::TimeoutPolicyNotValid,
                    format!("invalid corsPolicy.maxAge {s:?}: {err}"),
                )
            })?),
        };

        Ok(Some(CorsPolicy {
            allow_origin: policy.allow_origin.clone(),
            allow_methods: policy.allow_methods.clone(),
            allow_headers: policy.allow_headers.clone(),
            expose_headers: policy.expose_headers.clone(),
            max_age,
            allow_credentials: policy.allow_credentials,
        }))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RateLimitUnit {
    Second,
    Minute,
    Hour,
}

impl RateLimitUnit {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            RateLimitUnit::Second => "second",
            RateLimitUnit::Minute => "minute",
            RateLimitUnit::Hour => "hour",
        }
    }
}

/// A local rate limit: N requests per unit. This is the one API shape
/// gantry supports for rate limiting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct RateLimitPolicy {
    pub requests: u32,
    pub unit: RateLimitUnit,
}

impl RateLimitPolicy {
    pub(crate) fn parse(
        policy: Option<&apis::RateLimitPolicy>,
    ) -> Result<Option<Self>, PolicyError> {
        let Some(policy) = policy else { return Ok(None) };

        let unit = match policy.unit.as_str() {
            "second" => RateLimitUnit::Second,
            "minute" => RateLimitUnit::Minute,
            "hour" => RateLimitUnit::Hour,
            other => {
                return Err(policy_error(
                    Reason::ResponseHeadersPolicyInvalid,
                    format!("invalid rateLimitPolicy.unit {other:?}"),
                ))
            }
        };
        if policy.requests == 0 {
            return Err(policy_error(
                Reason::ResponseHeadersPolicyInvalid,
                "rateLimitPolicy.requests must be positive",
            ));
        }

        Ok(Some(RateLimitPolicy {
            requests: policy.requests,
            unit,
        }))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_timeout() {
        assert_eq!(Timeout::parse("").unwrap(), Timeout::Default);
        assert_eq!(Timeout::parse("infinity").unwrap(), Timeout::Disabled);
        assert_eq!(
            Timeout::parse("1m30s").unwrap(),
            Timeout::Duration(Duration::from_secs(90))
        );

        let err = Timeout::parse("90 bananas").unwrap_err();
        assert_eq!(err.reason, Reason::TimeoutPolicyNotValid);
    }

    #[test]
    fn test_retry_count_floor() {
        let policy = RetryPolicy::parse(Some(&apis::RetryPolicy {
            count: 0,
            per_try_timeout: Some("250ms".to_string()),
        }))
        .unwrap()
        .unwrap();

        assert_eq!(policy.count, 1);
        assert_eq!(policy.per_try_timeout, Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_host_rewrite_forbidden() {
        let policy = apis::HeadersPolicy {
            set: vec![apis::HeaderValue {
                name: "Host".to_string(),
                value: "evil.example.com".to_string(),
            }],
            remove: vec![],
        };

        let err = HeadersPolicy::parse(Some(&policy), Reason::RequestHeadersPolicyInvalid)
            .unwrap_err();
        assert_eq!(err.reason, Reason::RequestHeadersPolicyInvalid);

        let policy = apis::HeadersPolicy {
            set: vec![],
            remove: vec!["host".to_string()],
        };
        let err = HeadersPolicy::parse(Some(&policy), Reason::ResponseHeadersPolicyInvalid)
            .unwrap_err();
        assert_eq!(err.reason, Reason::ResponseHeadersPolicyInvalid);
    }

    #[test]
    fn test_header_names_lowercased() {
        let policy = apis::HeadersPolicy {
            set: vec![apis::HeaderValue {
                name: "X-Request-Start".to_string(),
                value: "t=%START_TIME(%s.%3f)%".to_string(),
            }],
            remove: vec!["X-Internal-Debug".to_string()],
        };

        let parsed =
            HeadersPolicy::parse(Some(&policy), Reason::RequestHeadersPolicyInvalid).unwrap();
        assert_eq!(parsed.set[0].0, "x-request-start");
        assert_eq!(parsed.remove[0], "x-internal-debug");
    }

    #[test]
    fn test_rate_limit_units() {
        let policy = RateLimitPolicy::parse(Some(&apis::RateLimitPolicy {
            requests: 100,
            unit: "minute".to_string(),
        }))
        .unwrap()
        .unwrap();
        assert_eq!(policy.unit, RateLimitUnit::Minute);

        let err = RateLimitPolicy::parse(Some(&apis::RateLimitPolicy {
            requests: 100,
            unit: "fortnight".to_string(),
        }))
        .unwrap_err();
        assert!(err.message.contains("fortnight"));
    }
}
