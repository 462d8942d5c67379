use serde::Serialize;
use serde_json::Value;

/// Why an evaluation produced the value it did.
///
/// Serialized into analytics events and returned from the `*_detail`
/// variation methods.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind")]
pub enum Reason {
    #[serde(rename = "OFF")]
    Off,
    #[serde(rename = "TARGET_MATCH")]
    TargetMatch,
    #[serde(rename = "RULE_MATCH", rename_all = "camelCase")]
    RuleMatch {
        rule_index: usize,
        rule_id: String,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        in_experiment: bool,
    },
    #[serde(rename = "PREREQUISITE_FAILED", rename_all = "camelCase")]
    PrerequisiteFailed { prerequisite_key: String },
    #[serde(rename = "FALLTHROUGH", rename_all = "camelCase")]
    Fallthrough {
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        in_experiment: bool,
    },
    #[serde(rename = "ERROR", rename_all = "camelCase")]
    Error { error_kind: ErrorKind },
}

impl Reason {
    pub fn is_in_experiment(&self) -> bool {
        matches!(
            self,
            Reason::Fallthrough { in_experiment: true }
                | Reason::RuleMatch {
                    in_experiment: true,
                    ..
                }
        )
    }
}

/// Error category carried by [Reason::Error].
///
/// Evaluation errors never propagate as `Err`; they reduce to the caller's
/// default value with one of these kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    ClientNotReady,
    FlagNotFound,
    UserNotSpecified,
    MalformedFlag,
    WrongType,
    Exception,
}

/// Health of the big-segment membership oracle, observed during evaluation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BigSegmentsStatus {
    Healthy,
    Stale,
    StoreError,
    NotConfigured,
}

/// Value, variation index and reason from one evaluation.
///
/// `variation_index` is `None` when no variation applied (off with no off
/// variation, or an error).
#[derive(Clone, Debug, PartialEq)]
pub struct Detail<T> {
    pub value: Option<T>,
    pub variation_index: Option<usize>,
    pub reason: Reason,
}

impl<T> Detail<T> {
    pub fn err(kind: ErrorKind) -> Self {
        Self {
            value: None,
            variation_index: None,
            reason: Reason::Error { error_kind: kind },
        }
    }

    pub fn empty(reason: Reason) -> Self {
        Self {
            value: None,
            variation_index: None,
            reason,
        }
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Detail<U> {
        Detail {
            value: self.value.map(f),
            variation_index: self.variation_index,
            reason: self.reason,
        }
    }

    /// Substitute the caller-supplied default, keeping the reason.
    pub fn or(self, default: T) -> Detail<T> {
        Detail {
            value: Some(self.value.unwrap_or(default)),
            variation_index: self.variation_index,
            reason: self.reason,
        }
    }
}

/// Full outcome of evaluating a flag, including the bookkeeping consumers
/// need beyond the caller-visible [Detail].
#[derive(Clone, Debug, PartialEq)]
pub struct EvalResult {
    pub detail: Detail<Value>,
    /// Reason must be attached to analytics regardless of caller request.
    pub force_reason_tracking: bool,
    pub big_segments_status: Option<BigSegmentsStatus>,
}

impl EvalResult {
    pub fn new(detail: Detail<Value>) -> Self {
        Self {
            detail,
            force_reason_tracking: false,
            big_segments_status: None,
        }
    }

    pub fn err(kind: ErrorKind) -> Self {
        Self::new(Detail::err(kind))
    }

    /// Reason JSON with the big-segments annotation merged in, as events
    /// serialize it.
    pub fn reason_json(&self) -> Value {
        let mut json = serde_json::to_value(&self.detail.reason).unwrap_or(Value::Null);
        if let (Some(status), Value::Object(map)) = (self.big_segments_status, &mut json) {
            map.insert(
                "bigSegmentsStatus".into(),
                serde_json::to_value(status).unwrap_or(Value::Null),
            );
        }
        json
    }
}
