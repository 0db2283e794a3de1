use crate::resources::{
    DNSRecord,
    READY_CONDITION,
};
use chrono::prelude::*;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    Condition,
    Time,
};

pub const REASON_PROVIDER_SUCCESS: &str = "ProviderSuccess";
pub const REASON_PROVIDER_ERROR: &str = "ProviderError";
pub const REASON_DNS_PROVIDER_ERROR: &str = "DNSProviderError";
pub const REASON_AWAITING_VALIDATION: &str = "AwaitingValidation";

pub const MESSAGE_PROVIDER_SUCCESS: &str = "Provider ensured the dns record";
pub const MESSAGE_AWAITING_VALIDATION: &str = "Awaiting validation";

pub(crate) fn error_condition(
    current: &DNSRecord,
    reason: impl ToString,
    message: impl ToString,
    observed_generation: Option<i64>,
) -> Condition {
    let conditions = current.status.as_ref().and_then(|status| status.conditions.as_ref());

    let (was_ready, last_condition) = last_ready_condition(conditions);

    // a failure keeps the transition time of an earlier failure
    let last_transition_time = if was_ready {
        Time(Utc::now())
    } else {
        last_condition
            .map(|condition| condition.last_transition_time.clone())
            .unwrap_or_else(|| Time(Utc::now()))
    };

    Condition {
        type_: READY_CONDITION.to_string(),
        status: "False".to_string(),
        reason: reason.to_string(),
        message: message.to_string(),
        last_transition_time,
        observed_generation,
    }
}

pub(crate) fn success_condition(current: &DNSRecord, observed_generation: Option<i64>) -> Condition {
    let conditions = current.status.as_ref().and_then(|status| status.conditions.as_ref());

    let (was_ready, last_condition) = last_ready_condition(conditions);

    let last_transition_time = if !was_ready {
        Time(Utc::now())
    } else {
        last_condition
            .map(|condition| condition.last_transition_time.clone())
            .unwrap_or_else(|| Time(Utc::now()))
    };

    Condition {
        type_: READY_CONDITION.to_string(),
        status: "True".to_string(),
        reason: REASON_PROVIDER_SUCCESS.to_string(),
        message: MESSAGE_PROVIDER_SUCCESS.to_string(),
        last_transition_time,
        observed_generation,
    }
}

fn last_ready_condition(conditions: Option<&Vec<Condition>>) -> (bool, Option<&Condition>) {
    conditions.map_or((false, None), |conditions| {
        let ready_cond = conditions.iter().find(|condition| condition.type_ == READY_CONDITION);
        (
            ready_cond.map_or(false, |condition| condition.status == "True"),
            ready_cond,
        )
    })
}

/// Replaces the Ready condition in `conditions`, keeping any other condition types.
pub(crate) fn set_ready_condition(conditions: &mut Option<Vec<Condition>>, condition: Condition) {
    let conditions = conditions.get_or_insert_with(Vec::new);
    conditions.retain(|existing| existing.type_ != READY_CONDITION);
    conditions.push(condition);
}
