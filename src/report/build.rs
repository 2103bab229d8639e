// src/report/build.rs

//! Report payloads per channel.

use serde_json::{Map, Value, json};

use super::{Report, ReportChannel};
use crate::resource::to_lower_dashed;
use crate::task::Task;
use crate::task::params::{
    DATA, LAST_EXCEPTION, OBJ_REF, OLD_SERVER_NAME, PARAMS_FOR_REQUIRED, PROVIDER, RESOURCE,
};

/// Keys that must not travel to another executor with a forwarded task.
const NOT_FORWARDED: [&str; 3] = [RESOURCE, "dataPostprocessorType", "dataPostprocessorArgs"];

/// Result of a broker-originated mutation, published back to the
/// `<resType>.<action>` exchange.
///
/// A website moved away from another server (`oldServerName`) is instead
/// forwarded to that server's executor so it can switch its copy off.
pub fn broker_report(task: &Task, success: bool) -> Report {
    let params = &task.params;
    let provider = params.str(PROVIDER).unwrap_or_default();
    let exchange = format!("{}.{}", task.res_type, task.action);

    let next_executor = params
        .str(OLD_SERVER_NAME)
        .filter(|_| task.res_type == "website");

    let report_params = match next_executor {
        Some(_) => {
            let mut forwarded = params.as_map().clone();
            for key in NOT_FORWARDED.into_iter().chain([OLD_SERVER_NAME, "success"]) {
                forwarded.remove(key);
            }
            forwarded.insert(
                PARAMS_FOR_REQUIRED.to_string(),
                json!({ "forceSwitchOff": true }),
            );
            Value::Object(forwarded)
        }
        None => {
            let mut outcome = Map::new();
            outcome.insert("success".into(), Value::Bool(success));
            if let Some(last) = params.get(LAST_EXCEPTION) {
                outcome.insert(
                    "errorMessage".into(),
                    last.get("message").cloned().unwrap_or(Value::Null),
                );
                outcome.insert(
                    "exceptionClass".into(),
                    last.get("class").cloned().unwrap_or(Value::Null),
                );
            }
            Value::Object(outcome)
        }
    };

    let (routing_key, header_provider) = match next_executor {
        Some(server) => (format!("te.{server}"), provider.to_string()),
        None => (provider.replace('-', "."), "te".to_string()),
    };

    Report {
        channel: ReportChannel::Broker {
            exchange,
            routing_key,
            provider: header_provider,
        },
        body: json!({
            "operationIdentity": task.operation_id,
            "actionIdentity": task.action_id,
            "objRef": params.get(OBJ_REF).cloned().unwrap_or(Value::Null),
            "params": report_params,
        }),
    }
}

/// Collected data of a query task, posted to
/// `<resType>/<resourceId>/<action-lower-dashed>`.
///
/// `None` without a resolved resource: there is nowhere to post it.
pub fn http_report(task: &Task) -> Option<Report> {
    let resource = task.params.resource()?;
    let action = to_lower_dashed(task.action.as_str());
    Some(Report {
        channel: ReportChannel::Http {
            path: format!("{}/{}/{}", task.res_type, resource.identity(), action),
        },
        body: task.params.get(DATA).cloned().unwrap_or_else(|| json!({})),
    })
}

/// Alert about a finished (typically scheduled backup) task.
pub fn alert_report(task: &Task, success: bool, hostname: &str) -> Report {
    let mut attributes = Map::new();
    attributes.insert("publicParams".into(), json!([]));
    attributes.insert("tag".into(), json!(task.tag));
    attributes.insert("origin".into(), json!(task.origin.to_string()));
    attributes.insert("opid".into(), json!(task.operation_id));
    attributes.insert("actid".into(), json!(task.action_id));
    attributes.insert("res_type".into(), json!(task.res_type));
    attributes.insert("action".into(), json!(task.action.as_str()));
    attributes.insert("hostname".into(), json!(hostname));
    for (k, v) in task.params.as_map() {
        if k == RESOURCE {
            attributes.insert("hmsResource".into(), v.clone());
        } else {
            attributes.insert(k.clone(), v.clone());
        }
    }

    let text = if success {
        json!("Done")
    } else {
        task.params
            .get(LAST_EXCEPTION)
            .cloned()
            .unwrap_or_else(|| json!("Failed"))
    };

    Report {
        channel: ReportChannel::Alert,
        body: json!({
            "environment": "HMS",
            "service": ["taskexecutor"],
            "resource": task.action_id,
            "event": "task.finished",
            "value": if success { "Ok" } else { "Failed" },
            "text": text,
            "severity": if success { "Ok" } else { "Minor" },
            "hostname": hostname,
            "attributes": Value::Object(attributes),
        }),
    }
}
