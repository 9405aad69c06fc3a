use k8s_openapi::chrono::{SecondsFormat, Utc};
use kube::CustomResource;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

mod config;
pub use config::*;

pub const API_GROUP: &'static str = "echo.rustrial.org";

/// We maintain our own copy of Condition as the one from k8s_openapi does not implement JsonSchema.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct Condition {
    /// lastTransitionTime is the last time the condition transitioned from one status to another. This should be when the underlying condition changed.  If that is not known, then using the time when the API field changed is acceptable.
    #[serde(rename = "lastTransitionTime", skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,

    /// message is a human readable message indicating details about the transition. This may be an empty string.
    pub message: String,

    /// observedGeneration represents the .metadata.generation that the condition was set based upon. For instance, if .metadata.generation is currently 12, but the .status.conditions\[x\].observedGeneration is 9, the condition is out of date with respect to the current state of the instance.
    #[serde(rename = "observedGeneration", skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// reason contains a programmatic identifier indicating the reason for the condition's last transition. Producers of specific condition types may define expected values and meanings for this field, and whether the values are considered a guaranteed API. The value should be a CamelCase string. This field may not be empty.
    pub reason: String,

    /// status of the condition, one of True, False, Unknown.
    pub status: String,

    /// type of condition in CamelCase or in foo.example.com/CamelCase.
    #[serde(rename = "type")]
    pub type_: String,
}

impl Condition {
    pub fn new(tpe: &str, status: Option<bool>, reason: &str, message: String) -> Self {
        Self {
            last_transition_time: None,
            message,
            reason: reason.to_string(),
            status: status
                .map(|v| if v { "True" } else { "False" })
                .unwrap_or("Unknown")
                .to_string(),
            type_: tpe.to_string(),
            observed_generation: None,
        }
    }

    pub fn with_observed_generation(mut self, generation: Option<i64>) -> Self {
        self.observed_generation = generation;
        self
    }

    /// Two conditions are equivalent if they only differ in their transition time.
    fn is_equivalent(&self, other: &Condition) -> bool {
        self.type_ == other.type_
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
            && self.observed_generation == other.observed_generation
    }
}

/// Demo resource reconciled by the bundled operator binary: the controller echoes
/// `spec.message` into `status.echoed`.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "echo.rustrial.org",
    version = "v1alpha1",
    kind = "Echo",
    derive = "PartialEq",
    status = "EchoStatus",
    namespaced,
    printcolumn = r#"{
        "name":"Ready",
        "type": "string",
        "jsonPath": ".status.conditions[?(@.type==\"Ready\")].status",
        "description": "Whether the message of the latest generation has been echoed."
    }"#,
    printcolumn = r#"{
        "name":"Echoed",
        "type": "string",
        "jsonPath": ".status.echoed",
        "description": "The echoed message."
    }"#
)]
pub struct EchoSpec {
    /// The message to echo into the status sub-resource.
    pub message: String,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default, JsonSchema)]
pub struct EchoStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
    /// The last echoed `spec.message`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub echoed: Option<String>,
    /// The `.metadata.generation` which has been echoed.
    #[serde(rename = "observedGeneration", skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Echo {
    pub fn id(&self) -> String {
        format!(
            "{}/{}",
            self.metadata.namespace.as_deref().unwrap_or(""),
            self.metadata.name.as_deref().unwrap_or(""),
        )
    }

    pub fn versioned_id(&self) -> String {
        format!(
            "{}@{}",
            self.id(),
            self.metadata.resource_version.as_deref().unwrap_or("")
        )
    }

    pub fn update_condition(&mut self, c: Condition) {
        let mut status = self.status.take().unwrap_or_default();
        status.update_condition(c);
        self.status = Some(status);
    }

    pub fn update_echoed(&mut self, message: String, generation: Option<i64>) {
        let mut status = self.status.take().unwrap_or_default();
        status.echoed = Some(message);
        status.observed_generation = generation;
        self.status = Some(status);
    }
}

impl EchoStatus {
    pub fn update_condition(&mut self, mut c: Condition) {
        let mut conditions: Vec<Condition> = self.conditions.take().unwrap_or_else(|| vec![]);
        if let Some(existing) = conditions.iter().find(|v| v.type_ == c.type_) {
            if !existing.is_equivalent(&c) {
                let time = Utc::now();
                c.last_transition_time = Some(time.to_rfc3339_opts(SecondsFormat::Secs, true));
                conditions.retain(|v| v.type_ != c.type_);
                conditions.push(c);
            }
        } else {
            let time = Utc::now();
            c.last_transition_time = Some(time.to_rfc3339_opts(SecondsFormat::Secs, true));
            conditions.push(c);
        };
        self.conditions = Some(conditions);
    }

    pub fn condition(&self, tpe: &str) -> Option<&Condition> {
        self.conditions
            .as_ref()
            .and_then(|v| v.iter().find(|c| c.type_ == tpe))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;

    #[test]
    fn it_works() {
        let p = EchoSpec {
            message: "hello".to_string(),
        };
        assert_eq!(r#"{"message":"hello"}"#, serde_json::to_string(&p).unwrap());
    }

    #[test]
    fn condition() {
        let c = Condition::new("Ready", Some(true), "Success", "ok".to_string())
            .with_observed_generation(Some(3));
        assert_eq!(
            r#"{"message":"ok","observedGeneration":3,"reason":"Success","status":"True","type":"Ready"}"#,
            serde_json::to_string(&c).unwrap()
        );
        assert_eq!(
            "Unknown",
            Condition::new("Ready", None, "Pending", "".to_string()).status
        );
    }

    #[test]
    fn update_condition() {
        let mut echo = Echo {
            metadata: ObjectMeta {
                name: Some("me".to_string()),
                namespace: Some("ns1".to_string()),
                generation: Some(1),
                ..Default::default()
            },
            spec: EchoSpec {
                message: "hello".to_string(),
            },
            status: None,
        };
        echo.update_condition(Condition::new(
            "Ready",
            Some(false),
            "Pending",
            "pending".to_string(),
        ));
        echo.update_condition(Condition::new(
            "Synced",
            Some(true),
            "Success",
            "synced".to_string(),
        ));
        let first = echo
            .status
            .as_ref()
            .and_then(|s| s.condition("Ready"))
            .cloned()
            .unwrap();
        // Same condition again keeps the original transition time.
        echo.update_condition(Condition::new(
            "Ready",
            Some(false),
            "Pending",
            "pending".to_string(),
        ));
        let status = echo.status.as_ref().unwrap();
        assert_eq!(Some(&first), status.condition("Ready"));
        assert_eq!(2, status.conditions.as_ref().unwrap().len());
        // A changed condition replaces the existing one of the same type only.
        echo.update_condition(Condition::new(
            "Ready",
            Some(true),
            "Success",
            "echoed".to_string(),
        ));
        let status = echo.status.as_ref().unwrap();
        assert_eq!("True", status.condition("Ready").unwrap().status);
        assert_eq!("True", status.condition("Synced").unwrap().status);
        assert_eq!(2, status.conditions.as_ref().unwrap().len());
        assert_eq!("ns1/me", echo.id());
    }
}
