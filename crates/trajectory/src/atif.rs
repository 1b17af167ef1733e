//! ATIF — the JSON trajectory interchange format.
//!
//! Export is a plain serde round-trip; import validates the raw document
//! before any typed deserialization so malformed files are rejected with a
//! useful message instead of a serde path.

use serde_json::Value;

use wf_domain::{Error, Result};

use crate::store::{Trajectory, ATIF_SCHEMA};

/// Serialize a trajectory to its interchange JSON.
pub fn export(trajectory: &Trajectory) -> Result<String> {
    Ok(serde_json::to_string_pretty(trajectory)?)
}

/// Parse and validate an interchange document.
pub fn import(raw: &str) -> Result<Trajectory> {
    let value: Value = serde_json::from_str(raw)?;
    validate(&value)?;
    Ok(serde_json::from_value(value)?)
}

/// Structural validation of a raw ATIF document: schema version prefix,
/// session id, agent config, and step sources.
pub fn validate(value: &Value) -> Result<()> {
    let schema = value
        .get("schema")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::Validation("missing schema tag".into()))?;
    let prefix = ATIF_SCHEMA.split('-').next().unwrap_or(ATIF_SCHEMA);
    if !schema.starts_with(&format!("{prefix}-")) {
        return Err(Error::Validation(format!(
            "unrecognized schema tag '{schema}' (expected {prefix}-*)"
        )));
    }

    let session_id = value
        .get("session_id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::Validation("missing session_id".into()))?;
    if session_id.parse::<uuid::Uuid>().is_err() {
        return Err(Error::Validation(format!(
            "session_id '{session_id}' is not a UUID"
        )));
    }

    let agent = value
        .get("agent")
        .ok_or_else(|| Error::Validation("missing agent config".into()))?;
    if agent.get("name").and_then(|v| v.as_str()).unwrap_or("").is_empty() {
        return Err(Error::Validation("agent config has no name".into()));
    }

    let steps = value
        .get("steps")
        .and_then(|v| v.as_array())
        .ok_or_else(|| Error::Validation("missing steps array".into()))?;
    for (i, step) in steps.iter().enumerate() {
        match step.get("source").and_then(|v| v.as_str()) {
            Some("system" | "user" | "agent") => {}
            Some(other) => {
                return Err(Error::Validation(format!(
                    "step {i} has invalid source '{other}'"
                )))
            }
            None => return Err(Error::Validation(format!("step {i} has no source"))),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::{StepDraft, StepMetrics};
    use uuid::Uuid;

    fn sample() -> Trajectory {
        let mut t = Trajectory::new(Uuid::new_v4());
        t.add_step(StepDraft::system("prompt")).unwrap();
        t.add_step(StepDraft::user("question")).unwrap();
        t.add_step(StepDraft::agent("answer").with_metrics(StepMetrics {
            prompt_tokens: 10,
            completion_tokens: 5,
            cached_tokens: Some(2),
            cost_usd: 0.001,
        }))
        .unwrap();
        t
    }

    #[test]
    fn roundtrip_preserves_everything() {
        let t = sample();
        let json = export(&t).unwrap();
        let back = import(&json).unwrap();
        assert_eq!(back.schema, t.schema);
        assert_eq!(back.session_id, t.session_id);
        assert_eq!(back.total_steps(), t.total_steps());
        assert_eq!(back.final_metrics, t.final_metrics);
        assert_eq!(back.steps[2].metrics.unwrap().cached_tokens, Some(2));
    }

    #[test]
    fn import_rejects_wrong_schema() {
        let mut value = serde_json::to_value(sample()).unwrap();
        value["schema"] = serde_json::json!("OTHER-1.0");
        let err = import(&value.to_string()).unwrap_err();
        assert!(err.to_string().contains("schema"));
    }

    #[test]
    fn import_rejects_missing_session_id() {
        let mut value = serde_json::to_value(sample()).unwrap();
        value.as_object_mut().unwrap().remove("session_id");
        assert!(import(&value.to_string()).is_err());
    }

    #[test]
    fn import_rejects_missing_agent() {
        let mut value = serde_json::to_value(sample()).unwrap();
        value.as_object_mut().unwrap().remove("agent");
        assert!(import(&value.to_string()).is_err());
    }

    #[test]
    fn import_rejects_bad_step_source() {
        let mut value = serde_json::to_value(sample()).unwrap();
        value["steps"][1]["source"] = serde_json::json!("narrator");
        let err = import(&value.to_string()).unwrap_err();
        assert!(err.to_string().contains("invalid source"));
    }

    #[test]
    fn import_accepts_future_minor_versions() {
        let mut value = serde_json::to_value(sample()).unwrap();
        value["schema"] = serde_json::json!("ATIF-1.1");
        assert!(validate(&value).is_ok());
    }

    #[test]
    fn import_rejects_non_json() {
        assert!(import("not json").is_err());
    }
}
