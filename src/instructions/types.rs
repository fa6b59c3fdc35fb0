use serde::{Deserialize, Serialize};

/// One revision of an agent's system instruction.
///
/// `version` holds the display form (`"1.4"`); the padded storage form never
/// leaves the store. Serialized field names are camelCase to match the wire
/// format the web client consumes.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInstruction {
    pub agent_id: String,
    pub version: String,
    pub instruction: String,
    pub is_active: bool,
    pub change_note: Option<String>,
    pub updated_by: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Parameters for creating a new instruction revision.
#[derive(Debug, Clone)]
pub struct NewInstruction {
    pub agent_id: String,
    pub instruction: String,
    pub updated_by: String,
    /// Explicit display version. When absent the store bumps the latest
    /// minor version, or starts at `"1.0"` for a fresh agent.
    pub version: Option<String>,
    pub change_note: Option<String>,
}

/// Sort direction for history queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// Options for the list queries. `limit: None` returns the full history.
#[derive(Debug, Clone, Copy, Default)]
pub struct ListOptions {
    pub order: SortOrder,
    pub limit: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sort_order_deserializes_lowercase() {
        #[derive(Deserialize)]
        struct W {
            order: SortOrder,
        }
        let w: W = serde_json::from_str(r#"{"order":"asc"}"#).unwrap();
        assert_eq!(w.order, SortOrder::Asc);
        let w: W = serde_json::from_str(r#"{"order":"desc"}"#).unwrap();
        assert_eq!(w.order, SortOrder::Desc);
    }

    #[test]
    fn instruction_serializes_camel_case() {
        let rec = AgentInstruction {
            agent_id: "agent-1".into(),
            version: "1.0".into(),
            instruction: "Be kind".into(),
            is_active: true,
            change_note: None,
            updated_by: "alice".into(),
            created_at: "2026-01-01T00:00:00.000Z".into(),
            updated_at: "2026-01-01T00:00:00.000Z".into(),
        };
        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["agentId"], "agent-1");
        assert_eq!(json["isActive"], true);
        assert_eq!(json["changeNote"], serde_json::Value::Null);
    }
}
