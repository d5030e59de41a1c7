//! Admin action requests from the dashboard

use netfang_common::MacAddress;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AdminError;

/// Request as it arrives on the wire: `{"action": "...", "params": {...}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdminRequest {
    pub action: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminAction {
    RestartNetwork,
    ClearAlerts,
    DismissAlert { id: u64 },
    StartScan,
    PluginAction { plugin: String, args: Vec<String> },
    ForgetNetwork { mac: MacAddress },
}

impl AdminAction {
    pub fn name(&self) -> &'static str {
        match self {
            AdminAction::RestartNetwork => "restartNetwork",
            AdminAction::ClearAlerts => "clearAlerts",
            AdminAction::DismissAlert { .. } => "dismissAlert",
            AdminAction::StartScan => "startScan",
            AdminAction::PluginAction { .. } => "pluginAction",
            AdminAction::ForgetNetwork { .. } => "forgetNetwork",
        }
    }
}

impl AdminRequest {
    pub fn new(action: impl Into<String>, params: Value) -> Self {
        Self {
            action: action.into(),
            params,
        }
    }

    pub fn parse(&self) -> Result<AdminAction, AdminError> {
        let action = match self.action.as_str() {
            "restartNetwork" => AdminAction::RestartNetwork,
            "clearAlerts" => AdminAction::ClearAlerts,
            "startScan" => AdminAction::StartScan,
            "dismissAlert" => {
                let id = self
                    .params
                    .get("id")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| self.invalid("expected numeric 'id'"))?;
                AdminAction::DismissAlert { id }
            }
            "pluginAction" => {
                let plugin = self
                    .params
                    .get("plugin")
                    .and_then(Value::as_str)
                    .filter(|p| !p.is_empty())
                    .ok_or_else(|| self.invalid("expected 'plugin' name"))?
                    .to_ascii_lowercase();
                let args = match self.params.get("args") {
                    None | Some(Value::Null) => Vec::new(),
                    Some(Value::Array(items)) => items
                        .iter()
                        .map(|v| v.as_str().map(str::to_string))
                        .collect::<Option<Vec<_>>>()
                        .ok_or_else(|| self.invalid("'args' must be strings"))?,
                    Some(_) => return Err(self.invalid("'args' must be a list")),
                };
                AdminAction::PluginAction { plugin, args }
            }
            "forgetNetwork" => {
                let raw = self
                    .params
                    .get("mac")
                    .and_then(Value::as_str)
                    .ok_or_else(|| self.invalid("expected 'mac'"))?;
                let mac = MacAddress::parse(raw).map_err(|e| self.invalid(&e.to_string()))?;
                AdminAction::ForgetNetwork { mac }
            }
            other => return Err(AdminError::UnknownAction(other.to_string())),
        };
        Ok(action)
    }

    fn invalid(&self, reason: &str) -> AdminError {
        AdminError::InvalidParams {
            action: self.action.clone(),
            reason: reason.to_string(),
        }
    }
}

/// Reply surfaced back to the caller on success
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminResponse {
    pub message: String,
}

impl AdminResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(raw: &str) -> Result<AdminAction, AdminError> {
        serde_json::from_str::<AdminRequest>(raw).unwrap().parse()
    }

    #[test]
    fn test_parse_actions() {
        assert_eq!(parse(r#"{"action":"restartNetwork"}"#).unwrap(), AdminAction::RestartNetwork);
        assert_eq!(
            parse(r#"{"action":"dismissAlert","params":{"id":7}}"#).unwrap(),
            AdminAction::DismissAlert { id: 7 }
        );
        assert_eq!(
            parse(r#"{"action":"pluginAction","params":{"plugin":"MacChanger","args":["-r"]}}"#)
                .unwrap(),
            AdminAction::PluginAction {
                plugin: "macchanger".into(),
                args: vec!["-r".into()]
            }
        );
        assert_eq!(
            parse(r#"{"action":"forgetNetwork","params":{"mac":"de-ad-be-ef-ca-fe"}}"#).unwrap(),
            AdminAction::ForgetNetwork {
                mac: MacAddress::parse("DE:AD:BE:EF:CA:FE").unwrap()
            }
        );
    }

    #[test]
    fn test_bad_requests() {
        assert!(matches!(
            parse(r#"{"action":"selfDestruct"}"#),
            Err(AdminError::UnknownAction(a)) if a == "selfDestruct"
        ));
        assert!(matches!(
            AdminRequest::new("dismissAlert", json!({"id": "seven"})).parse(),
            Err(AdminError::InvalidParams { .. })
        ));
        assert!(matches!(
            AdminRequest::new("forgetNetwork", json!({"mac": "zz"})).parse(),
            Err(AdminError::InvalidParams { .. })
        ));
    }
}
