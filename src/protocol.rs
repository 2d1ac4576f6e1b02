//! Command protocol for the unit manager
//!
//! Request/response types exchanged with the control socket layer, and the
//! dispatcher mapping a request onto manager operations. Framing and
//! transport belong to the socket layer.

use serde::{Deserialize, Serialize};

use crate::manager::{
    DisableOptions, EnableOptions, Manager, ManagerError, Outcome, StartOptions, UnitSnapshot,
};

/// Request from a client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Start a unit and any requirement that is not up
    Start {
        name: String,
        force: bool,
        restart: bool,
        reset: bool,
    },
    Stop { name: String },
    Restart { name: String },
    /// Link a unit for its wanted-by states
    Enable { name: String, force: bool, run: bool },
    /// Unlink a unit and drop it
    Disable { name: String, run: bool },
    Status { name: String },
    /// All units
    List,
    /// Names of running units
    Running,
    /// Names of units with a restart policy
    Restartable,
}

/// Response to a client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    /// 0 on success, 1 on failure, plus the affected units
    Result { code: i32, units: Vec<UnitSnapshot> },
    Names(Vec<String>),
    Error(String),
}

impl Response {
    pub fn code(&self) -> i32 {
        match self {
            Response::Result { code, .. } => *code,
            Response::Names(_) => 0,
            Response::Error(_) => 1,
        }
    }
}

impl From<Result<Outcome, ManagerError>> for Response {
    fn from(result: Result<Outcome, ManagerError>) -> Self {
        match result {
            Ok(outcome) => Response::Result {
                code: outcome.code,
                units: outcome.units,
            },
            Err(e) => Response::Error(e.to_string()),
        }
    }
}

/// Execute a request against the manager
pub async fn dispatch(manager: &Manager, request: Request) -> Response {
    log::debug!("Request: {:?}", request);
    match request {
        Request::Start {
            name,
            force,
            restart,
            reset,
        } => manager
            .start_unit(&name, StartOptions { force, restart, reset })
            .await
            .into(),
        Request::Stop { name } => manager.stop_unit(&name).await.into(),
        Request::Restart { name } => manager.restart_unit(&name).await.into(),
        Request::Enable { name, force, run } => manager
            .enable_unit(&name, EnableOptions { force, run })
            .await
            .into(),
        Request::Disable { name, run } => manager
            .disable_unit(&name, DisableOptions { run })
            .await
            .into(),
        Request::Status { name } => match manager.status(&name) {
            Some(snapshot) => Response::Result {
                code: 0,
                units: vec![snapshot],
            },
            None => Response::Error(ManagerError::NotFound(name).to_string()),
        },
        Request::List => Response::Result {
            code: 0,
            units: manager.list(),
        },
        Request::Running => Response::Names(manager.running_units()),
        Request::Restartable => Response::Names(manager.restartable_units()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::ManagerConfig;
    use crate::units::UnitDef;
    use std::path::Path;

    fn manager() -> Manager {
        let manager = Manager::new(ManagerConfig::with_root(Path::new("/nonexistent/unitd-proto")));
        let mut web = UnitDef::daemon("web.unit", "/bin/sleep 30");
        web.restart = true;
        manager.load_units(vec![web, UnitDef::oneshot("init.unit", "/bin/true")]);
        manager
    }

    #[tokio::test]
    async fn test_status_and_list() {
        let manager = manager();
        let response = dispatch(&manager, Request::Status { name: "web.unit".into() }).await;
        match response {
            Response::Result { code, units } => {
                assert_eq!(code, 0);
                assert_eq!(units[0].name, "web.unit");
                assert!(!units[0].is_running());
            }
            other => panic!("unexpected response: {:?}", other),
        }

        let response = dispatch(&manager, Request::List).await;
        match response {
            Response::Result { units, .. } => assert_eq!(units.len(), 2),
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_errors_map_to_error_response() {
        let manager = manager();
        let response = dispatch(&manager, Request::Stop { name: "web.unit".into() }).await;
        assert!(matches!(&response, Response::Error(msg) if msg.contains("not active")));
        assert_eq!(response.code(), 1);

        let response = dispatch(&manager, Request::Status { name: "ghost.unit".into() }).await;
        assert!(matches!(response, Response::Error(_)));

        let response = dispatch(
            &manager,
            Request::Enable {
                name: "init.unit".into(),
                force: false,
                run: false,
            },
        )
        .await;
        assert!(matches!(&response, Response::Error(msg) if msg.contains("not wanted")));
    }

    #[tokio::test]
    async fn test_name_queries() {
        let manager = manager();
        let response = dispatch(&manager, Request::Restartable).await;
        assert!(matches!(response, Response::Names(names) if names == vec!["web.unit"]));
        let response = dispatch(&manager, Request::Running).await;
        assert!(matches!(response, Response::Names(names) if names.is_empty()));
    }
}
