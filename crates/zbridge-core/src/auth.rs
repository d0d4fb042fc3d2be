//! Identity descriptors attached to connections.
//!
//! Credential validation itself happens in an external collaborator; the
//! bridge only normalizes whatever identities were bound to a connection
//! into an [`AuthContext`] for cache-key generation and audit logging.

use serde::{Deserialize, Serialize};

/// Authentication tier of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthScope {
    None,
    Session,
    Application,
    /// Both a session and an application identity are attached. The
    /// application identity wins for cache-key and audit purposes.
    Dual,
}

/// A single identity as attached by the authentication collaborator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub app_name: String,
    pub role: String,
}

/// Raw identity bindings on a connection. Either, both, or neither of the
/// tiers may be present.
#[derive(Clone, Debug, Default)]
pub struct AuthBindings {
    pub session: Option<Identity>,
    pub application: Option<Identity>,
}

impl AuthBindings {
    pub fn is_empty(&self) -> bool {
        self.session.is_none() && self.application.is_none()
    }
}

/// Normalized identity descriptor used for cache keys and audit logs.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AuthContext {
    pub user_id: String,
    pub app_name: String,
    pub role: String,
    pub scope: AuthScope,
}

impl AuthContext {
    /// Safe default for unauthenticated connections. Discovery-style calls
    /// must keep working without credentials.
    pub fn anonymous() -> Self {
        Self {
            user_id: "anonymous".into(),
            app_name: "unknown".into(),
            role: "guest".into(),
            scope: AuthScope::None,
        }
    }

    /// Resolve bindings into a normalized context. With both tiers attached
    /// the application identity takes precedence (documented policy).
    pub fn extract(bindings: &AuthBindings) -> Self {
        match (&bindings.session, &bindings.application) {
            (Some(_), Some(app)) => Self {
                user_id: app.user_id.clone(),
                app_name: app.app_name.clone(),
                role: app.role.clone(),
                scope: AuthScope::Dual,
            },
            (None, Some(app)) => Self {
                user_id: app.user_id.clone(),
                app_name: app.app_name.clone(),
                role: app.role.clone(),
                scope: AuthScope::Application,
            },
            (Some(sess), None) => Self {
                user_id: sess.user_id.clone(),
                app_name: sess.app_name.clone(),
                role: sess.role.clone(),
                scope: AuthScope::Session,
            },
            (None, None) => Self::anonymous(),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.scope == AuthScope::None
    }

    /// Scope tag used in audit log fields.
    pub fn scope_tag(&self) -> &'static str {
        match self.scope {
            AuthScope::None => "none",
            AuthScope::Session => "session",
            AuthScope::Application => "application",
            AuthScope::Dual => "dual",
        }
    }
}
