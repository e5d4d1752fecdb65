//! Built-in API handlers.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use lobby_core::{AuthPolicy, HandlerError, Session};

use crate::context::HandlerContext;
use crate::dispatch::{ApiHandler, ApiRegistry};

pub const UPDATE_PREFERENCES: &str = "updatePreferences";

/// Register every built-in handler.
pub fn register_builtins(registry: &mut ApiRegistry) {
    registry.register(UPDATE_PREFERENCES, UpdatePreferences);
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct Preferences {
    language: Option<String>,
    theme: Option<String>,
    avatar: Option<String>,
    name: Option<String>,
}

impl Preferences {
    fn is_empty(&self) -> bool {
        self.language.is_none() && self.theme.is_none() && self.avatar.is_none() && self.name.is_none()
    }

    fn apply(self, session: &mut Session) {
        if let Some(language) = self.language {
            session.language = Some(language);
        }
        if let Some(theme) = self.theme {
            session.theme = Some(theme);
        }
        if let Some(avatar) = self.avatar {
            session.avatar = Some(avatar);
        }
        if let Some(name) = self.name {
            session.name = Some(name);
        }
    }
}

/// Updates display preferences on the caller's own session.
pub struct UpdatePreferences;

#[async_trait]
impl ApiHandler for UpdatePreferences {
    fn policy(&self) -> AuthPolicy {
        AuthPolicy::login_required()
    }

    async fn handle(
        &self,
        data: Value,
        _session: Session,
        ctx: HandlerContext,
    ) -> Result<Option<Value>, HandlerError> {
        let prefs: Preferences = serde_json::from_value(data)?;
        if prefs.is_empty() {
            return Err(HandlerError::invalid("no preferences given"));
        }
        debug!(token = %ctx.token, ?prefs, "updating preferences");
        let updated = ctx.sessions.update(&ctx.token, |s| prefs.apply(s)).await?;
        Ok(Some(serde_json::to_value(&updated)?))
    }
}
