//! Single entry point for every inbound frame.
//!
//! Frames that fail to parse as JSON objects are not fatal: they are
//! forwarded verbatim to every other connection as opaque broadcast
//! payloads. Parsed envelopes go through special-event dispatch first, then
//! generic command dispatch on `zKey` | `cmd`.

use std::sync::Arc;

use serde_json::Value;
use zbridge_core::envelope::{echo, error_reply, ok_reply};
use zbridge_core::{AuthScope, ConnectionId, Correlation, Envelope, Identity, WalkerSource};
use zbridge_cache::{generate_key, is_cacheable, CacheManager, TTL_MAX_SECS, TTL_MIN_SECS};

use crate::bridge::ExecutionBridge;
use crate::collaborators::Collaborators;
use crate::connection::ConnectionRegistry;
use crate::pending::PendingInputs;

/// Shared handles the router needs to service any frame.
pub struct RouterState {
    pub registry: Arc<ConnectionRegistry>,
    pub cache: Arc<CacheManager>,
    pub bridge: Arc<ExecutionBridge>,
    pub pending: Arc<PendingInputs>,
    pub collaborators: Collaborators,
}

impl RouterState {
    /// Route one inbound text frame from a connection.
    pub async fn handle_frame(&self, origin: &ConnectionId, raw: &str) {
        let Some(envelope) = Envelope::parse(raw) else {
            tracing::debug!(connection_id = %origin, "Opaque frame, rebroadcasting");
            self.registry.broadcast_except(origin, raw).await;
            return;
        };

        let corr = envelope.correlation();
        match envelope.resolved_event() {
            Some("input_response") => self.handle_input_response(&envelope, corr).await,
            Some("get_schema") => self.handle_get_schema(origin, &envelope, corr).await,
            Some("clear_cache") => self.handle_clear_cache(origin, corr).await,
            Some("cache_stats") => self.handle_cache_stats(origin, corr).await,
            Some("set_query_cache_ttl") => self.handle_set_ttl(origin, &envelope, corr).await,
            Some("discover") => self.handle_discover(origin, corr).await,
            Some("introspect") => self.handle_introspect(origin, &envelope, corr).await,
            Some("execute_walker") | Some("load_page") => {
                self.handle_walker_start(origin, &envelope, corr).await
            }
            Some("form_submit") => self.handle_form_submit(origin, &envelope, corr).await,
            Some("authenticate") => self.handle_authenticate(origin, &envelope, corr).await,
            Some("logout") => self.handle_logout(origin, corr).await,
            _ => self.handle_generic(origin, &envelope, corr).await,
        }
    }

    async fn reply(&self, origin: &ConnectionId, body: Value) {
        self.registry.send_to(origin, body.to_string()).await;
    }

    /// `input_response` resolves a pending waiter keyed by the correlation
    /// token. No direct reply.
    async fn handle_input_response(&self, envelope: &Envelope, corr: Option<Correlation>) {
        let Some(corr) = corr else {
            tracing::warn!("input_response without a request token, dropping");
            return;
        };
        let value = envelope.get("value").cloned().unwrap_or(Value::Null);
        self.pending.resolve(&corr.value, value);
    }

    async fn handle_get_schema(
        &self,
        origin: &ConnectionId,
        envelope: &Envelope,
        corr: Option<Correlation>,
    ) {
        let reply = match envelope.require_str("model") {
            Ok(model) => match self.collaborators.schemas.load(model) {
                Some(schema) => ok_reply(schema, corr.as_ref()),
                None => error_reply(format!("Schema not found: {model}"), corr.as_ref()),
            },
            Err(message) => error_reply(message, corr.as_ref()),
        };
        self.reply(origin, reply).await;
    }

    /// Scope-limited cache invalidation derived from the caller's identity.
    /// Anonymous callers clear everything (preserved historical behavior).
    async fn handle_clear_cache(&self, origin: &ConnectionId, corr: Option<Correlation>) {
        let ctx = self.registry.auth_context(origin).await;
        let (scope_label, removed) = if ctx.is_anonymous() {
            tracing::warn!(connection_id = %origin, "Anonymous clear_cache clears all scopes");
            ("all".to_string(), self.cache.clear_all())
        } else if matches!(ctx.scope, AuthScope::Application | AuthScope::Dual) {
            (
                format!("app {}", ctx.app_name),
                self.cache.clear_for_app(&ctx.app_name),
            )
        } else {
            (
                format!("user {}", ctx.user_id),
                self.cache.clear_for_user(&ctx.user_id),
            )
        };

        tracing::info!(
            connection_id = %origin,
            scope = %scope_label,
            removed = removed,
            "Cache cleared"
        );
        let body = echo(
            serde_json::json!({
                "result": format!("Cache cleared ({scope_label})"),
                "stats": self.cache.stats(),
            }),
            corr.as_ref(),
        );
        self.reply(origin, body).await;
    }

    async fn handle_cache_stats(&self, origin: &ConnectionId, corr: Option<Correlation>) {
        let body = ok_reply(
            serde_json::json!({ "query_cache": self.cache.stats() }),
            corr.as_ref(),
        );
        self.reply(origin, body).await;
    }

    async fn handle_set_ttl(
        &self,
        origin: &ConnectionId,
        envelope: &Envelope,
        corr: Option<Correlation>,
    ) {
        let reply = match envelope.optional_i64("ttl") {
            Some(ttl) if ttl >= 0 => match self.cache.set_default_ttl(ttl as u64) {
                Ok(()) => ok_reply(
                    Value::from(format!("Query cache TTL set to {ttl}s")),
                    corr.as_ref(),
                ),
                Err(err) => error_reply(err.to_string(), corr.as_ref()),
            },
            Some(ttl) => error_reply(
                format!("TTL must be between {TTL_MIN_SECS} and {TTL_MAX_SECS} seconds, got {ttl}"),
                corr.as_ref(),
            ),
            None => error_reply("Missing required parameter: ttl", corr.as_ref()),
        };
        self.reply(origin, reply).await;
    }

    async fn handle_discover(&self, origin: &ConnectionId, corr: Option<Correlation>) {
        let body = echo(
            serde_json::json!({
                "models": self.collaborators.schemas.models(),
                "operations": self.collaborators.schemas.operations(),
            }),
            corr.as_ref(),
        );
        self.reply(origin, body).await;
    }

    async fn handle_introspect(
        &self,
        origin: &ConnectionId,
        envelope: &Envelope,
        corr: Option<Correlation>,
    ) {
        let reply = match self
            .collaborators
            .schemas
            .introspect(envelope.optional_str("model"))
        {
            Ok(meta) => ok_reply(meta, corr.as_ref()),
            Err(err) => error_reply(err.to_string(), corr.as_ref()),
        };
        self.reply(origin, reply).await;
    }

    /// `execute_walker` / `load_page`: start a step sequence. Chunks flow
    /// from the bridge; only start-up failures reply directly here.
    async fn handle_walker_start(
        &self,
        origin: &ConnectionId,
        envelope: &Envelope,
        corr: Option<Correlation>,
    ) {
        let file = match envelope.require_str("zVaFile") {
            Ok(file) => file.to_string(),
            Err(message) => {
                self.reply(origin, error_reply(message, corr.as_ref())).await;
                return;
            }
        };
        let source = WalkerSource {
            file,
            folder: envelope.optional_str("zVaFolder").unwrap_or("").to_string(),
            block: envelope.optional_str("zBlock").unwrap_or("").to_string(),
        };

        match self.collaborators.walkers.start(&source) {
            Ok(sequence) => {
                let outcome = self.bridge.start(origin, sequence, source, corr).await;
                tracing::debug!(connection_id = %origin, outcome = ?outcome, "Walker started");
            }
            Err(err) => {
                self.reply(origin, error_reply(err.to_string(), corr.as_ref()))
                    .await;
            }
        }
    }

    /// `form_submit`: validate via the form collaborator, report the
    /// outcome, then resume any suspended walker on success.
    async fn handle_form_submit(
        &self,
        origin: &ConnectionId,
        envelope: &Envelope,
        corr: Option<Correlation>,
    ) {
        let data = envelope.get("data").cloned().unwrap_or(Value::Null);
        let outcome = self
            .collaborators
            .forms
            .submit(
                &data,
                envelope.get("onSubmit"),
                envelope.optional_str("model"),
            )
            .await;

        let mut body = serde_json::json!({
            "success": outcome.success,
            "message": outcome.message,
        });
        if !outcome.errors.is_empty() {
            body["errors"] = Value::Array(outcome.errors.clone());
        }
        self.reply(origin, echo(body, corr.as_ref())).await;

        if outcome.success {
            let resumed = self.bridge.resume(origin).await;
            tracing::debug!(connection_id = %origin, outcome = ?resumed, "Post-submit resume");
        }
    }

    /// Bind a session-tier or application-tier identity to the connection.
    async fn handle_authenticate(
        &self,
        origin: &ConnectionId,
        envelope: &Envelope,
        corr: Option<Correlation>,
    ) {
        let user_id = match envelope.require_str("userID") {
            Ok(user_id) => user_id.to_string(),
            Err(message) => {
                self.reply(origin, error_reply(message, corr.as_ref())).await;
                return;
            }
        };
        let identity = Identity {
            user_id,
            app_name: envelope.optional_str("appName").unwrap_or("unknown").to_string(),
            role: envelope.optional_str("role").unwrap_or("guest").to_string(),
        };
        let tier = envelope.optional_str("tier").unwrap_or("application");

        match tier {
            "session" => {
                self.registry.bind_session_identity(origin, identity).await;
            }
            "application" => {
                self.registry.bind_app_identity(origin, identity).await;
            }
            other => {
                self.reply(
                    origin,
                    error_reply(format!("Unknown auth tier: {other}"), corr.as_ref()),
                )
                .await;
                return;
            }
        }

        let ctx = self.registry.auth_context(origin).await;
        tracing::info!(
            connection_id = %origin,
            user_id = %ctx.user_id,
            scope = ctx.scope_tag(),
            "Identity bound"
        );
        self.reply(
            origin,
            ok_reply(
                Value::from(format!("Authenticated ({})", ctx.scope_tag())),
                corr.as_ref(),
            ),
        )
        .await;
    }

    /// `logout`: drop identity bindings and invalidate the user's cache
    /// entries.
    async fn handle_logout(&self, origin: &ConnectionId, corr: Option<Correlation>) {
        let previous = self.registry.clear_auth(origin).await;
        let removed = if previous.is_anonymous() {
            0
        } else {
            self.cache.clear_for_user(&previous.user_id)
        };
        tracing::info!(
            connection_id = %origin,
            user_id = %previous.user_id,
            removed = removed,
            "Logged out"
        );
        self.reply(origin, ok_reply(Value::from("Logged out"), corr.as_ref()))
            .await;
    }

    /// Generic command dispatch on `zKey` | `cmd`, with cache-aware reads.
    async fn handle_generic(
        &self,
        origin: &ConnectionId,
        envelope: &Envelope,
        corr: Option<Correlation>,
    ) {
        let command = match envelope.optional_str("zKey").or(envelope.optional_str("cmd")) {
            Some(command) => command.to_string(),
            None => {
                let reply = match envelope.resolved_event() {
                    Some(event) => error_reply(format!("Unknown event: {event}"), corr.as_ref()),
                    None => error_reply("Missing command", corr.as_ref()),
                };
                self.reply(origin, reply).await;
                return;
            }
        };

        let ttl_override = match envelope.optional_i64("cache_ttl") {
            Some(ttl) if (TTL_MIN_SECS as i64..=TTL_MAX_SECS as i64).contains(&ttl) => {
                Some(ttl as u64)
            }
            Some(ttl) => {
                self.reply(
                    origin,
                    error_reply(
                        format!(
                            "TTL must be between {TTL_MIN_SECS} and {TTL_MAX_SECS} seconds, got {ttl}"
                        ),
                        corr.as_ref(),
                    ),
                )
                .await;
                return;
            }
            None => None,
        };

        let args = envelope.get("zHorizontal").cloned().unwrap_or(Value::Null);
        let no_cache = envelope.optional_bool("no_cache").unwrap_or(false);
        let cacheable = is_cacheable(&command, envelope.resolved_event());

        let ctx = self.registry.auth_context(origin).await;
        let identity = (!ctx.is_anonymous()).then_some(&ctx);
        let key = generate_key(&command, &args, identity);

        if cacheable && !no_cache {
            if let Some(hit) = self.cache.get(&key) {
                tracing::debug!(connection_id = %origin, command = %command, "Cache hit");
                let body = echo(
                    serde_json::json!({ "result": hit, "_cached": true }),
                    corr.as_ref(),
                );
                let text = body.to_string();
                self.registry.send_to(origin, text.clone()).await;
                self.registry.broadcast_except(origin, &text).await;
                return;
            }
        }

        match self.collaborators.executor.execute(&command, &args).await {
            Ok(result) => {
                if cacheable {
                    // TTL was validated above, so put cannot fail on range.
                    if let Err(err) =
                        self.cache
                            .put(key.as_str(), result.clone(), ttl_override, identity)
                    {
                        tracing::warn!(command = %command, error = %err, "Cache put failed");
                    }
                }
                let body = ok_reply(result, corr.as_ref());
                let text = body.to_string();
                self.registry.send_to(origin, text.clone()).await;
                self.registry.broadcast_except(origin, &text).await;
            }
            Err(err) => {
                tracing::warn!(connection_id = %origin, command = %command, error = %err, "Command failed");
                self.reply(origin, error_reply(err.to_string(), corr.as_ref()))
                    .await;
            }
        }
    }
}
