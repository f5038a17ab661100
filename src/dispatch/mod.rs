//! Command dispatcher: persist intent, deliver to agents, track outcomes,
//! retry across reconnects, enforce deadlines.
//!
//! Every lifecycle transition is a conditional UPDATE naming the expected
//! prior status, so concurrent acks/results/sweeps converge instead of
//! losing updates. Response handlers are idempotent; agents always include
//! the command id.

use std::time::Duration;

use serde_json::json;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::channel::ChannelMessage;
use crate::hub::{Delivery, HubError, Outbound};
use crate::model::{
    CommandRecord, CommandType, SessionRecord, SessionState, SessionTemplate, StartSessionSpec,
};
use crate::proxy::CloseReason;
use crate::store::AppState;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("no available agent for platform {platform}")]
    NoAvailableAgent {
        platform: String,
        region: Option<String>,
    },
    #[error("session not found")]
    SessionNotFound,
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("unknown template: {0}")]
    UnknownTemplate(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<HubError> for DispatchError {
    fn from(err: HubError) -> Self {
        Self::Other(err.into())
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Persist a command for a session and attempt immediate delivery. For
/// `start_session` this also schedules: an agent is selected and bound to
/// both the command and the session in one transaction. Returns the command
/// id; a `NotConnected` agent leaves the command `pending` for redelivery
/// on reconnect.
#[tracing::instrument(skip(state), fields(%session_id, %command_type), err)]
pub async fn dispatch(
    state: &AppState,
    session_id: Uuid,
    command_type: CommandType,
) -> Result<Uuid, DispatchError> {
    let session = fetch_session(&state.pool, session_id)
        .await?
        .ok_or(DispatchError::SessionNotFound)?;

    let command_id = match command_type {
        CommandType::StartSession => schedule_start(state, &session).await?,
        _ => {
            let agent_id = session.agent_id.clone().ok_or_else(|| {
                DispatchError::InvalidState("session is not bound to an agent".into())
            })?;

            if command_type == CommandType::StopSession {
                sqlx::query(
                    "UPDATE sessions SET state = 'terminating', updated_at = now()
                     WHERE id = $1 AND state IN ('pending', 'running', 'hibernated')",
                )
                .bind(session_id)
                .execute(&state.pool)
                .await?;
            }

            let command_id = Uuid::new_v4();
            sqlx::query(
                "INSERT INTO agent_commands (id, agent_id, session_id, command_type, command_data)
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(command_id)
            .bind(&agent_id)
            .bind(session_id)
            .bind(command_type.as_str())
            .bind(json!({}))
            .execute(&state.pool)
            .await?;
            command_id
        }
    };

    try_deliver(state, command_id).await?;
    Ok(command_id)
}

/// Agent selection for a session-creating command: the least-loaded online
/// agent matching platform and (when given) region, with free capacity.
/// Binds agent to session and command in the same transaction and books the
/// session slot.
async fn schedule_start(state: &AppState, session: &SessionRecord) -> Result<Uuid, DispatchError> {
    let template = resolve_template(&state.pool, &session.template).await?;
    let payload = serde_json::to_value(StartSessionSpec {
        template,
        principal: session.principal.clone(),
    })
    .map_err(|e| DispatchError::Other(e.into()))?;

    let mut tx: Transaction<'_, Postgres> = state.pool.begin().await?;

    let agent_id: Option<String> = sqlx::query_scalar(
        r"
        SELECT agent_id FROM agents
        WHERE status = 'online'
          AND platform = $1
          AND ($2::text IS NULL OR region = $2)
          AND current_sessions < LEAST(max_sessions, $3)
        ORDER BY current_sessions ASC
        LIMIT 1
        FOR UPDATE
        ",
    )
    .bind(&session.platform)
    .bind(&session.region)
    .bind(state.config.max_sessions_per_agent)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(agent_id) = agent_id else {
        tx.rollback().await?;
        sqlx::query(
            "UPDATE sessions SET state = 'failed', error_message = $2, updated_at = now()
             WHERE id = $1 AND state = 'pending'",
        )
        .bind(session.id)
        .bind(format!(
            "ScheduleError: no available agent for platform {}",
            session.platform
        ))
        .execute(&state.pool)
        .await?;

        return Err(DispatchError::NoAvailableAgent {
            platform: session.platform.clone(),
            region: session.region.clone(),
        });
    };

    sqlx::query(
        "UPDATE agents SET current_sessions = current_sessions + 1, updated_at = now()
         WHERE agent_id = $1",
    )
    .bind(&agent_id)
    .execute(&mut *tx)
    .await?;

    sqlx::query("UPDATE sessions SET agent_id = $2, updated_at = now() WHERE id = $1")
        .bind(session.id)
        .bind(&agent_id)
        .execute(&mut *tx)
        .await?;

    let command_id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO agent_commands (id, agent_id, session_id, command_type, command_data)
         VALUES ($1, $2, $3, 'start_session', $4)",
    )
    .bind(command_id)
    .bind(&agent_id)
    .bind(session.id)
    .bind(&payload)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    tracing::info!(session_id = %session.id, %agent_id, "session scheduled");
    Ok(command_id)
}

/// The channel frame for a persisted command. Tunnel control goes out as
/// the dedicated `vnc_open`/`vnc_close` frames; everything else is wrapped
/// in the generic `command` envelope.
fn command_frame(command: &CommandRecord, command_type: CommandType) -> ChannelMessage {
    match command_type {
        CommandType::VncOpen => ChannelMessage::VncOpen {
            command_id: command.id,
            session_id: command.session_id,
        },
        CommandType::VncClose => ChannelMessage::VncClose {
            command_id: command.id,
            session_id: command.session_id,
        },
        _ => ChannelMessage::Command {
            command_id: command.id,
            session_id: command.session_id,
            command_type,
            payload: command.command_data.clone(),
        },
    }
}

/// Push a persisted command onto its agent's channel. `pending → sent` only
/// happens when the hub actually delivered.
async fn try_deliver(state: &AppState, command_id: Uuid) -> Result<Delivery, DispatchError> {
    let Some(command) = fetch_command(&state.pool, command_id).await? else {
        return Ok(Delivery::NotConnected);
    };
    let Some(agent_id) = command.agent_id.clone() else {
        return Ok(Delivery::NotConnected);
    };
    let Ok(command_type) = command.command_type.parse::<CommandType>() else {
        return Ok(Delivery::NotConnected);
    };

    let message = command_frame(&command, command_type);
    let delivery = state.hub.send(&agent_id, Outbound::Message(message)).await?;
    if delivery == Delivery::Delivered {
        sqlx::query(
            "UPDATE agent_commands SET status = 'sent', sent_at = now()
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(command.id)
        .execute(&state.pool)
        .await?;
    }
    Ok(delivery)
}

// ---------------------------------------------------------------------------
// Agent responses
// ---------------------------------------------------------------------------

/// Idempotent `sent → acked`.
pub async fn on_ack(state: &AppState, command_id: Uuid) -> Result<(), DispatchError> {
    sqlx::query(
        "UPDATE agent_commands SET status = 'acked', acked_at = now()
         WHERE id = $1 AND status = 'sent'",
    )
    .bind(command_id)
    .execute(&state.pool)
    .await?;
    Ok(())
}

/// Idempotent completion. A result arriving after the deadline swept the
/// command to `timeout` is recorded for audit but resurrects nothing.
#[tracing::instrument(skip(state, result), fields(%command_id), err)]
pub async fn on_complete(
    state: &AppState,
    command_id: Uuid,
    result: Option<serde_json::Value>,
) -> Result<(), DispatchError> {
    let updated: Option<CommandRecord> = sqlx::query_as(
        "UPDATE agent_commands
         SET status = 'completed', completed_at = now(), result = $2
         WHERE id = $1 AND status IN ('sent', 'acked')
         RETURNING *",
    )
    .bind(command_id)
    .bind(&result)
    .fetch_optional(&state.pool)
    .await?;

    let Some(command) = updated else {
        record_late_result(state, command_id, result, "completed").await?;
        return Ok(());
    };

    apply_completion(state, &command).await
}

/// Idempotent failure by agent report.
#[tracing::instrument(skip(state), fields(%command_id), err)]
pub async fn on_fail(
    state: &AppState,
    command_id: Uuid,
    error: &str,
) -> Result<(), DispatchError> {
    let updated: Option<CommandRecord> = sqlx::query_as(
        "UPDATE agent_commands
         SET status = 'failed', completed_at = now(), error_message = $2
         WHERE id = $1 AND status IN ('sent', 'acked')
         RETURNING *",
    )
    .bind(command_id)
    .bind(error)
    .fetch_optional(&state.pool)
    .await?;

    let Some(command) = updated else {
        record_late_result(state, command_id, Some(json!({ "error": error })), "failed").await?;
        return Ok(());
    };

    apply_failure(state, &command, error).await
}

/// Unsolicited state change reported by the agent (e.g. pod crashed).
#[tracing::instrument(skip(state), fields(%session_id), err)]
pub async fn on_session_event(
    state: &AppState,
    session_id: Uuid,
    new_state: SessionState,
    message: Option<&str>,
) -> Result<(), DispatchError> {
    sqlx::query(
        "UPDATE sessions
         SET state = $2, error_message = COALESCE($3, error_message), updated_at = now()
         WHERE id = $1 AND state NOT IN ('terminated')",
    )
    .bind(session_id)
    .bind(new_state.as_str())
    .bind(message)
    .execute(&state.pool)
    .await?;

    if new_state.is_terminal() {
        state
            .vnc
            .close_session(session_id, CloseReason::SessionTerminated);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Channel churn
// ---------------------------------------------------------------------------

/// Channel lost before ack: those commands go back to `pending` so the next
/// reconnect redelivers them. Running sessions carry a degraded note until
/// the agent returns.
#[tracing::instrument(skip(state), err)]
pub async fn on_agent_lost(state: &AppState, agent_id: &str) -> Result<(), DispatchError> {
    // Guarded on the agent actually being offline: when a rebind on another
    // replica closes this channel, the row is already online again and the
    // freshly re-sent commands must not be demoted.
    let demoted = sqlx::query(
        "UPDATE agent_commands SET status = 'pending'
         WHERE agent_id = $1 AND status = 'sent'
           AND NOT EXISTS (
               SELECT 1 FROM agents WHERE agent_id = $1 AND status = 'online'
           )",
    )
    .bind(agent_id)
    .execute(&state.pool)
    .await?
    .rows_affected();

    sqlx::query(
        "UPDATE sessions SET error_message = 'agent disconnected; awaiting recovery', updated_at = now()
         WHERE agent_id = $1 AND state = 'running'
           AND NOT EXISTS (
               SELECT 1 FROM agents WHERE agent_id = $1 AND status = 'online'
           )",
    )
    .bind(agent_id)
    .execute(&state.pool)
    .await?;

    if demoted > 0 {
        tracing::info!(%agent_id, demoted, "unacked commands queued for redelivery");
    }
    Ok(())
}

/// Redeliver everything still owed to a reconnected agent, oldest first.
/// Every delivery on this path increments `retry_count`: the dispatch-time
/// attempt counts as the first, so even a command that never left `pending`
/// lands at retry_count = 1 after a reconnect.
#[tracing::instrument(skip(state), err)]
pub async fn on_agent_reconnect(state: &AppState, agent_id: &str) -> Result<(), DispatchError> {
    sqlx::query(
        "UPDATE sessions SET error_message = NULL, updated_at = now()
         WHERE agent_id = $1 AND state = 'running'
           AND error_message = 'agent disconnected; awaiting recovery'",
    )
    .bind(agent_id)
    .execute(&state.pool)
    .await?;

    let timeout_secs = state.config.command_timeout.as_secs_f64();
    let outstanding: Vec<CommandRecord> = sqlx::query_as(
        "SELECT * FROM agent_commands
         WHERE agent_id = $1 AND status IN ('pending', 'sent')
           AND created_at + make_interval(secs => $2) > now()
         ORDER BY created_at ASC",
    )
    .bind(agent_id)
    .bind(timeout_secs)
    .fetch_all(&state.pool)
    .await?;

    for command in outstanding {
        let Ok(command_type) = command.command_type.parse::<CommandType>() else {
            continue;
        };
        let message = command_frame(&command, command_type);
        let delivery = state.hub.send(agent_id, Outbound::Message(message)).await?;
        if delivery == Delivery::Delivered {
            sqlx::query(
                "UPDATE agent_commands
                 SET status = 'sent', sent_at = now(), retry_count = retry_count + 1
                 WHERE id = $1 AND status IN ('pending', 'sent')",
            )
            .bind(command.id)
            .execute(&state.pool)
            .await?;
            tracing::info!(command_id = %command.id, %agent_id, "command redelivered");
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Deadline sweeper
// ---------------------------------------------------------------------------

/// Background task enforcing command deadlines.
pub async fn run_sweeper(state: AppState, mut shutdown: tokio::sync::watch::Receiver<()>) {
    let period = Duration::from_secs((state.config.command_timeout.as_secs() / 10).clamp(5, 30));
    tracing::info!(?period, "command sweeper started");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                tracing::info!("command sweeper shutting down");
                break;
            }
            () = tokio::time::sleep(period) => {
                if let Err(e) = sweep_timeouts(&state).await {
                    tracing::error!(error = %e, "timeout sweep failed");
                }
            }
        }
    }
}

/// One sweep: expire commands past their deadline, fail commands whose
/// agent was removed, escalate session-critical losses.
pub async fn sweep_timeouts(state: &AppState) -> Result<(), DispatchError> {
    let timeout_secs = state.config.command_timeout.as_secs_f64();
    let timed_out: Vec<CommandRecord> = sqlx::query_as(
        "UPDATE agent_commands
         SET status = 'timeout', completed_at = now(),
             error_message = COALESCE(error_message, 'command deadline exceeded')
         WHERE status IN ('pending', 'sent', 'acked')
           AND created_at + make_interval(secs => $1) < now()
         RETURNING *",
    )
    .bind(timeout_secs)
    .fetch_all(&state.pool)
    .await?;

    for command in &timed_out {
        tracing::warn!(command_id = %command.id, command_type = %command.command_type, "command timed out");
        escalate_if_critical(state, command, "command timed out").await?;
    }

    // Commands whose agent row was removed can never deliver.
    let orphaned: Vec<CommandRecord> = sqlx::query_as(
        "UPDATE agent_commands
         SET status = 'failed', completed_at = now(), error_message = 'agent removed'
         WHERE agent_id IS NULL AND status IN ('pending', 'sent')
         RETURNING *",
    )
    .fetch_all(&state.pool)
    .await?;

    for command in &orphaned {
        tracing::warn!(command_id = %command.id, "command failed: agent removed");
        escalate_if_critical(state, command, "agent removed").await?;
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Session transitions
// ---------------------------------------------------------------------------

async fn apply_completion(state: &AppState, command: &CommandRecord) -> Result<(), DispatchError> {
    let Ok(command_type) = command.command_type.parse::<CommandType>() else {
        return Ok(());
    };

    match command_type {
        CommandType::StartSession => {
            sqlx::query(
                "UPDATE sessions
                 SET state = 'running', platform_metadata = $2,
                     error_message = NULL, updated_at = now()
                 WHERE id = $1 AND state = 'pending'",
            )
            .bind(command.session_id)
            .bind(&command.result)
            .execute(&state.pool)
            .await?;
        }
        CommandType::WakeSession => {
            // Hibernation reuses the same platform resources; only overwrite
            // metadata when the agent reported fresh values.
            sqlx::query(
                "UPDATE sessions
                 SET state = 'running',
                     platform_metadata = COALESCE($2, platform_metadata),
                     error_message = NULL, updated_at = now()
                 WHERE id = $1 AND state = 'hibernated'",
            )
            .bind(command.session_id)
            .bind(&command.result)
            .execute(&state.pool)
            .await?;
        }
        CommandType::HibernateSession => {
            sqlx::query(
                "UPDATE sessions SET state = 'hibernated', updated_at = now()
                 WHERE id = $1 AND state = 'running'",
            )
            .bind(command.session_id)
            .execute(&state.pool)
            .await?;

            state
                .vnc
                .close_session(command.session_id, CloseReason::SessionTerminated);
        }
        CommandType::StopSession => {
            sqlx::query(
                "UPDATE sessions SET state = 'terminated', agent_id = NULL, updated_at = now()
                 WHERE id = $1 AND state IN ('terminating', 'running', 'hibernated', 'pending')",
            )
            .bind(command.session_id)
            .execute(&state.pool)
            .await?;

            if let Some(agent_id) = &command.agent_id {
                release_session_slot(&state.pool, agent_id).await?;
            }
            state
                .vnc
                .close_session(command.session_id, CloseReason::SessionTerminated);
        }
        CommandType::VncOpen | CommandType::VncClose => {}
    }
    Ok(())
}

async fn apply_failure(
    state: &AppState,
    command: &CommandRecord,
    error: &str,
) -> Result<(), DispatchError> {
    let Ok(command_type) = command.command_type.parse::<CommandType>() else {
        return Ok(());
    };

    match command_type {
        CommandType::StartSession | CommandType::WakeSession | CommandType::StopSession
        | CommandType::HibernateSession => {
            sqlx::query(
                "UPDATE sessions SET state = 'failed', error_message = $2, updated_at = now()
                 WHERE id = $1 AND state NOT IN ('terminated', 'failed')",
            )
            .bind(command.session_id)
            .bind(error)
            .execute(&state.pool)
            .await?;

            if command_type == CommandType::StartSession
                && let Some(agent_id) = &command.agent_id
            {
                release_session_slot(&state.pool, agent_id).await?;
            }
            state
                .vnc
                .close_session(command.session_id, CloseReason::SessionTerminated);
        }
        CommandType::VncOpen => {
            state
                .vnc
                .close_session(command.session_id, CloseReason::AgentRejected);
        }
        CommandType::VncClose => {}
    }
    Ok(())
}

async fn escalate_if_critical(
    state: &AppState,
    command: &CommandRecord,
    reason: &str,
) -> Result<(), DispatchError> {
    let critical = command
        .command_type
        .parse::<CommandType>()
        .is_ok_and(CommandType::is_session_critical);
    if !critical {
        return Ok(());
    }

    sqlx::query(
        "UPDATE sessions SET state = 'failed', error_message = $2, updated_at = now()
         WHERE id = $1 AND state NOT IN ('terminated', 'failed')",
    )
    .bind(command.session_id)
    .bind(format!("{reason}: {}", command.command_type))
    .execute(&state.pool)
    .await?;

    state
        .vnc
        .close_session(command.session_id, CloseReason::SessionTerminated);
    Ok(())
}

/// A result that lost the race with the sweeper is kept for audit; the
/// command and session states stand.
async fn record_late_result(
    state: &AppState,
    command_id: Uuid,
    result: Option<serde_json::Value>,
    reported: &str,
) -> Result<(), DispatchError> {
    let recorded = sqlx::query(
        "UPDATE agent_commands SET late_result = $2
         WHERE id = $1 AND status = 'timeout' AND late_result IS NULL",
    )
    .bind(command_id)
    .bind(result.unwrap_or_else(|| json!({ "status": reported })))
    .execute(&state.pool)
    .await?
    .rows_affected();

    if recorded > 0 {
        tracing::warn!(%command_id, reported, "late result recorded after timeout");
    }
    Ok(())
}

async fn release_session_slot(pool: &PgPool, agent_id: &str) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE agents SET current_sessions = GREATEST(current_sessions - 1, 0), updated_at = now()
         WHERE agent_id = $1",
    )
    .bind(agent_id)
    .execute(pool)
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Lookups
// ---------------------------------------------------------------------------

pub async fn fetch_session(
    pool: &PgPool,
    session_id: Uuid,
) -> Result<Option<SessionRecord>, sqlx::Error> {
    sqlx::query_as("SELECT * FROM sessions WHERE id = $1")
        .bind(session_id)
        .fetch_optional(pool)
        .await
}

pub async fn fetch_command(
    pool: &PgPool,
    command_id: Uuid,
) -> Result<Option<CommandRecord>, sqlx::Error> {
    sqlx::query_as("SELECT * FROM agent_commands WHERE id = $1")
        .bind(command_id)
        .fetch_optional(pool)
        .await
}

/// Resolve a template name into the full definition embedded in the
/// `start_session` payload.
pub async fn resolve_template(
    pool: &PgPool,
    name: &str,
) -> Result<SessionTemplate, DispatchError> {
    #[derive(sqlx::FromRow)]
    struct TemplateRow {
        name: String,
        image: String,
        vnc_port: i32,
        env: serde_json::Value,
        cpu_limit_millis: Option<i64>,
        memory_limit_mb: Option<i64>,
        persistent_home: bool,
    }

    let row: Option<TemplateRow> = sqlx::query_as(
        "SELECT name, image, vnc_port, env, cpu_limit_millis, memory_limit_mb, persistent_home
         FROM templates WHERE name = $1",
    )
    .bind(name)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Err(DispatchError::UnknownTemplate(name.to_owned()));
    };

    let env = serde_json::from_value(row.env).unwrap_or_default();
    Ok(SessionTemplate {
        name: row.name,
        image: row.image,
        vnc_port: u16::try_from(row.vnc_port).unwrap_or(0),
        env,
        cpu_limit_millis: row.cpu_limit_millis,
        memory_limit_mb: row.memory_limit_mb,
        persistent_home: row.persistent_home,
    })
}
