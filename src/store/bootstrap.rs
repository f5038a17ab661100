use sqlx::PgPool;
use uuid::Uuid;

use crate::auth::token;

struct TemplateDef {
    name: &'static str,
    image: &'static str,
    vnc_port: i32,
    persistent_home: bool,
    description: &'static str,
}

const SYSTEM_TEMPLATES: &[TemplateDef] = &[
    TemplateDef {
        name: "firefox",
        image: "streamspace/firefox:latest",
        vnc_port: 5901,
        persistent_home: true,
        description: "Firefox browser session",
    },
    TemplateDef {
        name: "chromium",
        image: "streamspace/chromium:latest",
        vnc_port: 5901,
        persistent_home: true,
        description: "Chromium browser session",
    },
    TemplateDef {
        name: "xfce-desktop",
        image: "streamspace/xfce:latest",
        vnc_port: 5901,
        persistent_home: true,
        description: "Full XFCE desktop",
    },
];

/// First-run seeding: session templates and the admin API token.
#[tracing::instrument(skip(pool, admin_token), err)]
pub async fn run(pool: &PgPool, admin_token: Option<&str>) -> anyhow::Result<()> {
    for tpl in SYSTEM_TEMPLATES {
        sqlx::query(
            "INSERT INTO templates (name, image, vnc_port, persistent_home, description)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (name) DO NOTHING",
        )
        .bind(tpl.name)
        .bind(tpl.image)
        .bind(tpl.vnc_port)
        .bind(tpl.persistent_home)
        .bind(tpl.description)
        .execute(pool)
        .await?;
    }
    tracing::info!(count = SYSTEM_TEMPLATES.len(), "templates seeded");

    let token_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM api_tokens")
        .fetch_one(pool)
        .await?;

    if token_count > 0 {
        tracing::info!("bootstrap skipped — api tokens already exist");
        return Ok(());
    }

    // Either the operator supplied the admin token or we mint one and log it
    // exactly once.
    let (raw, hash) = match admin_token {
        Some(raw) => (raw.to_owned(), token::hash_token(raw)),
        None => token::generate_api_token(),
    };

    sqlx::query(
        "INSERT INTO api_tokens (id, token_hash, principal, is_active)
         VALUES ($1, $2, 'admin', true)",
    )
    .bind(Uuid::new_v4())
    .bind(&hash)
    .execute(pool)
    .await?;

    if admin_token.is_some() {
        tracing::info!("admin api token installed from configuration");
    } else {
        tracing::warn!(token = %raw, "generated admin api token — store it now, it is not shown again");
    }

    Ok(())
}
