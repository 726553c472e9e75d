//! Inspect and toggle credentials in a relaydesk database.
//!
//! Usage: cargo run --bin credential_admin <relaydesk.db> <list|enable ID|disable ID>
//!
//! The running bot picks up changes on its next credential refresh.

use std::path::Path;

use rusqlite::{Connection, params};

struct ModelRow {
    model: String,
    quota_limit: i64,
    window_kind: String,
    used: Option<i64>,
    throttled_until: Option<String>,
}

struct CredentialRow {
    id: String,
    family: String,
    state: String,
    priority: i64,
    models: Vec<ModelRow>,
}

fn load(conn: &Connection) -> rusqlite::Result<Vec<CredentialRow>> {
    let mut stmt = conn.prepare("SELECT id, family, state, priority FROM credentials ORDER BY priority, id")?;
    let mut rows: Vec<CredentialRow> = stmt
        .query_map([], |row| {
            Ok(CredentialRow {
                id: row.get(0)?,
                family: row.get(1)?,
                state: row.get(2)?,
                priority: row.get(3)?,
                models: Vec::new(),
            })
        })?
        .collect::<Result<_, _>>()?;

    let mut stmt = conn.prepare(
        "SELECT m.model, m.quota_limit, m.window_kind, u.used, m.throttled_until
         FROM credential_models m
         LEFT JOIN usage u ON u.credential_id = m.credential_id AND u.model = m.model
         WHERE m.credential_id = ?1
         ORDER BY m.model",
    )?;
    for row in &mut rows {
        row.models = stmt
            .query_map(params![row.id], |r| {
                Ok(ModelRow {
                    model: r.get(0)?,
                    quota_limit: r.get(1)?,
                    window_kind: r.get(2)?,
                    used: r.get(3)?,
                    throttled_until: r.get(4)?,
                })
            })?
            .collect::<Result<_, _>>()?;
    }
    Ok(rows)
}

fn list(conn: &Connection) -> Result<(), String> {
    let rows = load(conn).map_err(|e| format!("Failed to read credentials: {e}"))?;
    if rows.is_empty() {
        println!("No credentials stored.");
        return Ok(());
    }
    for row in rows {
        println!("{} [{}] priority {} - {}", row.id, row.family, row.priority, row.state);
        for m in row.models {
            let throttle = m
                .throttled_until
                .map(|t| format!(", throttled until {t}"))
                .unwrap_or_default();
            println!(
                "    {}: {}/{} per {} window{}",
                m.model,
                m.used.unwrap_or(0),
                m.quota_limit,
                m.window_kind,
                throttle
            );
        }
    }
    Ok(())
}

fn set_state(conn: &mut Connection, id: &str, enable: bool) -> Result<(), String> {
    let tx = conn.transaction().map_err(|e| e.to_string())?;
    let state = if enable { "enabled" } else { "disabled" };
    let changed = tx
        .execute("UPDATE credentials SET state = ?1 WHERE id = ?2", params![state, id])
        .map_err(|e| e.to_string())?;
    if changed == 0 {
        return Err(format!("No credential with id {id}"));
    }
    if enable {
        // Throttles are cleared too so the operator gets the credential back immediately.
        tx.execute(
            "UPDATE credential_models SET throttled_until = NULL WHERE credential_id = ?1",
            params![id],
        )
        .map_err(|e| e.to_string())?;
    }
    tx.commit().map_err(|e| e.to_string())?;
    println!("Credential {id} is now {state}");
    Ok(())
}

fn run(args: &[String]) -> Result<(), String> {
    let db_path = Path::new(&args[1]);
    if !db_path.exists() {
        return Err(format!("Database {:?} does not exist", db_path));
    }
    let mut conn = Connection::open(db_path).map_err(|e| format!("Failed to open database: {e}"))?;

    match (args[2].as_str(), args.get(3)) {
        ("list", None) => list(&conn),
        ("enable", Some(id)) => set_state(&mut conn, id, true),
        ("disable", Some(id)) => set_state(&mut conn, id, false),
        _ => Err(usage(&args[0])),
    }
}

fn usage(program: &str) -> String {
    format!(
        "Usage: {program} <relaydesk.db> <command>\n\n\
         Commands:\n  \
           list          Show credentials, per-model quota usage and throttles\n  \
           enable <id>   Re-enable a credential and clear its model throttles\n  \
           disable <id>  Take a credential out of rotation"
    )
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 || args.len() > 4 {
        let program = args.first().map(String::as_str).unwrap_or("credential_admin");
        eprintln!("{}", usage(program));
        std::process::exit(1);
    }

    if let Err(e) = run(&args) {
        eprintln!("ERROR: {e}");
        std::process::exit(1);
    }
}
