//! One-shot commands against a configured engine. Results go to stdout as
//! JSON so they can be piped into other tooling.

use std::io::{self, Write};

use anyhow::{Context, Result};
use serde_json::{Value, json};
use session_engine::{CrossSigningKeys, SessionEngine};

fn emit(value: &Value) -> Result<()> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, value)?;
    writeln!(stdout)?;
    Ok(())
}

pub fn identity(engine: &SessionEngine) -> Result<()> {
    emit(&json!({
        "user_id": engine.user_id(),
        "device_id": engine.device_id(),
        "keys": {
            (format!("curve25519:{}", engine.device_id())): engine.identity_key().to_base64(),
            (format!("ed25519:{}", engine.device_id())): engine.signing_key().to_base64(),
        },
    }))
}

pub fn one_time_keys(engine: &SessionEngine, count: usize) -> Result<()> {
    let keys = engine
        .generate_one_time_keys(count)
        .context("failed to generate one-time keys")?;
    let keys: Vec<String> = keys.iter().map(|key| key.to_base64()).collect();
    tracing::info!(count = keys.len(), "generated one-time keys");
    emit(&json!({ "one_time_keys": keys }))
}

/// Generate a fresh cross-signing set, sign it with the device, and print
/// both the exportable seeds and the signed public objects.
pub fn cross_signing(engine: &SessionEngine) -> Result<()> {
    let backend = double_ratchets::backend::active().context("no ratchet backend installed")?;
    let keys = CrossSigningKeys::generate(backend).context("failed to generate keys")?;
    let upload = engine
        .publish_cross_signing(&keys)
        .context("failed to sign cross-signing keys")?;
    emit(&json!({
        "seeds": serde_json::to_value(keys.export())?,
        "upload": serde_json::to_value(&upload)?,
    }))
}

pub fn export_session(engine: &SessionEngine, room_id: &str, session_id: &str) -> Result<()> {
    let exported = engine
        .export_group_session(room_id, session_id, None)
        .with_context(|| format!("failed to export {session_id}"))?;
    emit(&json!({
        "room_id": room_id,
        "session_id": session_id,
        "session_key": exported,
    }))
}

pub fn prune(engine: &SessionEngine) -> Result<()> {
    let report = engine.prune().context("failed to prune store")?;
    emit(&json!({
        "message_hashes": report.message_hashes,
        "redacted_sessions": report.redacted_sessions,
    }))
}
